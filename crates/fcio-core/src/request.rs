use fcio_buffers::ExchangeTag;
use fcio_proto::{MAX_CDB_LEN, PortId, RejectReason, TaskAttribute, scsi_status};
use futures_channel::oneshot;
use std::fmt;
use std::time::Duration;

/// Sense bytes passed back to the caller at most.
pub const SENSE_BUFFER_LEN: usize = 96;

/// A SCSI command descriptor block of at most 16 bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Cdb {
    bytes: [u8; MAX_CDB_LEN],
    len: u8,
}

impl Cdb {
    /// `None` when `bytes` is empty or longer than the command unit carries.
    pub fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() > MAX_CDB_LEN {
            return None;
        }
        let mut buf = [0u8; MAX_CDB_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(Self {
            bytes: buf,
            len: bytes.len() as u8,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// The full zero-padded field as written into the command unit.
    pub fn padded(&self) -> [u8; MAX_CDB_LEN] {
        self.bytes
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }
}

impl fmt::Debug for Cdb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cdb({:02x?})", self.as_bytes())
    }
}

/// Direction of the data phase, from the host's point of view.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DataDirection {
    #[default]
    None,
    /// Host to target.
    ToDevice,
    /// Target to host.
    FromDevice,
}

impl DataDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            DataDirection::None => "none",
            DataDirection::ToDevice => "write",
            DataDirection::FromDevice => "read",
        }
    }
}

/// One contiguous host memory region taking part in the data phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub addr: u64,
    pub len: u32,
}

impl MemoryRegion {
    pub const fn new(addr: u64, len: u32) -> Self {
        Self { addr, len }
    }
}

/// A SCSI command addressed to one LUN behind a remote port.
#[derive(Clone, Debug)]
pub struct ScsiRequest {
    pub target: PortId,
    pub lun: u64,
    pub cdb: Cdb,
    pub direction: DataDirection,
    /// Expected transfer length in bytes.
    pub length: u32,
    pub regions: Vec<MemoryRegion>,
    pub task_attribute: TaskAttribute,
    pub timeout: Duration,
    /// Minimum bytes that must move for a short transfer to count as good.
    pub underflow: u32,
}

impl ScsiRequest {
    /// A command with no data phase.
    pub fn control(target: PortId, lun: u64, cdb: Cdb) -> Self {
        Self {
            target,
            lun,
            cdb,
            direction: DataDirection::None,
            length: 0,
            regions: Vec::new(),
            task_attribute: TaskAttribute::Simple,
            timeout: Duration::from_secs(30),
            underflow: 0,
        }
    }

    /// A data-carrying command whose length is the sum of `regions`.
    /// `None` when the total does not fit the 32-bit FCP data length.
    pub fn with_data(
        target: PortId,
        lun: u64,
        cdb: Cdb,
        direction: DataDirection,
        regions: Vec<MemoryRegion>,
    ) -> Option<Self> {
        let length = regions
            .iter()
            .try_fold(0u32, |total, region| total.checked_add(region.len))?;
        Some(Self {
            direction,
            length,
            regions,
            underflow: length,
            ..Self::control(target, lun, cdb)
        })
    }
}

/// Engine-assigned identifier for one dispatched request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to an outstanding request, used for aborts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IoHandle {
    pub id: RequestId,
    pub tag: ExchangeTag,
    pub target: PortId,
    pub lun: u64,
}

/// Returned by a successful dispatch.
#[derive(Debug)]
pub struct IoTicket {
    pub handle: IoHandle,
    /// Resolves exactly once with the request's outcome.
    pub completion: oneshot::Receiver<IoCompletion>,
}

/// Origin of a transport busy condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusySource {
    Fabric,
    Port,
}

impl BusySource {
    pub fn as_str(self) -> &'static str {
        match self {
            BusySource::Fabric => "fabric",
            BusySource::Port => "port",
        }
    }
}

/// Protocol-level anomaly detected in an FCP response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolFault {
    /// Response info malformed or carrying a non-zero response code.
    InvalidResponseInfo,
    /// A read moved less data than the target claimed.
    DroppedFrame,
    /// Fewer bytes than the underflow threshold moved.
    Underrun,
    Overrun,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompletionResult {
    Success {
        residual: u32,
    },
    ProtocolError {
        status: u8,
        sense: Vec<u8>,
        residual: u32,
        fault: Option<ProtocolFault>,
    },
    TransportBusy(BusySource),
    LocalReject {
        reason: RejectReason,
        recoverable: bool,
    },
    Timeout,
}

/// Status the host midlayer acts on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HostStatus {
    #[default]
    Ok,
    Error,
    /// Retry after a short delay.
    BusBusy,
    TransportDisrupted,
    /// Retry immediately without counting against the retry budget.
    Requeue,
    Aborted,
}

impl HostStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HostStatus::Ok => "ok",
            HostStatus::Error => "error",
            HostStatus::BusBusy => "bus_busy",
            HostStatus::TransportDisrupted => "transport_disrupted",
            HostStatus::Requeue => "requeue",
            HostStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy callers retry or fail on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoErrorKind {
    NotReady,
    HostBusy,
    DeviceBusy,
    TransportDisrupted,
    ProtocolError,
    LocalRejectRecoverable,
    LocalRejectFatal,
    Timeout,
    ResourceExhausted,
}

impl IoErrorKind {
    /// Whether the condition is transient and the request may be retried.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            IoErrorKind::NotReady
                | IoErrorKind::HostBusy
                | IoErrorKind::DeviceBusy
                | IoErrorKind::TransportDisrupted
                | IoErrorKind::LocalRejectRecoverable
                | IoErrorKind::ResourceExhausted
        )
    }
}

/// Outcome delivered through an [`IoTicket`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IoCompletion {
    pub id: RequestId,
    pub result: CompletionResult,
    pub host_status: HostStatus,
    pub scsi_status: u8,
    pub residual: u32,
    pub sense: Vec<u8>,
}

impl IoCompletion {
    pub fn is_success(&self) -> bool {
        self.error_kind().is_none()
    }

    /// Taxonomy of the failure, or `None` for a good completion.
    pub fn error_kind(&self) -> Option<IoErrorKind> {
        match &self.result {
            CompletionResult::Success { .. } if self.host_status == HostStatus::Ok => None,
            CompletionResult::Success { .. } => Some(IoErrorKind::HostBusy),
            CompletionResult::ProtocolError { status, fault, .. } => match (fault, *status) {
                (Some(ProtocolFault::DroppedFrame | ProtocolFault::InvalidResponseInfo), _) => {
                    Some(IoErrorKind::HostBusy)
                }
                (_, scsi_status::BUSY | scsi_status::TASK_SET_FULL) => {
                    Some(IoErrorKind::DeviceBusy)
                }
                _ => Some(IoErrorKind::ProtocolError),
            },
            CompletionResult::TransportBusy(_) => Some(IoErrorKind::TransportDisrupted),
            CompletionResult::LocalReject {
                recoverable: true, ..
            } => Some(IoErrorKind::LocalRejectRecoverable),
            CompletionResult::LocalReject { .. } => Some(IoErrorKind::LocalRejectFatal),
            CompletionResult::Timeout => Some(IoErrorKind::Timeout),
        }
    }
}
