//! The seam between the engine and the adapter's work and completion queues.

use crate::error::{DmaError, RingError};
use crate::request::{DataDirection, MemoryRegion};
use fcio_buffers::{ExchangeTag, SglRegistrar};
use fcio_proto::{FcpCmnd, FcpRsp, PortId};

/// Fibre Channel class of service for a remote port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServiceClass {
    Class2,
    #[default]
    Class3,
}

/// Command kind on the work queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    /// Initiator read: data flows to the host.
    Read,
    /// Initiator write: data flows to the target.
    Write,
    /// No data phase (including task management).
    Control,
}

/// One entry posted to the adapter's work queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkRequest {
    pub tag: ExchangeTag,
    pub target: PortId,
    /// Adapter handle of the remote port login.
    pub context: u16,
    pub class: ServiceClass,
    pub fcp2_recovery: bool,
    pub kind: CommandKind,
    /// 0 asks the driver to time the exchange itself.
    pub timeout_secs: u8,
    /// Expected read length, checked against what the adapter saw move.
    pub read_check: u32,
    pub cmnd_addr: u64,
    pub rsp_addr: u64,
    pub table_addr: u64,
    pub table_entries: usize,
    /// The command unit as written into the exchange area.
    pub cmnd: FcpCmnd,
}

/// Abort (or close, when the link is down) of one exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AbortRequest {
    pub tag: ExchangeTag,
    pub target: PortId,
    pub context: u16,
    /// Close the exchange locally without sending an ABTS.
    pub close: bool,
}

/// A completion queue entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawCompletion {
    pub tag: ExchangeTag,
    /// [`fcio_proto::IoStatus`] code.
    pub status: u8,
    /// Reject reason for local rejects, otherwise unused.
    pub parameter: u32,
    /// Bytes of a read the adapter did not see arrive.
    pub read_residual: u32,
    /// The adapter still holds the exchange open.
    pub exchange_busy: bool,
    /// Response unit the adapter DMA'd into the exchange area.
    pub response: Option<FcpRsp>,
}

impl RawCompletion {
    pub fn new(tag: ExchangeTag, status: u8) -> Self {
        Self {
            tag,
            status,
            parameter: 0,
            read_residual: 0,
            exchange_busy: false,
            response: None,
        }
    }
}

/// Adapter work queue. Submissions never block; completions are delivered
/// to a [`CompletionSink`] from the adapter's own context.
pub trait HardwareRing: SglRegistrar + Send + Sync {
    fn submit(&self, request: &WorkRequest) -> Result<(), RingError>;

    fn abort(&self, request: &AbortRequest) -> Result<(), RingError>;

    fn link_up(&self) -> bool;
}

/// Receiver of completion queue events.
pub trait CompletionSink: Send + Sync {
    fn complete(&self, completion: RawCompletion);

    /// The adapter reports a previously busy exchange closed.
    fn exchange_aborted(&self, tag: ExchangeTag);
}

/// Bus address range produced by mapping one [`MemoryRegion`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaSegment {
    pub bus_addr: u64,
    pub len: u32,
}

/// Maps caller memory for device access.
pub trait DmaMapper: Send + Sync {
    fn map(&self, region: &MemoryRegion, direction: DataDirection) -> Result<DmaSegment, DmaError>;

    fn unmap(&self, segment: &DmaSegment, direction: DataDirection);
}

/// Host addresses are bus addresses.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityMapper;

impl DmaMapper for IdentityMapper {
    fn map(&self, region: &MemoryRegion, _direction: DataDirection) -> Result<DmaSegment, DmaError> {
        if region.len == 0 {
            return Err(DmaError {
                addr: region.addr,
                len: region.len,
            });
        }
        Ok(DmaSegment {
            bus_addr: region.addr,
            len: region.len,
        })
    }

    fn unmap(&self, _segment: &DmaSegment, _direction: DataDirection) {}
}
