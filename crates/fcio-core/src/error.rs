use std::fmt;

/// Why a request was refused at dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchErrorKind {
    /// Target unknown, not ready or blocked. Nothing was consumed.
    NotReady,
    /// Target or LUN depth reached, or preparation/submission failed.
    Busy,
    /// No exchange buffer available.
    HostBusy,
}

/// Errors surfaced by [`crate::Engine::dispatch`].
#[derive(Clone, Debug)]
pub struct DispatchError {
    kind: DispatchErrorKind,
    message: Option<String>,
}

impl DispatchError {
    pub fn new(kind: DispatchErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: DispatchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> DispatchErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Abort and task-management failure categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortErrorKind {
    /// The exchange or target could not be located.
    NotFound,
    /// The adapter refused the abort or task-management command.
    Submit,
    /// No exchange buffer was available for the task-management command.
    NoResources,
    /// Confirmation did not arrive within the wait bound.
    Timeout,
    /// The task-management command completed with a failure status.
    Rejected,
    /// The post-reset sweep left exchanges outstanding.
    SweepIncomplete,
}

/// Errors surfaced by the abort and task-management paths.
#[derive(Clone, Debug)]
pub struct AbortError {
    kind: AbortErrorKind,
    message: Option<String>,
}

impl AbortError {
    pub fn new(kind: AbortErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: AbortErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> AbortErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for AbortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for AbortError {}

/// Adapter ring failure categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingErrorKind {
    /// The work queue has no room.
    Full,
    /// The link or adapter is down.
    Offline,
    /// The adapter rejected the request.
    Rejected,
}

/// Synchronous failure reported by a [`crate::HardwareRing`].
#[derive(Clone, Debug)]
pub struct RingError {
    kind: RingErrorKind,
    message: Option<String>,
}

impl RingError {
    pub fn new(kind: RingErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: RingErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> RingErrorKind {
        self.kind
    }
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for RingError {}

/// DMA mapping failure for one memory region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DmaError {
    pub addr: u64,
    pub len: u32,
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to map {} bytes at {:#x}", self.len, self.addr)
    }
}

impl std::error::Error for DmaError {}

/// Command preparation failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrepareError {
    /// More memory regions than the descriptor table holds.
    TooManySegments { segments: usize, max: usize },
    /// A region could not be mapped; earlier mappings were undone.
    Mapping(DmaError),
    /// A descriptor field could not be encoded.
    Encoding(fcio_proto::ProtoError),
}

impl fmt::Display for PrepareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrepareError::TooManySegments { segments, max } => {
                write!(f, "{segments} segments exceed table maximum {max}")
            }
            PrepareError::Mapping(err) => write!(f, "dma mapping: {err}"),
            PrepareError::Encoding(err) => write!(f, "descriptor encoding: {err}"),
        }
    }
}

impl std::error::Error for PrepareError {}

impl From<DmaError> for PrepareError {
    fn from(err: DmaError) -> Self {
        PrepareError::Mapping(err)
    }
}

impl From<fcio_proto::ProtoError> for PrepareError {
    fn from(err: fcio_proto::ProtoError) -> Self {
        PrepareError::Encoding(err)
    }
}

/// Invalid engine configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigError {
    field: &'static str,
    reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }

    pub fn field(&self) -> &'static str {
        self.field
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.field, self.reason)
    }
}

impl std::error::Error for ConfigError {}
