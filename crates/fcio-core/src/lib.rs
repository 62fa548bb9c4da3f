//! SCSI exchange engine for a Fibre Channel host adapter.
//!
//! [`Engine`] turns [`ScsiRequest`]s into adapter work requests, classifies
//! completions into SCSI/host status, adapts per-LUN queue depths and
//! coordinates aborts and task management.

mod abort;
pub mod classify;
pub mod config;
mod deferred;
pub mod depth;
mod engine;
pub mod error;
pub mod events;
pub mod latency;
pub mod metrics;
mod prep;
pub mod request;
pub mod ring;
pub mod stats;
pub mod target;

pub use abort::{AbortOutcome, ResetScope, TaskMgmtKind};
pub use classify::{AbortCause, Classified, ClassifyContext, DepthSignal, classify};
pub use config::{BucketKind, EngineConfig, EngineFlags, LatencyConfig, MAX_SG_SEGMENTS};
pub use deferred::WorkerHandle;
pub use engine::Engine;
pub use error::{
    AbortError, AbortErrorKind, ConfigError, DispatchError, DispatchErrorKind, DmaError,
    PrepareError, RingError, RingErrorKind,
};
pub use events::{ChannelEventSink, DepthChange, EventSink, IoEvent, LogEventSink, MgmtEvent};
pub use crate::metrics::{AdapterMetrics, MetricsSnapshot, StatSnapshot};
pub use prep::timeout_field;
pub use request::{
    BusySource, Cdb, CompletionResult, DataDirection, HostStatus, IoCompletion, IoErrorKind,
    IoHandle, IoTicket, MemoryRegion, ProtocolFault, RequestId, ScsiRequest,
};
pub use ring::{
    AbortRequest, CommandKind, CompletionSink, DmaMapper, DmaSegment, HardwareRing,
    IdentityMapper, RawCompletion, ServiceClass, WorkRequest,
};
pub use stats::AdapterSnapshot;
pub use target::{
    LunQueue, LunSnapshot, Readiness, TargetContext, TargetCounter, TargetCounters,
    TargetParams, TargetSnapshot,
};
