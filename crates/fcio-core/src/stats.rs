use crate::metrics::MetricsSnapshot;
use crate::target::TargetSnapshot;
use fcio_buffers::{Generation, PoolSnapshot};
use serde::Serialize;

/// Point-in-time view of the whole engine, for diagnostics.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AdapterSnapshot {
    pub generation: Generation,
    pub pool: PoolSnapshot,
    pub metrics: MetricsSnapshot,
    pub targets: Vec<TargetSnapshot>,
    /// Deferred work items not yet applied.
    pub deferred_backlog: usize,
}

impl AdapterSnapshot {
    /// Requests in flight across all targets.
    pub fn pending(&self) -> u64 {
        self.targets.iter().map(|target| u64::from(target.pending)).sum()
    }
}
