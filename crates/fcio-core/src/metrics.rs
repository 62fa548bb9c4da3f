use crate::error::DispatchErrorKind;
use crate::request::DataDirection;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct Stat {
    count: AtomicU64,
    bytes: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl Stat {
    fn observe(&self, bytes: u64, ns: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let bytes = self.bytes.load(Ordering::Relaxed);
        let total_ns = self.total_ns.load(Ordering::Relaxed);
        let max_ns = self.max_ns.load(Ordering::Relaxed);
        let avg_ns = if count == 0 {
            0.0
        } else {
            total_ns as f64 / count as f64
        };
        StatSnapshot {
            count,
            bytes,
            avg_ns,
            max_ns,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct StatSnapshot {
    pub count: u64,
    pub bytes: u64,
    pub avg_ns: f64,
    pub max_ns: u64,
}

/// Adapter-wide counters. Each observation is also exported through the
/// `metrics` facade.
#[derive(Debug, Default)]
pub struct AdapterMetrics {
    reads: Stat,
    writes: Stat,
    control: Stat,
    dispatched: AtomicU64,
    not_ready: AtomicU64,
    busy: AtomicU64,
    host_busy: AtomicU64,
    submit_failures: AtomicU64,
    aborts: AtomicU64,
    abort_timeouts: AtomicU64,
    stale_completions: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub reads: StatSnapshot,
    pub writes: StatSnapshot,
    pub control: StatSnapshot,
    pub dispatched: u64,
    pub not_ready: u64,
    pub busy: u64,
    pub host_busy: u64,
    pub submit_failures: u64,
    pub aborts: u64,
    pub abort_timeouts: u64,
    pub stale_completions: u64,
}

impl AdapterMetrics {
    pub fn record_dispatch(&self, direction: DataDirection) {
        counter!("fcio_dispatch_total", "direction" => direction.as_str()).increment(1);
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reject(&self, kind: DispatchErrorKind) {
        let cell = match kind {
            DispatchErrorKind::NotReady => {
                counter!("fcio_not_ready_total").increment(1);
                &self.not_ready
            }
            DispatchErrorKind::Busy => {
                counter!("fcio_busy_total").increment(1);
                &self.busy
            }
            DispatchErrorKind::HostBusy => {
                counter!("fcio_host_busy_total").increment(1);
                &self.host_busy
            }
        };
        cell.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_submit_failure(&self) {
        counter!("fcio_submit_failures_total").increment(1);
        self.submit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_completion(&self, direction: DataDirection, bytes: u32, dur: Duration) {
        let ns = dur.as_nanos().min(u64::MAX as u128) as u64;
        counter!("fcio_completion_total", "direction" => direction.as_str()).increment(1);
        histogram!("fcio_completion_latency_ns").record(ns as f64);
        let stat = match direction {
            DataDirection::FromDevice => {
                counter!("fcio_read_bytes").increment(u64::from(bytes));
                &self.reads
            }
            DataDirection::ToDevice => {
                counter!("fcio_write_bytes").increment(u64::from(bytes));
                &self.writes
            }
            DataDirection::None => &self.control,
        };
        stat.observe(u64::from(bytes), ns);
    }

    pub fn record_abort(&self, timed_out: bool) {
        counter!("fcio_abort_total").increment(1);
        self.aborts.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            counter!("fcio_abort_timeout_total").increment(1);
            self.abort_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_stale_completion(&self) {
        counter!("fcio_stale_completion_total").increment(1);
        self.stale_completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_in_use(&self, in_use: usize) {
        gauge!("fcio_pool_in_use").set(in_use as f64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |cell: &AtomicU64| cell.load(Ordering::Relaxed);
        MetricsSnapshot {
            reads: self.reads.snapshot(),
            writes: self.writes.snapshot(),
            control: self.control.snapshot(),
            dispatched: load(&self.dispatched),
            not_ready: load(&self.not_ready),
            busy: load(&self.busy),
            host_busy: load(&self.host_busy),
            submit_failures: load(&self.submit_failures),
            aborts: load(&self.aborts),
            abort_timeouts: load(&self.abort_timeouts),
            stale_completions: load(&self.stale_completions),
        }
    }
}
