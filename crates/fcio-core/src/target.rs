use crate::latency::LatencyHistogram;
use crate::ring::ServiceClass;
use fcio_proto::PortId;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

/// Whether discovery considers a remote port usable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Readiness {
    Ready = 0,
    NotReady = 1,
    /// Temporarily blocked by the transport (rediscovery in progress).
    Blocked = 2,
}

impl Readiness {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Readiness::Ready,
            2 => Readiness::Blocked,
            _ => Readiness::NotReady,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Readiness::Ready => "ready",
            Readiness::NotReady => "not_ready",
            Readiness::Blocked => "blocked",
        }
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Login parameters the preparer copies into every submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetParams {
    /// Adapter handle of the port login.
    pub context: u16,
    pub class: ServiceClass,
    pub fcp2_recovery: bool,
}

impl Default for TargetParams {
    fn default() -> Self {
        Self {
            context: 0,
            class: ServiceClass::Class3,
            fcp2_recovery: false,
        }
    }
}

/// Per-target error counters.
#[derive(Debug, Default)]
pub struct TargetCounters {
    pub fcp_err: AtomicU64,
    pub abts: AtomicU64,
    pub seq_timeout: AtomicU64,
    pub invalid_rpi: AtomicU64,
    pub no_resources: AtomicU64,
    pub reject_other: AtomicU64,
    pub transport_busy: AtomicU64,
    pub busy_rejects: AtomicU64,
    pub lun_resets: AtomicU64,
    pub target_resets: AtomicU64,
    pub completed: AtomicU64,
}

/// Counter a classified completion bumps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetCounter {
    FcpErr,
    Abts,
    SeqTimeout,
    InvalidRpi,
    NoResources,
    RejectOther,
    TransportBusy,
}

impl TargetCounters {
    pub fn bump(&self, counter: TargetCounter) {
        let cell = match counter {
            TargetCounter::FcpErr => &self.fcp_err,
            TargetCounter::Abts => &self.abts,
            TargetCounter::SeqTimeout => &self.seq_timeout,
            TargetCounter::InvalidRpi => &self.invalid_rpi,
            TargetCounter::NoResources => &self.no_resources,
            TargetCounter::RejectOther => &self.reject_other,
            TargetCounter::TransportBusy => &self.transport_busy,
        };
        cell.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        for cell in [
            &self.fcp_err,
            &self.abts,
            &self.seq_timeout,
            &self.invalid_rpi,
            &self.no_resources,
            &self.reject_other,
            &self.transport_busy,
            &self.busy_rejects,
            &self.lun_resets,
            &self.target_resets,
            &self.completed,
        ] {
            cell.store(0, Ordering::Relaxed);
        }
    }
}

/// Depth state of one LUN.
#[derive(Debug)]
pub struct LunQueue {
    lun: u64,
    ceiling: u32,
    depth: AtomicU32,
    pending: AtomicU32,
    last_full: Mutex<Option<Instant>>,
}

impl LunQueue {
    pub fn new(lun: u64, ceiling: u32) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            lun,
            ceiling,
            depth: AtomicU32::new(ceiling),
            pending: AtomicU32::new(0),
            last_full: Mutex::new(None),
        }
    }

    pub fn lun(&self) -> u64 {
        self.lun
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Acquire)
    }

    /// Store `depth` clamped into `[1, ceiling]`, returning the previous value.
    pub fn set_depth(&self, depth: u32) -> u32 {
        self.depth
            .swap(depth.clamp(1, self.ceiling), Ordering::AcqRel)
    }

    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Take one pending slot if the LUN is below its current depth.
    pub(crate) fn try_reserve(&self) -> bool {
        reserve_below(&self.pending, self.depth()).is_some()
    }

    pub(crate) fn dec_pending(&self) -> u32 {
        dec_saturating(&self.pending)
    }

    pub fn last_full(&self) -> Option<Instant> {
        *lock(&self.last_full)
    }

    pub(crate) fn mark_full(&self, now: Instant) {
        *lock(&self.last_full) = Some(now);
    }

    pub fn snapshot(&self) -> LunSnapshot {
        LunSnapshot {
            lun: self.lun,
            depth: self.depth(),
            ceiling: self.ceiling,
            pending: self.pending(),
        }
    }
}

/// Per remote port state shared by dispatch, completion and recovery.
#[derive(Debug)]
pub struct TargetContext {
    id: PortId,
    params: TargetParams,
    readiness: AtomicU8,
    max_ceiling: u32,
    ceiling: AtomicU32,
    pending: AtomicU32,
    max_pending: AtomicU32,
    last_ceiling_change: Mutex<Instant>,
    lun_ceiling: u32,
    luns: RwLock<HashMap<u64, Arc<LunQueue>>>,
    latency: Option<LatencyHistogram>,
    pub counters: TargetCounters,
}

impl TargetContext {
    pub fn new(
        id: PortId,
        params: TargetParams,
        target_depth: u32,
        lun_depth: u32,
        latency: Option<LatencyHistogram>,
        now: Instant,
    ) -> Self {
        let max_ceiling = target_depth.max(1);
        Self {
            id,
            params,
            readiness: AtomicU8::new(Readiness::Ready as u8),
            max_ceiling,
            ceiling: AtomicU32::new(max_ceiling),
            pending: AtomicU32::new(0),
            max_pending: AtomicU32::new(0),
            last_ceiling_change: Mutex::new(now),
            lun_ceiling: lun_depth.max(1),
            luns: RwLock::new(HashMap::new()),
            latency,
            counters: TargetCounters::default(),
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn params(&self) -> TargetParams {
        self.params
    }

    pub fn readiness(&self) -> Readiness {
        Readiness::from_raw(self.readiness.load(Ordering::Acquire))
    }

    /// Returns the previous readiness.
    pub fn set_readiness(&self, readiness: Readiness) -> Readiness {
        Readiness::from_raw(self.readiness.swap(readiness as u8, Ordering::AcqRel))
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling.load(Ordering::Acquire)
    }

    pub fn max_ceiling(&self) -> u32 {
        self.max_ceiling
    }

    /// Store `ceiling` clamped into `[1, max_ceiling]`, returning the previous value.
    pub fn set_ceiling(&self, ceiling: u32, now: Instant) -> u32 {
        *lock(&self.last_ceiling_change) = now;
        self.ceiling
            .swap(ceiling.clamp(1, self.max_ceiling), Ordering::AcqRel)
    }

    /// Claim the ceiling step slot if `interval` has passed since the last
    /// change.
    pub(crate) fn claim_ceiling_step(&self, now: Instant, interval: std::time::Duration) -> bool {
        let mut last = lock(&self.last_ceiling_change);
        if now.saturating_duration_since(*last) < interval {
            return false;
        }
        *last = now;
        true
    }

    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn max_pending(&self) -> u32 {
        self.max_pending.load(Ordering::Relaxed)
    }

    /// Take one pending slot if the target is below its ceiling.
    pub(crate) fn try_reserve(&self) -> bool {
        let Some(pending) = reserve_below(&self.pending, self.ceiling()) else {
            return false;
        };
        self.max_pending.fetch_max(pending, Ordering::Relaxed);
        true
    }

    pub(crate) fn dec_pending(&self) -> u32 {
        dec_saturating(&self.pending)
    }

    /// The LUN's queue, created at the configured ceiling on first use.
    pub fn lun(&self, lun: u64) -> Arc<LunQueue> {
        if let Some(queue) = self.read_luns().get(&lun) {
            return queue.clone();
        }
        let mut luns = self.luns.write().unwrap_or_else(PoisonError::into_inner);
        luns.entry(lun)
            .or_insert_with(|| Arc::new(LunQueue::new(lun, self.lun_ceiling)))
            .clone()
    }

    #[cfg(test)]
    fn existing_lun(&self, lun: u64) -> Option<Arc<LunQueue>> {
        self.read_luns().get(&lun).cloned()
    }

    pub fn luns(&self) -> Vec<Arc<LunQueue>> {
        let mut luns: Vec<_> = self.read_luns().values().cloned().collect();
        luns.sort_by_key(|queue| queue.lun());
        luns
    }

    pub fn latency(&self) -> Option<&LatencyHistogram> {
        self.latency.as_ref()
    }

    /// Zero the error counters, the latency buckets and the pending high-water mark.
    pub fn reset_stats(&self) {
        self.counters.clear();
        if let Some(latency) = &self.latency {
            latency.reset();
        }
        self.max_pending.store(self.pending(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TargetSnapshot {
        let load = |cell: &AtomicU64| cell.load(Ordering::Relaxed);
        TargetSnapshot {
            target: self.id.raw(),
            readiness: self.readiness().as_str(),
            ceiling: self.ceiling(),
            pending: self.pending(),
            max_pending: self.max_pending(),
            fcp_err: load(&self.counters.fcp_err),
            abts: load(&self.counters.abts),
            seq_timeout: load(&self.counters.seq_timeout),
            invalid_rpi: load(&self.counters.invalid_rpi),
            no_resources: load(&self.counters.no_resources),
            reject_other: load(&self.counters.reject_other),
            transport_busy: load(&self.counters.transport_busy),
            busy_rejects: load(&self.counters.busy_rejects),
            lun_resets: load(&self.counters.lun_resets),
            target_resets: load(&self.counters.target_resets),
            completed: load(&self.counters.completed),
            latency: self.latency.as_ref().map(LatencyHistogram::snapshot),
            luns: self.luns().iter().map(|queue| queue.snapshot()).collect(),
        }
    }

    fn read_luns(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u64, Arc<LunQueue>>> {
        self.luns.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LunSnapshot {
    pub lun: u64,
    pub depth: u32,
    pub ceiling: u32,
    pub pending: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TargetSnapshot {
    pub target: u32,
    pub readiness: &'static str,
    pub ceiling: u32,
    pub pending: u32,
    pub max_pending: u32,
    pub fcp_err: u64,
    pub abts: u64,
    pub seq_timeout: u64,
    pub invalid_rpi: u64,
    pub no_resources: u64,
    pub reject_other: u64,
    pub transport_busy: u64,
    pub busy_rejects: u64,
    pub lun_resets: u64,
    pub target_resets: u64,
    pub completed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<Vec<u64>>,
    pub luns: Vec<LunSnapshot>,
}

fn reserve_below(cell: &AtomicU32, limit: u32) -> Option<u32> {
    cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
        (v < limit).then_some(v + 1)
    })
    .ok()
    .map(|previous| previous + 1)
}

fn dec_saturating(cell: &AtomicU32) -> u32 {
    match cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1)) {
        Ok(previous) => previous - 1,
        Err(_) => 0,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
