//! Simulated adapter work queue.
//!
//! [`SimRing`] accepts work requests like an adapter would and completes
//! them from worker threads after a random latency, optionally injecting
//! SCSI and transport faults. Completions go to whatever
//! [`CompletionSink`] is attached, normally the engine itself.

use anyhow::{Context, Result, ensure};
use async_channel::{Receiver, Sender};
use fcio_buffers::{ExchangeTag, RegistrationError, SglPost, SglRegistrar};
use fcio_core::{
    AbortRequest, CommandKind, CompletionSink, HardwareRing, RawCompletion, RingError,
    RingErrorKind, WorkRequest,
};
use fcio_proto::{FcpRsp, IoStatus, RejectReason, scsi_status};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{Level, debug, info, trace, warn};

/// Probability of each injected outcome, checked in declaration order
/// against a single draw. Whatever is left over completes successfully.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FaultRates {
    pub queue_full: f64,
    pub device_busy: f64,
    pub check_condition: f64,
    pub fabric_busy: f64,
    pub local_reject: f64,
    /// Read completes short by half its length.
    pub short_read: f64,
    /// The exchange never completes on its own; only an abort ends it.
    pub dropped: f64,
    /// Independent of the above: the completion reports the exchange still
    /// open, and the close arrives later.
    pub exchange_busy: f64,
}

impl FaultRates {
    fn outcome_rates(&self) -> [(Outcome, f64); 7] {
        [
            (Outcome::QueueFull, self.queue_full),
            (Outcome::DeviceBusy, self.device_busy),
            (Outcome::CheckCondition, self.check_condition),
            (Outcome::FabricBusy, self.fabric_busy),
            (Outcome::LocalReject, self.local_reject),
            (Outcome::ShortRead, self.short_read),
            (Outcome::Dropped, self.dropped),
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    pub workers: usize,
    pub min_latency_us: u64,
    pub max_latency_us: u64,
    pub seed: u64,
    pub faults: FaultRates,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            min_latency_us: 50,
            max_latency_us: 500,
            seed: 0x5EED,
            faults: FaultRates::default(),
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.workers > 0, "workers must be at least 1");
        ensure!(
            self.min_latency_us <= self.max_latency_us,
            "min_latency_us exceeds max_latency_us"
        );
        let rates = self.faults.outcome_rates();
        for (outcome, rate) in rates {
            ensure!((0.0..=1.0).contains(&rate), "{outcome:?} rate {rate} outside 0..=1");
        }
        ensure!(
            (0.0..=1.0).contains(&self.faults.exchange_busy),
            "exchange_busy rate outside 0..=1"
        );
        let total: f64 = rates.iter().map(|(_, rate)| rate).sum();
        ensure!(total <= 1.0, "fault rates sum to {total}");
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Success,
    QueueFull,
    DeviceBusy,
    CheckCondition,
    FabricBusy,
    LocalReject,
    ShortRead,
    Dropped,
}

enum SimOp {
    Io { work: WorkRequest, due: Instant },
    Complete(RawCompletion),
    Close { tag: ExchangeTag, due: Instant },
    Shutdown,
}

#[derive(Debug, Default)]
struct PendingIo {
    aborted: bool,
    dropped: bool,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    aborts: AtomicU64,
    dropped: AtomicU64,
    exchange_busy: AtomicU64,
    registered: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SimSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub aborts: u64,
    pub dropped: u64,
    pub exchange_busy: u64,
    pub registered: u64,
    pub outstanding: usize,
}

/// In-process stand-in for an adapter work queue.
pub struct SimRing {
    config: SimConfig,
    tx: Sender<SimOp>,
    rx: Receiver<SimOp>,
    sink: OnceLock<Weak<dyn CompletionSink>>,
    pending: Mutex<HashMap<ExchangeTag, PendingIo>>,
    rng: Mutex<StdRng>,
    link_up: AtomicBool,
    fail_registration: AtomicBool,
    counters: Counters,
}

impl SimRing {
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate().context("simulator config")?;
        let (tx, rx) = async_channel::unbounded();
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            tx,
            rx,
            sink: OnceLock::new(),
            pending: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
            link_up: AtomicBool::new(true),
            fail_registration: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }

    /// Route completions to `sink`. Only the first call takes effect.
    pub fn attach(&self, sink: Weak<dyn CompletionSink>) -> bool {
        self.sink.set(sink).is_ok()
    }

    pub fn set_link_up(&self, up: bool) {
        self.link_up.store(up, Ordering::Release);
    }

    /// Make subsequent scatter-gather registrations fail.
    pub fn fail_registration(&self, fail: bool) {
        self.fail_registration.store(fail, Ordering::Release);
    }

    pub fn snapshot(&self) -> SimSnapshot {
        let load = |cell: &AtomicU64| cell.load(Ordering::Relaxed);
        SimSnapshot {
            submitted: load(&self.counters.submitted),
            completed: load(&self.counters.completed),
            aborts: load(&self.counters.aborts),
            dropped: load(&self.counters.dropped),
            exchange_busy: load(&self.counters.exchange_busy),
            registered: load(&self.counters.registered),
            outstanding: self.lock_pending().len(),
        }
    }

    /// Start the completion workers. They stop when the returned handle is
    /// dropped.
    pub fn start(self: &Arc<Self>) -> Result<SimWorkers> {
        let mut workers = SimWorkers {
            tx: self.tx.clone(),
            joins: Vec::with_capacity(self.config.workers),
        };
        for index in 0..self.config.workers {
            let ring = Arc::clone(self);
            let span = tracing::span!(Level::INFO, "sim", worker = index);
            let join = thread::Builder::new()
                .name(format!("fcio-sim-{index}"))
                .spawn(move || {
                    let _enter = span.enter();
                    debug!("sim worker started");
                    while let Ok(op) = ring.rx.recv_blocking() {
                        if !ring.process(op) {
                            break;
                        }
                    }
                    debug!("sim worker exiting");
                })
                .with_context(|| format!("spawn sim worker {index}"))?;
            workers.joins.push(join);
        }
        info!(workers = workers.joins.len(), "simulated ring started");
        Ok(workers)
    }

    fn process(&self, op: SimOp) -> bool {
        match op {
            SimOp::Io { work, due } => {
                sleep_until(due);
                self.finish(work);
            }
            SimOp::Complete(raw) => self.deliver(raw),
            SimOp::Close { tag, due } => {
                sleep_until(due);
                trace!(%tag, "exchange closed");
                if let Some(sink) = self.sink() {
                    sink.exchange_aborted(tag);
                }
            }
            SimOp::Shutdown => return false,
        }
        true
    }

    fn finish(&self, work: WorkRequest) {
        let tag = work.tag;
        let (outcome, exchange_busy) = self.roll(work.kind);
        let aborted = {
            let mut pending = self.lock_pending();
            let Some(entry) = pending.get_mut(&tag) else {
                trace!(%tag, "exchange already retired");
                return;
            };
            if !entry.aborted && outcome == Outcome::Dropped {
                entry.dropped = true;
                drop(pending);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(%tag, "dropping exchange");
                return;
            }
            let aborted = entry.aborted;
            pending.remove(&tag);
            aborted
        };
        if aborted {
            self.deliver(abort_completion(tag));
            return;
        }

        let mut raw = build_completion(&work, outcome);
        raw.exchange_busy = exchange_busy;
        self.deliver(raw);
        // The close must not overtake the completion it follows.
        if exchange_busy {
            self.counters.exchange_busy.fetch_add(1, Ordering::Relaxed);
            let due = Instant::now() + self.latency();
            if self.tx.try_send(SimOp::Close { tag, due }).is_err() {
                warn!(%tag, "sim queue closed; exchange left busy");
            }
        }
    }

    fn roll(&self, kind: CommandKind) -> (Outcome, bool) {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let draw: f64 = rng.gen();
        let mut acc = 0.0;
        let mut outcome = Outcome::Success;
        for (candidate, rate) in self.config.faults.outcome_rates() {
            acc += rate;
            if draw < acc {
                outcome = candidate;
                break;
            }
        }
        if outcome == Outcome::ShortRead && kind != CommandKind::Read {
            outcome = Outcome::Success;
        }
        let busy = self.config.faults.exchange_busy > 0.0
            && rng.gen_bool(self.config.faults.exchange_busy);
        (outcome, busy)
    }

    fn latency(&self) -> Duration {
        let (min, max) = (self.config.min_latency_us, self.config.max_latency_us);
        let us = if min == max {
            min
        } else {
            self.rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .gen_range(min..=max)
        };
        Duration::from_micros(us)
    }

    fn deliver(&self, raw: RawCompletion) {
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        match self.sink() {
            Some(sink) => sink.complete(raw),
            None => debug!(tag = %raw.tag, "no completion sink attached"),
        }
    }

    fn sink(&self) -> Option<Arc<dyn CompletionSink>> {
        self.sink.get().and_then(Weak::upgrade)
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<ExchangeTag, PendingIo>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SglRegistrar for SimRing {
    fn post_sgl_block(&self, block: &[SglPost]) -> std::result::Result<(), RegistrationError> {
        if self.fail_registration.load(Ordering::Acquire) {
            return Err(RegistrationError::new("registration disabled"));
        }
        self.counters
            .registered
            .fetch_add(block.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

impl HardwareRing for SimRing {
    fn submit(&self, request: &WorkRequest) -> std::result::Result<(), RingError> {
        if !self.link_up() {
            return Err(RingError::new(RingErrorKind::Offline));
        }
        {
            let mut pending = self.lock_pending();
            if pending.contains_key(&request.tag) {
                return Err(RingError::with_message(
                    RingErrorKind::Rejected,
                    format!("tag {} already active", request.tag),
                ));
            }
            pending.insert(request.tag, PendingIo::default());
        }
        let due = Instant::now() + self.latency();
        if self
            .tx
            .try_send(SimOp::Io {
                work: request.clone(),
                due,
            })
            .is_err()
        {
            self.lock_pending().remove(&request.tag);
            return Err(RingError::new(RingErrorKind::Offline));
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn abort(&self, request: &AbortRequest) -> std::result::Result<(), RingError> {
        self.counters.aborts.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.lock_pending();
        let Some(entry) = pending.get_mut(&request.tag) else {
            trace!(tag = %request.tag, "abort for idle exchange");
            return Ok(());
        };
        if entry.dropped {
            pending.remove(&request.tag);
            drop(pending);
            self.tx
                .try_send(SimOp::Complete(abort_completion(request.tag)))
                .map_err(|_| RingError::new(RingErrorKind::Offline))?;
        } else {
            entry.aborted = true;
        }
        debug!(tag = %request.tag, close = request.close, "abort accepted");
        Ok(())
    }

    fn link_up(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }
}

/// Stops the simulator workers when dropped.
pub struct SimWorkers {
    tx: Sender<SimOp>,
    joins: Vec<JoinHandle<()>>,
}

impl SimWorkers {
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for SimWorkers {
    fn drop(&mut self) {
        for _ in 0..self.joins.len() {
            let _ = self.tx.try_send(SimOp::Shutdown);
        }
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }
}

fn sleep_until(due: Instant) {
    let now = Instant::now();
    if due > now {
        thread::sleep(due - now);
    }
}

fn abort_completion(tag: ExchangeTag) -> RawCompletion {
    let mut raw = RawCompletion::new(tag, IoStatus::LocalReject.into());
    raw.parameter = RejectReason::AbortRequested.raw();
    raw
}

fn build_completion(work: &WorkRequest, outcome: Outcome) -> RawCompletion {
    let rsp_error = |rsp: FcpRsp| {
        let mut raw = RawCompletion::new(work.tag, IoStatus::FcpRspError.into());
        raw.response = Some(rsp);
        raw
    };
    match outcome {
        Outcome::Success | Outcome::Dropped => RawCompletion::new(work.tag, IoStatus::Success.into()),
        Outcome::QueueFull => rsp_error(FcpRsp::with_status(scsi_status::TASK_SET_FULL)),
        Outcome::DeviceBusy => rsp_error(FcpRsp::with_status(scsi_status::BUSY)),
        Outcome::CheckCondition => {
            // Unit attention: power on or reset occurred.
            let mut sense = [0u8; 18];
            sense[0] = 0x70;
            sense[2] = 0x06;
            sense[7] = 10;
            sense[12] = 0x29;
            rsp_error(FcpRsp::with_status(scsi_status::CHECK_CONDITION).sense(&sense))
        }
        Outcome::FabricBusy => RawCompletion::new(work.tag, IoStatus::FabricBusy.into()),
        Outcome::LocalReject => {
            let mut raw = RawCompletion::new(work.tag, IoStatus::LocalReject.into());
            raw.parameter = RejectReason::NoResources.raw();
            raw
        }
        Outcome::ShortRead => {
            let residual = work.read_check / 2;
            let mut raw =
                rsp_error(FcpRsp::with_status(scsi_status::GOOD).residual_under(residual));
            raw.read_residual = residual;
            raw
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        SimConfig::default().validate().unwrap();
    }

    #[test]
    fn rates_must_fit_one_draw() {
        let config = SimConfig {
            faults: FaultRates {
                queue_full: 0.6,
                dropped: 0.6,
                ..FaultRates::default()
            },
            ..SimConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SimConfig {
            min_latency_us: 10,
            max_latency_us: 1,
            ..SimConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_decodes_partial_json() {
        let config: SimConfig =
            serde_json::from_str(r#"{"workers": 4, "faults": {"queue_full": 0.1}}"#).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.faults.queue_full, 0.1);
        assert_eq!(config.max_latency_us, 500);
    }

    #[test]
    fn certain_fault_is_always_chosen() {
        let ring = SimRing::new(SimConfig {
            faults: FaultRates {
                check_condition: 1.0,
                ..FaultRates::default()
            },
            ..SimConfig::default()
        })
        .unwrap();
        for _ in 0..16 {
            assert_eq!(ring.roll(CommandKind::Write), (Outcome::CheckCondition, false));
        }
    }

    #[test]
    fn short_read_only_applies_to_reads() {
        let ring = SimRing::new(SimConfig {
            faults: FaultRates {
                short_read: 1.0,
                ..FaultRates::default()
            },
            ..SimConfig::default()
        })
        .unwrap();
        assert_eq!(ring.roll(CommandKind::Read).0, Outcome::ShortRead);
        assert_eq!(ring.roll(CommandKind::Control).0, Outcome::Success);
    }

    #[test]
    fn registration_can_be_failed() {
        let ring = SimRing::new(SimConfig::default()).unwrap();
        let block = [SglPost {
            tag: ExchangeTag(0x40),
            table_addr: 0x1000,
            table_len: 0x200,
        }];
        ring.post_sgl_block(&block).unwrap();
        ring.fail_registration(true);
        assert!(ring.post_sgl_block(&block).is_err());
        assert_eq!(ring.snapshot().registered, 1);
    }
}
