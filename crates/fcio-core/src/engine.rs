use crate::classify::{AbortCause, ClassifyContext, classify, effective_status};
use crate::config::{EngineConfig, EngineFlags};
use crate::deferred::{DeferredQueue, DeferredWork, WorkerHandle};
use crate::depth::{DepthPolicy, DepthWork, Observation, QueueDepthController};
use crate::error::{DispatchError, DispatchErrorKind};
use crate::events::{EventSink, LogEventSink, MgmtEvent};
use crate::latency::LatencyHistogram;
use crate::metrics::AdapterMetrics;
use crate::prep::{prepare_io, unmap_all};
use crate::request::{
    DataDirection, IoCompletion, IoHandle, IoTicket, RequestId, ScsiRequest,
};
use crate::ring::{
    CompletionSink, DmaMapper, DmaSegment, HardwareRing, IdentityMapper, RawCompletion,
};
use crate::stats::AdapterSnapshot;
use crate::target::{LunQueue, Readiness, TargetContext, TargetParams};
use anyhow::{Context, Result};
use fcio_buffers::{
    ExchangePool, ExchangeRef, ExchangeSlot, ExchangeTag, PoolSnapshot, RegistrationError,
    SglPost, SglRegistrar, SlotState, backend_for,
};
use fcio_proto::{FcpRsp, IoStatus, PortId, RspFlags};
use futures_channel::oneshot;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// What currently owns an exchange buffer.
pub(crate) enum Binding {
    Io(IoBinding),
    TaskMgmt(TaskMgmtBinding),
    /// Released or cancelled while the adapter still holds the exchange
    /// open. Cleared by whoever observes the confirmation.
    Quarantined { target: PortId },
}

impl Binding {
    fn live_target(&self) -> Option<PortId> {
        match self {
            Binding::Io(io) => Some(io.target.id()),
            Binding::TaskMgmt(tmf) => Some(tmf.target.id()),
            Binding::Quarantined { .. } => None,
        }
    }
}

pub(crate) struct IoBinding {
    pub id: RequestId,
    pub target: Arc<TargetContext>,
    pub lun: Arc<LunQueue>,
    pub opcode: u8,
    pub direction: DataDirection,
    pub length: u32,
    pub underflow: u32,
    pub started: Instant,
    pub deadline: Instant,
    pub abort: Option<AbortCause>,
    pub mappings: Vec<DmaSegment>,
    pub done: oneshot::Sender<IoCompletion>,
}

impl IoBinding {
    pub(crate) fn handle(&self, tag: ExchangeTag) -> IoHandle {
        IoHandle {
            id: self.id,
            tag,
            target: self.target.id(),
            lun: self.lun.lun(),
        }
    }
}

pub(crate) struct TaskMgmtBinding {
    pub id: RequestId,
    pub target: Arc<TargetContext>,
    pub done: oneshot::Sender<bool>,
}

pub(crate) type Slot = ExchangeSlot<Binding>;

/// Adapts the ring to the pool's registration seam.
struct RingRegistrar<'a>(&'a dyn HardwareRing);

impl SglRegistrar for RingRegistrar<'_> {
    fn post_sgl_block(&self, block: &[SglPost]) -> std::result::Result<(), RegistrationError> {
        self.0.post_sgl_block(block)
    }
}

/// The SCSI exchange engine for one adapter.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) pool: ExchangePool<Binding>,
    pub(crate) ring: Arc<dyn HardwareRing>,
    pub(crate) mapper: Arc<dyn DmaMapper>,
    events: Arc<dyn EventSink>,
    targets: RwLock<HashMap<PortId, Arc<TargetContext>>>,
    depth: QueueDepthController,
    pub(crate) deferred: DeferredQueue,
    pub(crate) metrics: AdapterMetrics,
    next_id: AtomicU64,
    adapter_error: AtomicBool,
}

impl Engine {
    pub fn new(config: EngineConfig, ring: Arc<dyn HardwareRing>) -> Result<Self> {
        config.validate().context("engine config")?;
        let backend = backend_for(config.generation, config.xri_base);
        let pool = ExchangePool::new(
            backend,
            config.io_exchange_limit(),
            config.max_sg_segments,
            config.reuse_hold(),
        );
        let depth = QueueDepthController::new(DepthPolicy::from_config(&config), Instant::now());
        info!(
            generation = %config.generation,
            capacity = pool.capacity(),
            lun_queue_depth = config.lun_queue_depth,
            "exchange engine created"
        );
        Ok(Self {
            config,
            pool,
            ring,
            mapper: Arc::new(IdentityMapper),
            events: Arc::new(LogEventSink),
            targets: RwLock::new(HashMap::new()),
            depth,
            deferred: DeferredQueue::new(),
            metrics: AdapterMetrics::default(),
            next_id: AtomicU64::new(1),
            adapter_error: AtomicBool::new(false),
        })
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn DmaMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a reachable remote port, or mark an existing one ready.
    pub fn add_target(&self, id: PortId, params: TargetParams) -> Arc<TargetContext> {
        let mut targets = self.targets.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = targets.get(&id) {
            existing.set_readiness(Readiness::Ready);
            return existing.clone();
        }
        let latency = if self.config.flags.contains(EngineFlags::LATENCY) {
            LatencyHistogram::new(&self.config.latency)
        } else {
            None
        };
        let target = Arc::new(TargetContext::new(
            id,
            params,
            self.config.target_queue_depth,
            self.config.lun_queue_depth,
            latency,
            Instant::now(),
        ));
        targets.insert(id, target.clone());
        drop(targets);
        info!(target = %id, context = params.context, "target added");
        target
    }

    pub fn set_readiness(&self, id: PortId, readiness: Readiness) -> bool {
        let Some(target) = self.target(id) else {
            return false;
        };
        let from = target.set_readiness(readiness);
        if from != readiness {
            info!(target = %id, %from, to = %readiness, "target readiness changed");
        }
        true
    }

    pub fn remove_target(&self, id: PortId) -> Option<Arc<TargetContext>> {
        let removed = self
            .targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)?;
        removed.set_readiness(Readiness::NotReady);
        info!(target = %id, pending = removed.pending(), "target removed");
        Some(removed)
    }

    pub fn target(&self, id: PortId) -> Option<Arc<TargetContext>> {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub(crate) fn targets(&self) -> Vec<Arc<TargetContext>> {
        let mut targets: Vec<_> = self
            .targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        targets.sort_by_key(|target| target.id());
        targets
    }

    /// The adapter entered or left an error state. While set, dispatches to
    /// a not-ready target drop that target's LUN depths to 1.
    pub fn set_adapter_error(&self, error: bool) {
        self.adapter_error.store(error, Ordering::Release);
    }

    /// Create the LUN's depth state and grow the exchange pool for it.
    /// Returns the number of buffers added.
    pub fn add_lun(&self, target: PortId, lun: u64) -> Result<usize> {
        let context = self
            .target(target)
            .with_context(|| format!("target {target} not registered"))?;
        context.lun(lun);
        let want = self.config.lun_queue_depth as usize + 2;
        let added = self
            .pool
            .provision(want, &RingRegistrar(self.ring.as_ref()))
            .with_context(|| format!("provision exchanges for {target}:{lun}"))?;
        debug!(target = %target, lun, added, "lun added");
        Ok(added)
    }

    /// Re-register every idle exchange after an adapter reset. Returns the
    /// number that failed and remain quarantined.
    pub fn repost_exchanges(&self) -> usize {
        self.pool.repost_all(&RingRegistrar(self.ring.as_ref()))
    }

    /// Submit `request` to the adapter. Never blocks.
    pub fn dispatch(&self, request: ScsiRequest) -> std::result::Result<IoTicket, DispatchError> {
        let now = Instant::now();
        let Some(target) = self.target(request.target) else {
            return Err(self.reject(DispatchError::with_message(
                DispatchErrorKind::NotReady,
                format!("target {} unknown", request.target),
            )));
        };
        let readiness = target.readiness();
        if readiness != Readiness::Ready {
            if self.adapter_error.load(Ordering::Acquire) {
                self.deferred.post(DeferredWork::Depth(DepthWork::Floor {
                    target: target.clone(),
                }));
            }
            return Err(self.reject(DispatchError::with_message(
                DispatchErrorKind::NotReady,
                format!("target {} {readiness}", target.id()),
            )));
        }

        let lun = target.lun(request.lun);
        if !target.try_reserve() {
            target.counters.busy_rejects.fetch_add(1, Ordering::Relaxed);
            return Err(self.reject(DispatchError::new(DispatchErrorKind::Busy)));
        }
        if !lun.try_reserve() {
            target.dec_pending();
            target.counters.busy_rejects.fetch_add(1, Ordering::Relaxed);
            return Err(self.reject(DispatchError::new(DispatchErrorKind::Busy)));
        }
        let unreserve = || {
            target.dec_pending();
            lun.dec_pending();
        };

        let Some(exchange) = self.pool.acquire(target.id()) else {
            unreserve();
            if let Some(work) = self.depth.resource_error(now) {
                self.deferred.post(DeferredWork::Depth(work));
            }
            return Err(self.reject(DispatchError::new(DispatchErrorKind::HostBusy)));
        };
        let Some(slot) = self.pool.slot_at(exchange) else {
            unreserve();
            self.pool.release(exchange, false);
            return Err(self.reject(DispatchError::new(DispatchErrorKind::HostBusy)));
        };

        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (done, completion) = oneshot::channel();
        let work = {
            let mut guard = slot.lock();
            let prepared = match prepare_io(
                &self.pool,
                &mut guard,
                &request,
                &target,
                self.mapper.as_ref(),
                self.config.max_sg_segments,
            ) {
                Ok(prepared) => prepared,
                Err(err) => {
                    drop(guard);
                    unreserve();
                    self.pool.release(exchange, false);
                    return Err(self.reject(DispatchError::with_message(
                        DispatchErrorKind::Busy,
                        err.to_string(),
                    )));
                }
            };
            guard.binding = Some(Binding::Io(IoBinding {
                id,
                target: target.clone(),
                lun: lun.clone(),
                opcode: request.cdb.opcode(),
                direction: request.direction,
                length: request.length,
                underflow: request.underflow,
                started: now,
                deadline: now + request.timeout,
                abort: None,
                mappings: prepared.mappings,
                done,
            }));
            prepared.work
        };

        if let Err(err) = self.ring.submit(&work) {
            self.metrics.record_submit_failure();
            let reclaimed = {
                let mut guard = slot.lock();
                match guard.binding.take() {
                    Some(Binding::Io(io)) if io.id == id => Some(io),
                    other => {
                        guard.binding = other;
                        None
                    }
                }
            };
            // A completion that raced the failed submit owns the buffer.
            if let Some(io) = reclaimed {
                unmap_all(self.mapper.as_ref(), &io.mappings, io.direction);
                unreserve();
                self.pool.release(exchange, false);
            }
            return Err(self.reject(DispatchError::with_message(
                DispatchErrorKind::Busy,
                err.to_string(),
            )));
        }

        self.metrics.record_dispatch(request.direction);
        trace!(
            tag = %exchange.tag(),
            id = %id,
            target = %target.id(),
            lun = request.lun,
            "dispatched"
        );
        Ok(IoTicket {
            handle: IoHandle {
                id,
                tag: exchange.tag(),
                target: target.id(),
                lun: request.lun,
            },
            completion,
        })
    }

    fn reject(&self, err: DispatchError) -> DispatchError {
        self.metrics.record_reject(err.kind());
        trace!(kind = ?err.kind(), "dispatch rejected: {err}");
        err
    }

    pub(crate) fn slot_for(&self, tag: ExchangeTag) -> Option<(ExchangeRef, &Slot)> {
        let exchange = self.pool.exchange_ref(tag)?;
        let slot = self.pool.slot_at(exchange)?;
        Some((exchange, slot))
    }

    /// Handle one completion queue entry.
    pub fn complete(&self, raw: RawCompletion) {
        let now = Instant::now();
        let Some((exchange, slot)) = self.slot_for(raw.tag) else {
            warn!(tag = %raw.tag, "completion for unknown exchange");
            self.metrics.record_stale_completion();
            return;
        };
        let still_busy = self.pool.backend().release_state(raw.exchange_busy) == SlotState::Busy;

        let (binding, response) = {
            let mut guard = slot.lock();
            if let Some(rsp) = &raw.response {
                guard.rsp_mut().copy_from_slice(&rsp.encode());
            }
            let binding = guard.binding.take();
            if still_busy {
                if matches!(binding, Some(Binding::Quarantined { .. })) {
                    guard.binding = binding;
                    drop(guard);
                    debug!(tag = %raw.tag, "exchange still busy");
                    return;
                }
                if let Some(target) = binding.as_ref().and_then(Binding::live_target) {
                    guard.binding = Some(Binding::Quarantined { target });
                }
            }
            let response = FcpRsp::decode(guard.rsp()).ok();
            (binding, response)
        };

        match binding {
            Some(Binding::Io(io)) => self.finish_io(exchange, slot, io, &raw, response.as_ref(), now),
            Some(Binding::TaskMgmt(tmf)) => {
                self.finish_task_mgmt(exchange, slot, tmf, &raw, response.as_ref())
            }
            Some(Binding::Quarantined { target }) => self.confirm_exchange(exchange, slot, Some(target)),
            None => match self.pool.state(raw.tag) {
                Some(SlotState::Busy) if !still_busy => self.confirm_exchange(exchange, slot, None),
                Some(SlotState::Busy) => debug!(tag = %raw.tag, "exchange still busy"),
                state => {
                    warn!(tag = %raw.tag, ?state, "dropping completion without a request");
                    self.metrics.record_stale_completion();
                }
            },
        }
    }

    fn finish_io(
        &self,
        exchange: ExchangeRef,
        slot: &Slot,
        io: IoBinding,
        raw: &RawCompletion,
        response: Option<&FcpRsp>,
        now: Instant,
    ) {
        let IoBinding {
            id,
            target,
            lun,
            opcode,
            direction,
            length,
            underflow,
            started,
            abort,
            mappings,
            done,
            ..
        } = io;
        let mapped = target.readiness() == Readiness::Ready
            && self
                .target(target.id())
                .is_some_and(|current| Arc::ptr_eq(&current, &target));
        let ctx = ClassifyContext {
            direction,
            length,
            underflow,
            task_mgmt: false,
            abort,
            mapped,
        };
        let classified = classify(raw, response, &ctx);
        let latency = now.saturating_duration_since(started);

        if self.config.flags.contains(EngineFlags::STATS) {
            if let Some(counter) = classified.counter {
                target.counters.bump(counter);
            }
            target.counters.completed.fetch_add(1, Ordering::Relaxed);
            if classified.status == IoStatus::Success {
                if let Some(histogram) = target.latency() {
                    histogram.record(latency);
                }
            }
        }

        let pending = target.pending();
        let lun_in_flight = lun.pending();
        target.dec_pending();
        lun.dec_pending();
        let observation = Observation {
            signal: classified.signal,
            target: &target,
            lun: &lun,
            opcode,
            latency,
            pending,
            lun_in_flight,
        };
        for work in self.depth.observe(&observation, now) {
            self.deferred.post(DeferredWork::Depth(work));
        }
        for event in &classified.events {
            self.deferred.post(DeferredWork::Event(MgmtEvent::Io {
                target: target.id(),
                lun: lun.lun(),
                opcode,
                event: *event,
            }));
        }

        unmap_all(self.mapper.as_ref(), &mappings, direction);
        self.metrics.observe_completion(
            direction,
            length.saturating_sub(classified.residual),
            latency,
        );
        match self.pool.release(exchange, raw.exchange_busy) {
            Some(SlotState::Busy) => self.settle_quarantine(exchange, slot, target.id()),
            Some(_) => {}
            None => warn!(tag = %exchange.tag(), "completed exchange was not in use"),
        }

        trace!(
            tag = %exchange.tag(),
            id = %id,
            status = %classified.status,
            host = %classified.host_status,
            "completed"
        );
        let completion = IoCompletion {
            id,
            result: classified.result,
            host_status: classified.host_status,
            scsi_status: classified.scsi_status,
            residual: classified.residual,
            sense: classified.sense,
        };
        if done.send(completion).is_err() {
            trace!(id = %id, "completion receiver dropped");
        }
        slot.notify();
    }

    fn finish_task_mgmt(
        &self,
        exchange: ExchangeRef,
        slot: &Slot,
        tmf: TaskMgmtBinding,
        raw: &RawCompletion,
        response: Option<&FcpRsp>,
    ) {
        let success = match effective_status(raw) {
            IoStatus::Success => true,
            IoStatus::FcpRspError => response.map_or(true, |rsp| {
                !rsp.flags.contains(RspFlags::RSP_LEN_VALID) || rsp.rsp_code() == 0
            }),
            _ => false,
        };
        match self.pool.release(exchange, raw.exchange_busy) {
            Some(SlotState::Busy) => self.settle_quarantine(exchange, slot, tmf.target.id()),
            Some(_) => {}
            None => warn!(tag = %exchange.tag(), "task management exchange was not in use"),
        }
        debug!(tag = %exchange.tag(), id = %tmf.id, success, "task management completed");
        if tmf.done.send(success).is_err() {
            debug!(id = %tmf.id, "task management waiter gone");
        }
        slot.notify();
    }

    /// Called by the owner of an exchange right after moving it to Busy. A
    /// confirmation that raced the transition left the binding empty; finish
    /// its work here.
    pub(crate) fn settle_quarantine(&self, exchange: ExchangeRef, slot: &Slot, target: PortId) {
        let confirmed = slot.lock().binding.is_none();
        if confirmed {
            self.confirm_exchange(exchange, slot, Some(target));
        }
    }

    fn confirm_exchange(&self, exchange: ExchangeRef, slot: &Slot, target: Option<PortId>) {
        if self.pool.confirm(exchange.tag(), target) {
            debug!(tag = %exchange.tag(), "quarantined exchange confirmed");
            slot.notify();
        } else {
            trace!(tag = %exchange.tag(), "confirmation before quarantine");
        }
    }

    /// The adapter reports a busy exchange closed.
    pub fn exchange_aborted(&self, tag: ExchangeTag) {
        let Some((exchange, slot)) = self.slot_for(tag) else {
            warn!(%tag, "abort notification for unknown exchange");
            return;
        };
        let quarantined = {
            let mut guard = slot.lock();
            match guard.binding.take() {
                Some(Binding::Quarantined { target }) => Some(target),
                other => {
                    guard.binding = other;
                    None
                }
            }
        };
        match quarantined {
            Some(target) => self.confirm_exchange(exchange, slot, Some(target)),
            None if self.pool.state(tag) == Some(SlotState::Busy) => {
                self.confirm_exchange(exchange, slot, None)
            }
            None => trace!(%tag, "abort notification for idle exchange"),
        }
    }

    /// Handles of requests whose deadline has passed and that are not
    /// already being aborted.
    pub fn overdue(&self, now: Instant) -> Vec<IoHandle> {
        self.pool
            .in_use()
            .into_iter()
            .filter_map(|exchange| {
                let slot = self.pool.slot_at(exchange)?;
                let guard = slot.lock();
                match guard.binding.as_ref() {
                    Some(Binding::Io(io)) if io.abort.is_none() && io.deadline <= now => {
                        Some(io.handle(exchange.tag()))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    pub(crate) fn post_event(&self, event: MgmtEvent) {
        self.deferred.post(DeferredWork::Event(event));
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn run_deferred(&self, work: DeferredWork) {
        match work {
            DeferredWork::Depth(work) => {
                let targets = self.targets();
                for change in self.depth.apply(&work, &targets, Instant::now()) {
                    debug!(
                        target = %change.target,
                        lun = ?change.lun,
                        from = change.old,
                        to = change.new,
                        "queue depth changed"
                    );
                    self.events.post(MgmtEvent::QueueDepthChanged(change));
                }
            }
            DeferredWork::Event(event) => self.events.post(event),
            DeferredWork::Shutdown => {}
        }
    }

    /// Apply all queued deferred work on the calling thread. Returns the
    /// number of items processed.
    pub fn drain_deferred(&self) -> usize {
        let mut processed = 0;
        while let Some(work) = self.deferred.try_next() {
            self.run_deferred(work);
            processed += 1;
        }
        processed
    }

    /// Run deferred work on a background thread for as long as the handle
    /// lives.
    pub fn start_worker(self: &Arc<Self>) -> Result<WorkerHandle> {
        let engine = Arc::downgrade(self);
        self.deferred.spawn_worker("fcio-deferred", move |work| {
            let Some(engine) = engine.upgrade() else {
                return false;
            };
            engine.run_deferred(work);
            true
        })
    }

    pub fn pool_snapshot(&self) -> PoolSnapshot {
        self.pool.snapshot()
    }

    pub fn snapshot(&self) -> AdapterSnapshot {
        let pool = self.pool.snapshot();
        self.metrics.record_pool_in_use(pool.in_use);
        AdapterSnapshot {
            generation: self.pool.generation(),
            pool,
            metrics: self.metrics.snapshot(),
            targets: self.targets().iter().map(|target| target.snapshot()).collect(),
            deferred_backlog: self.deferred.len(),
        }
    }

    /// Zero per-target counters and latency histograms.
    pub fn reset_stats(&self) {
        for target in self.targets() {
            target.reset_stats();
        }
        debug!("target statistics reset");
    }

    /// Retire idle exchanges. Returns the number still outstanding.
    pub fn teardown(&self) -> usize {
        let stranded = self.pool.teardown();
        info!(stranded, "exchange engine torn down");
        stranded
    }
}

impl CompletionSink for Engine {
    fn complete(&self, completion: RawCompletion) {
        Engine::complete(self, completion);
    }

    fn exchange_aborted(&self, tag: ExchangeTag) {
        Engine::exchange_aborted(self, tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RingError;
    use crate::request::{Cdb, MemoryRegion};
    use crate::ring::{AbortRequest, WorkRequest};
    use fcio_buffers::Generation;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        submitted: Mutex<Vec<WorkRequest>>,
    }

    impl SglRegistrar for Recorder {
        fn post_sgl_block(&self, _block: &[SglPost]) -> std::result::Result<(), RegistrationError> {
            Ok(())
        }
    }

    impl HardwareRing for Recorder {
        fn submit(&self, request: &WorkRequest) -> std::result::Result<(), RingError> {
            self.submitted.lock().unwrap().push(request.clone());
            Ok(())
        }

        fn abort(&self, _request: &AbortRequest) -> std::result::Result<(), RingError> {
            Ok(())
        }

        fn link_up(&self) -> bool {
            true
        }
    }

    fn port() -> PortId {
        PortId::new(0x0a0100).unwrap()
    }

    fn engine(generation: Generation) -> (Engine, Arc<Recorder>) {
        let ring = Arc::new(Recorder::default());
        let config = EngineConfig {
            generation,
            hba_queue_depth: 64,
            discovery_reserve: 4,
            lun_queue_depth: 4,
            ..EngineConfig::default()
        };
        let engine = Engine::new(config, ring.clone()).unwrap();
        engine.add_target(port(), TargetParams::default());
        engine.add_lun(port(), 0).unwrap();
        (engine, ring)
    }

    fn write() -> ScsiRequest {
        ScsiRequest::with_data(
            port(),
            0,
            Cdb::new(&[0x2a, 0, 0, 0, 0, 0, 0, 0, 1, 0]).unwrap(),
            DataDirection::ToDevice,
            vec![MemoryRegion::new(0x8000, 512)],
        )
        .unwrap()
    }

    fn latency_engine(flags: EngineFlags) -> Engine {
        let config = EngineConfig {
            hba_queue_depth: 64,
            discovery_reserve: 4,
            lun_queue_depth: 4,
            latency: crate::config::LatencyConfig {
                kind: crate::config::BucketKind::Linear,
                ..Default::default()
            },
            flags,
            ..EngineConfig::default()
        };
        let engine = Engine::new(config, Arc::new(Recorder::default())).unwrap();
        engine.add_target(port(), TargetParams::default());
        engine.add_lun(port(), 0).unwrap();
        engine
    }

    fn recorded_latency(engine: &Engine) -> u64 {
        let ticket = engine.dispatch(write()).unwrap();
        engine.complete(RawCompletion::new(ticket.handle.tag, IoStatus::Success.into()));
        let target = engine.target(port()).unwrap();
        target.latency().unwrap().snapshot().iter().sum()
    }

    #[test]
    fn latency_needs_statistics_enabled() {
        let engine = latency_engine(EngineFlags::LATENCY);
        assert_eq!(recorded_latency(&engine), 0);

        let engine = latency_engine(EngineFlags::LATENCY | EngineFlags::STATS);
        assert_eq!(recorded_latency(&engine), 1);
        engine.reset_stats();
        let snapshot = engine.target(port()).unwrap().snapshot();
        assert!(snapshot.latency.unwrap().iter().all(|count| *count == 0));
        assert_eq!(snapshot.completed, 0);
    }

    #[test]
    fn add_lun_provisions_depth_plus_two() {
        let (engine, _) = engine(Generation::Modern);
        assert_eq!(engine.pool_snapshot().provisioned, 6);
        assert_eq!(engine.pool_snapshot().free, 6);
    }

    #[test]
    fn dispatch_binds_and_completion_releases() {
        let (engine, ring) = engine(Generation::Legacy);
        let mut ticket = engine.dispatch(write()).unwrap();
        assert_eq!(ring.submitted.lock().unwrap().len(), 1);
        assert_eq!(engine.target(port()).unwrap().pending(), 1);
        assert_eq!(engine.pool_snapshot().in_use, 1);

        engine.complete(RawCompletion::new(ticket.handle.tag, IoStatus::Success.into()));
        let completion = ticket.completion.try_recv().unwrap().unwrap();
        assert!(completion.is_success());
        assert_eq!(completion.id, ticket.handle.id);
        assert_eq!(engine.target(port()).unwrap().pending(), 0);
        assert_eq!(engine.pool_snapshot().free, 6);
    }

    #[test]
    fn second_completion_for_same_tag_is_dropped() {
        let (engine, _) = engine(Generation::Modern);
        let ticket = engine.dispatch(write()).unwrap();
        let raw = RawCompletion::new(ticket.handle.tag, IoStatus::Success.into());
        engine.complete(raw.clone());
        engine.complete(raw);
        assert_eq!(engine.snapshot().metrics.stale_completions, 1);
        assert_eq!(engine.pool_snapshot().free, 6);
    }

    #[test]
    fn unknown_target_is_not_ready() {
        let (engine, ring) = engine(Generation::Modern);
        let mut request = write();
        request.target = PortId::new(0x0b0000).unwrap();
        let err = engine.dispatch(request).unwrap_err();
        assert_eq!(err.kind(), DispatchErrorKind::NotReady);
        assert!(ring.submitted.lock().unwrap().is_empty());
    }

    #[test]
    fn lun_depth_limits_dispatch() {
        let (engine, _) = engine(Generation::Modern);
        let tickets: Vec<_> = (0..4).map(|_| engine.dispatch(write()).unwrap()).collect();
        let err = engine.dispatch(write()).unwrap_err();
        assert_eq!(err.kind(), DispatchErrorKind::Busy);
        assert_eq!(engine.target(port()).unwrap().counters.busy_rejects.load(Ordering::Relaxed), 1);
        drop(tickets);
    }

    #[test]
    fn adapter_error_floors_not_ready_target() {
        let (engine, _) = engine(Generation::Modern);
        engine.set_readiness(port(), Readiness::NotReady);
        engine.set_adapter_error(true);
        assert_eq!(
            engine.dispatch(write()).unwrap_err().kind(),
            DispatchErrorKind::NotReady
        );
        engine.drain_deferred();
        assert_eq!(engine.target(port()).unwrap().lun(0).depth(), 1);
    }
}
