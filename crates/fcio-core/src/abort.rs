//! Abort, task management and the post-reset sweep.

use crate::classify::AbortCause;
use crate::engine::{Binding, Engine, IoBinding, Slot, TaskMgmtBinding};
use crate::error::{AbortError, AbortErrorKind};
use crate::events::MgmtEvent;
use crate::prep::{prepare_task_mgmt, unmap_all};
use crate::request::{CompletionResult, HostStatus, IoCompletion, IoHandle, RequestId};
use crate::ring::AbortRequest;
use crate::target::Readiness;
use fcio_buffers::ExchangeRef;
use fcio_proto::{PortId, TaskMgmtFlags, scsi_status};
use futures_channel::oneshot;
use std::fmt;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SWEEP_POLL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortOutcome {
    /// The adapter confirmed the abort.
    Aborted,
    /// The request had already completed; nothing was sent.
    AlreadyCompleted,
}

/// Task management functions carried in the FCP command unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskMgmtKind {
    AbortTaskSet,
    ClearTaskSet,
    BusReset,
    LunReset,
    TargetReset,
    ClearAca,
    TerminateTask,
}

impl TaskMgmtKind {
    pub fn flags(self) -> TaskMgmtFlags {
        match self {
            TaskMgmtKind::AbortTaskSet => TaskMgmtFlags::ABORT_TASK_SET,
            TaskMgmtKind::ClearTaskSet => TaskMgmtFlags::CLEAR_TASK_SET,
            TaskMgmtKind::BusReset => TaskMgmtFlags::BUS_RESET,
            TaskMgmtKind::LunReset => TaskMgmtFlags::LUN_RESET,
            TaskMgmtKind::TargetReset => TaskMgmtFlags::TARGET_RESET,
            TaskMgmtKind::ClearAca => TaskMgmtFlags::CLEAR_ACA,
            TaskMgmtKind::TerminateTask => TaskMgmtFlags::TERMINATE_TASK,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskMgmtKind::AbortTaskSet => "abort_task_set",
            TaskMgmtKind::ClearTaskSet => "clear_task_set",
            TaskMgmtKind::BusReset => "bus_reset",
            TaskMgmtKind::LunReset => "lun_reset",
            TaskMgmtKind::TargetReset => "target_reset",
            TaskMgmtKind::ClearAca => "clear_aca",
            TaskMgmtKind::TerminateTask => "terminate_task",
        }
    }
}

impl fmt::Display for TaskMgmtKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which outstanding requests a sweep covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetScope {
    Lun { target: PortId, lun: u64 },
    Target(PortId),
    Host,
}

impl ResetScope {
    fn covers(self, target: PortId, lun: u64) -> bool {
        match self {
            ResetScope::Lun {
                target: scope_target,
                lun: scope_lun,
            } => scope_target == target && scope_lun == lun,
            ResetScope::Target(scope_target) => scope_target == target,
            ResetScope::Host => true,
        }
    }
}

fn bound_to(binding: &Option<Binding>, id: RequestId) -> bool {
    matches!(binding, Some(Binding::Io(io)) if io.id == id)
}

impl Engine {
    /// Abort one outstanding request and wait for the adapter to confirm.
    ///
    /// If the confirmation does not arrive within twice the device-loss
    /// timeout the request completes with a timeout and its exchange stays
    /// quarantined until the adapter releases it.
    pub fn abort(&self, handle: IoHandle) -> Result<AbortOutcome, AbortError> {
        let (exchange, slot) = self.slot_for(handle.tag).ok_or_else(|| {
            AbortError::with_message(AbortErrorKind::NotFound, format!("tag {}", handle.tag))
        })?;
        let request = {
            let mut guard = slot.lock();
            match guard.binding.as_mut() {
                Some(Binding::Io(io)) if io.id == handle.id => {
                    io.abort = Some(AbortCause::Timeout);
                    abort_request(exchange, io, !self.ring.link_up())
                }
                _ => return Ok(AbortOutcome::AlreadyCompleted),
            }
        };

        if let Err(err) = self.ring.abort(&request) {
            let mut guard = slot.lock();
            if let Some(Binding::Io(io)) = guard.binding.as_mut() {
                if io.id == handle.id {
                    io.abort = None;
                }
            }
            return Err(AbortError::with_message(
                AbortErrorKind::Submit,
                err.to_string(),
            ));
        }
        info!(
            tag = %handle.tag,
            id = %handle.id,
            target = %handle.target,
            close = request.close,
            "abort issued"
        );

        let deadline = Instant::now() + self.config.abort_wait();
        let mut guard = slot.lock();
        loop {
            if !bound_to(&guard.binding, handle.id) {
                drop(guard);
                self.metrics.record_abort(false);
                return Ok(AbortOutcome::Aborted);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            guard = slot.wait_timeout(guard, deadline - now);
        }

        let io = match guard.binding.take() {
            Some(Binding::Io(io)) => {
                guard.binding = Some(Binding::Quarantined {
                    target: io.target.id(),
                });
                io
            }
            other => {
                guard.binding = other;
                return Ok(AbortOutcome::Aborted);
            }
        };
        drop(guard);
        warn!(
            tag = %handle.tag,
            id = %handle.id,
            "abort not confirmed; exchange quarantined"
        );
        io.target.counters.abts.fetch_add(1, Ordering::Relaxed);
        self.cancel_claimed(exchange, slot, io);
        self.metrics.record_abort(true);
        Err(AbortError::with_message(
            AbortErrorKind::Timeout,
            format!("no confirmation for {}", handle.id),
        ))
    }

    /// Finish a request whose binding the caller replaced with a quarantine
    /// marker.
    fn cancel_claimed(&self, exchange: ExchangeRef, slot: &Slot, io: IoBinding) {
        io.target.dec_pending();
        io.lun.dec_pending();
        unmap_all(self.mapper.as_ref(), &io.mappings, io.direction);
        if self.pool.quarantine(exchange) {
            self.settle_quarantine(exchange, slot, io.target.id());
        } else {
            warn!(tag = %exchange.tag(), "cancelled exchange was not in use");
        }
        let completion = IoCompletion {
            id: io.id,
            result: CompletionResult::Timeout,
            host_status: HostStatus::Aborted,
            scsi_status: scsi_status::GOOD,
            residual: io.length,
            sense: Vec::new(),
        };
        let _ = io.done.send(completion);
        slot.notify();
    }

    /// Send one task management command and wait for its outcome.
    ///
    /// On timeout the exchange is left to its eventual completion.
    pub fn task_mgmt(
        &self,
        target: PortId,
        lun: u64,
        kind: TaskMgmtKind,
    ) -> Result<(), AbortError> {
        let context = self
            .target(target)
            .filter(|context| context.readiness() == Readiness::Ready)
            .ok_or_else(|| {
                AbortError::with_message(AbortErrorKind::NotFound, format!("target {target}"))
            })?;
        let exchange = self
            .pool
            .acquire(target)
            .ok_or_else(|| AbortError::new(AbortErrorKind::NoResources))?;
        let Some(slot) = self.pool.slot_at(exchange) else {
            self.pool.release(exchange, false);
            return Err(AbortError::new(AbortErrorKind::NoResources));
        };

        let id = self.next_request_id();
        let (done, mut outcome) = oneshot::channel();
        let work = {
            let mut guard = slot.lock();
            match prepare_task_mgmt(
                &self.pool,
                &mut guard,
                &context,
                lun,
                kind.flags(),
                self.config.task_mgmt_timeout(),
            ) {
                Ok(work) => {
                    guard.binding = Some(Binding::TaskMgmt(TaskMgmtBinding {
                        id,
                        target: context.clone(),
                        done,
                    }));
                    work
                }
                Err(err) => {
                    drop(guard);
                    self.pool.release(exchange, false);
                    return Err(AbortError::with_message(
                        AbortErrorKind::Submit,
                        err.to_string(),
                    ));
                }
            }
        };

        if let Err(err) = self.ring.submit(&work) {
            let reclaimed = {
                let mut guard = slot.lock();
                match guard.binding.take() {
                    Some(Binding::TaskMgmt(tmf)) if tmf.id == id => true,
                    other => {
                        guard.binding = other;
                        false
                    }
                }
            };
            if reclaimed {
                self.pool.release(exchange, false);
            }
            return Err(AbortError::with_message(
                AbortErrorKind::Submit,
                err.to_string(),
            ));
        }
        info!(%target, lun, %kind, tag = %exchange.tag(), "task management issued");

        let deadline = Instant::now() + self.config.task_mgmt_timeout();
        let mut guard = slot.lock();
        let success = loop {
            match outcome.try_recv() {
                Ok(Some(success)) => break Some(success),
                Ok(None) => {}
                Err(_) => break Some(false),
            }
            let now = Instant::now();
            if now >= deadline {
                break None;
            }
            guard = slot.wait_timeout(guard, deadline - now);
        };
        drop(guard);

        match success {
            Some(true) => {
                match kind {
                    TaskMgmtKind::LunReset => {
                        context.counters.lun_resets.fetch_add(1, Ordering::Relaxed);
                    }
                    TaskMgmtKind::TargetReset => {
                        context.counters.target_resets.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                Ok(())
            }
            Some(false) => Err(AbortError::with_message(
                AbortErrorKind::Rejected,
                format!("{kind} refused by {target}"),
            )),
            None => {
                warn!(%target, lun, %kind, "task management timed out");
                Err(AbortError::with_message(
                    AbortErrorKind::Timeout,
                    format!("{kind} to {target}"),
                ))
            }
        }
    }

    pub fn reset_lun(&self, target: PortId, lun: u64) -> Result<(), AbortError> {
        let reset = self.task_mgmt(target, lun, TaskMgmtKind::LunReset);
        let swept = match &reset {
            Ok(()) => self.sweep(ResetScope::Lun { target, lun }),
            Err(_) => Ok(()),
        };
        let result = reset.and(swept);
        self.post_event(MgmtEvent::LunReset {
            target,
            lun,
            success: result.is_ok(),
        });
        result
    }

    pub fn reset_target(&self, target: PortId) -> Result<(), AbortError> {
        let reset = self.task_mgmt(target, 0, TaskMgmtKind::TargetReset);
        let swept = match &reset {
            Ok(()) => self.sweep(ResetScope::Target(target)),
            Err(_) => Ok(()),
        };
        let result = reset.and(swept);
        self.post_event(MgmtEvent::TargetReset {
            target,
            success: result.is_ok(),
        });
        result
    }

    /// Reset every ready target, then sweep the whole adapter.
    pub fn reset_bus(&self) -> Result<(), AbortError> {
        let targets: Vec<_> = self
            .targets()
            .into_iter()
            .filter(|target| target.readiness() == Readiness::Ready)
            .collect();
        let mut first_error = None;
        for target in &targets {
            if let Err(err) = self.task_mgmt(target.id(), 0, TaskMgmtKind::TargetReset) {
                warn!(target = %target.id(), "bus reset: {err}");
                first_error.get_or_insert(err);
            }
        }
        let swept = self.sweep(ResetScope::Host);
        let result = match first_error {
            Some(err) => Err(err),
            None => swept,
        };
        self.post_event(MgmtEvent::BusReset {
            targets: targets.len(),
            success: result.is_ok(),
        });
        result
    }

    /// Abort every request in `scope` and wait, bounded, for them to drain.
    pub fn sweep(&self, scope: ResetScope) -> Result<(), AbortError> {
        let close = !self.ring.link_up();
        let mut issued = 0usize;
        for exchange in self.pool.in_use() {
            let Some(slot) = self.pool.slot_at(exchange) else {
                continue;
            };
            let request = {
                let mut guard = slot.lock();
                match guard.binding.as_mut() {
                    Some(Binding::Io(io))
                        if io.abort.is_none() && scope.covers(io.target.id(), io.lun.lun()) =>
                    {
                        io.abort = Some(AbortCause::Reset);
                        Some(abort_request(exchange, io, close))
                    }
                    _ => None,
                }
            };
            let Some(request) = request else {
                continue;
            };
            match self.ring.abort(&request) {
                Ok(()) => issued += 1,
                Err(err) => warn!(tag = %exchange.tag(), "sweep abort failed: {err}"),
            }
        }
        debug!(?scope, issued, "sweep aborts issued");

        let started = Instant::now();
        let bound = self.config.sweep_bound();
        loop {
            let remaining = self.outstanding(scope);
            if remaining == 0 {
                return Ok(());
            }
            if started.elapsed() >= bound {
                warn!(?scope, remaining, "sweep incomplete");
                return Err(AbortError::with_message(
                    AbortErrorKind::SweepIncomplete,
                    format!("{remaining} requests outstanding"),
                ));
            }
            thread::sleep(SWEEP_POLL);
        }
    }

    /// Requests in `scope` still bound to an exchange.
    pub fn outstanding(&self, scope: ResetScope) -> usize {
        self.pool
            .in_use()
            .into_iter()
            .filter(|exchange| {
                self.pool.slot_at(*exchange).is_some_and(|slot| {
                    matches!(
                        slot.lock().binding.as_ref(),
                        Some(Binding::Io(io)) if scope.covers(io.target.id(), io.lun.lun())
                    )
                })
            })
            .count()
    }
}

fn abort_request(exchange: ExchangeRef, io: &IoBinding, close: bool) -> AbortRequest {
    AbortRequest {
        tag: exchange.tag(),
        target: io.target.id(),
        context: io.target.params().context,
        close,
    }
}
