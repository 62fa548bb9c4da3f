//! Adaptive queue depth.
//!
//! The completion path only calls [`QueueDepthController::observe`], which
//! counts and rate-limits. Depth changes themselves are [`DepthWork`] items
//! applied later by the deferred worker.

use crate::classify::DepthSignal;
use crate::config::{EngineConfig, EngineFlags};
use crate::events::DepthChange;
use crate::target::{LunQueue, TargetContext};
use fcio_proto::opcode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

pub const RAMP_DOWN_INTERVAL: Duration = Duration::from_secs(1);
pub const RAMP_UP_INTERVAL: Duration = Duration::from_secs(300);
pub const QUEUE_FULL_GRACE: Duration = Duration::from_secs(120);
pub const CEILING_STEP_INTERVAL: Duration = Duration::from_secs(40);
pub const CEILING_STEP_PERCENT: u32 = 5;
/// Pending commands below which the latency throttle never engages.
pub const THROTTLE_MIN_PENDING: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepthPolicy {
    pub ramp_up: bool,
    pub ramp_up_percent: u32,
    pub max_completion_time: Option<Duration>,
}

impl DepthPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            ramp_up: config.flags.contains(EngineFlags::RAMP_UP),
            ramp_up_percent: config.ramp_up_percent,
            max_completion_time: config.max_completion_time(),
        }
    }
}

/// Deferred depth adjustment.
#[derive(Clone, Debug)]
pub enum DepthWork {
    /// Cut every LUN proportionally to the recent failure ratio.
    RampDown,
    /// Grow every LUN outside its queue-full grace period.
    RampUp,
    QueueFull {
        target: Arc<TargetContext>,
        lun: Arc<LunQueue>,
        in_flight: u32,
    },
    /// Pin the target ceiling at the pending count seen on a slow completion.
    Throttle {
        target: Arc<TargetContext>,
        pending: u32,
    },
    CeilingStep {
        target: Arc<TargetContext>,
    },
    /// The adapter is in an error state: drop every LUN of the target to 1.
    Floor {
        target: Arc<TargetContext>,
    },
}

/// One completion as seen by the controller.
#[derive(Clone, Copy, Debug)]
pub struct Observation<'a> {
    pub signal: DepthSignal,
    pub target: &'a Arc<TargetContext>,
    pub lun: &'a Arc<LunQueue>,
    pub opcode: u8,
    pub latency: Duration,
    /// Target pending count including this request.
    pub pending: u32,
    /// LUN pending count including this request.
    pub lun_in_flight: u32,
}

#[derive(Debug)]
struct RampState {
    last_ramp_down: Option<Instant>,
    last_ramp_up: Instant,
    last_resource_error: Option<Instant>,
}

#[derive(Debug)]
pub struct QueueDepthController {
    policy: DepthPolicy,
    resource_errors: AtomicU64,
    successes: AtomicU64,
    state: Mutex<RampState>,
}

impl QueueDepthController {
    pub fn new(policy: DepthPolicy, now: Instant) -> Self {
        Self {
            policy,
            resource_errors: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            state: Mutex::new(RampState {
                last_ramp_down: None,
                last_ramp_up: now,
                last_resource_error: None,
            }),
        }
    }

    pub fn policy(&self) -> DepthPolicy {
        self.policy
    }

    /// Count a resource failure and schedule a ramp-down unless one ran
    /// within the interval.
    pub fn resource_error(&self, now: Instant) -> Option<DepthWork> {
        self.resource_errors.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();
        state.last_resource_error = Some(now);
        let due = state
            .last_ramp_down
            .map_or(true, |last| now.saturating_duration_since(last) >= RAMP_DOWN_INTERVAL);
        if !due {
            return None;
        }
        state.last_ramp_down = Some(now);
        Some(DepthWork::RampDown)
    }

    pub fn observe(&self, obs: &Observation<'_>, now: Instant) -> Vec<DepthWork> {
        let mut work = Vec::new();
        match obs.signal {
            DepthSignal::ResourceError => work.extend(self.resource_error(now)),
            DepthSignal::QueueFull => {
                work.extend(self.resource_error(now));
                work.push(DepthWork::QueueFull {
                    target: obs.target.clone(),
                    lun: obs.lun.clone(),
                    in_flight: obs.lun_in_flight,
                });
            }
            DepthSignal::Success => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                if self.policy.ramp_up
                    && obs.lun.depth() < obs.lun.ceiling()
                    && self.claim_ramp_up(now)
                {
                    work.push(DepthWork::RampUp);
                }
            }
            DepthSignal::Neutral => {}
        }

        let target = obs.target;
        let slow = self
            .policy
            .max_completion_time
            .is_some_and(|max| obs.latency > max);
        if slow {
            if matches!(obs.opcode, opcode::READ_10 | opcode::WRITE_10)
                && obs.pending > THROTTLE_MIN_PENDING
                && target.ceiling() > obs.pending
            {
                work.push(DepthWork::Throttle {
                    target: target.clone(),
                    pending: obs.pending,
                });
            }
        } else if target.ceiling() < target.max_ceiling()
            && target.claim_ceiling_step(now, CEILING_STEP_INTERVAL)
        {
            work.push(DepthWork::CeilingStep {
                target: target.clone(),
            });
        }
        work
    }

    fn claim_ramp_up(&self, now: Instant) -> bool {
        let mut state = self.lock();
        let cooled = |since: Instant| now.saturating_duration_since(since) >= RAMP_UP_INTERVAL;
        if !cooled(state.last_ramp_up) || !state.last_resource_error.map_or(true, cooled) {
            return false;
        }
        state.last_ramp_up = now;
        true
    }

    /// Apply `work` to `targets`, returning every change made.
    pub fn apply(
        &self,
        work: &DepthWork,
        targets: &[Arc<TargetContext>],
        now: Instant,
    ) -> Vec<DepthChange> {
        let mut changes = Vec::new();
        match work {
            DepthWork::RampDown => {
                let errors = self.resource_errors.swap(0, Ordering::Relaxed);
                let successes = self.successes.swap(0, Ordering::Relaxed);
                for target in targets {
                    for lun in target.luns() {
                        let depth = lun.depth();
                        let new = ramp_down_depth(depth, errors, successes);
                        record(&mut changes, target, &lun, new);
                    }
                }
                debug!(errors, successes, changed = changes.len(), "ramp down");
            }
            DepthWork::RampUp => {
                for target in targets {
                    for lun in target.luns() {
                        let depth = lun.depth();
                        let in_grace = lun.last_full().is_some_and(|last| {
                            now.saturating_duration_since(last) < QUEUE_FULL_GRACE
                        });
                        if depth >= lun.ceiling() || in_grace {
                            continue;
                        }
                        let step = (depth * self.policy.ramp_up_percent / 100).max(1);
                        record(&mut changes, target, &lun, depth.saturating_add(step));
                    }
                }
                self.resource_errors.store(0, Ordering::Relaxed);
                self.successes.store(0, Ordering::Relaxed);
                debug!(changed = changes.len(), "ramp up");
            }
            DepthWork::QueueFull {
                target,
                lun,
                in_flight,
            } => {
                let depth = lun.depth();
                let new = depth
                    .saturating_sub(1)
                    .min(in_flight.saturating_sub(1))
                    .max(1);
                lun.mark_full(now);
                record(&mut changes, target, lun, new);
            }
            DepthWork::Throttle { target, pending } => {
                let old = target.set_ceiling(*pending, now);
                push_ceiling(&mut changes, target, old);
            }
            DepthWork::CeilingStep { target } => {
                let ceiling = target.ceiling();
                let step = (ceiling * CEILING_STEP_PERCENT / 100).max(1);
                let old = target.set_ceiling(ceiling.saturating_add(step), now);
                push_ceiling(&mut changes, target, old);
            }
            DepthWork::Floor { target } => {
                for lun in target.luns() {
                    record(&mut changes, target, &lun, 1);
                }
            }
        }
        changes
    }

    fn lock(&self) -> MutexGuard<'_, RampState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Depth after a ramp-down given the failure and success counts since the
/// last one. Never below 1.
pub fn ramp_down_depth(depth: u32, errors: u64, successes: u64) -> u32 {
    let total = errors + successes;
    let cut = if total == 0 {
        0
    } else {
        (u64::from(depth) * errors / total) as u32
    };
    let new = if cut == 0 {
        depth.saturating_sub(1)
    } else {
        depth.saturating_sub(cut)
    };
    new.max(1)
}

fn record(changes: &mut Vec<DepthChange>, target: &TargetContext, lun: &LunQueue, depth: u32) {
    let old = lun.set_depth(depth);
    let new = lun.depth();
    if old != new {
        changes.push(DepthChange {
            target: target.id(),
            lun: Some(lun.lun()),
            old,
            new,
        });
    }
}

fn push_ceiling(changes: &mut Vec<DepthChange>, target: &TargetContext, old: u32) {
    let new = target.ceiling();
    if old != new {
        changes.push(DepthChange {
            target: target.id(),
            lun: None,
            old,
            new,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetParams;
    use fcio_proto::PortId;

    const POLICY: DepthPolicy = DepthPolicy {
        ramp_up: true,
        ramp_up_percent: 5,
        max_completion_time: None,
    };

    fn target(now: Instant, lun_depth: u32) -> Arc<TargetContext> {
        Arc::new(TargetContext::new(
            PortId::new(0x20100).unwrap(),
            TargetParams::default(),
            512,
            lun_depth,
            None,
            now,
        ))
    }

    fn observation<'a>(
        signal: DepthSignal,
        target: &'a Arc<TargetContext>,
        lun: &'a Arc<LunQueue>,
    ) -> Observation<'a> {
        Observation {
            signal,
            target,
            lun,
            opcode: opcode::READ_10,
            latency: Duration::from_millis(1),
            pending: 1,
            lun_in_flight: 1,
        }
    }

    #[test]
    fn ramp_down_formula() {
        assert_eq!(ramp_down_depth(30, 1, 0), 1);
        assert_eq!(ramp_down_depth(30, 1, 9), 27);
        assert_eq!(ramp_down_depth(30, 1, 100), 29);
        assert_eq!(ramp_down_depth(1, 5, 0), 1);
        assert_eq!(ramp_down_depth(10, 0, 0), 9);
    }

    #[test]
    fn ramp_down_is_rate_limited() {
        let now = Instant::now();
        let controller = QueueDepthController::new(POLICY, now);
        assert!(matches!(controller.resource_error(now), Some(DepthWork::RampDown)));
        assert!(controller.resource_error(now + Duration::from_millis(500)).is_none());
        assert!(controller.resource_error(now + Duration::from_secs(1)).is_some());
    }

    #[test]
    fn ramp_down_cuts_every_lun() {
        let now = Instant::now();
        let controller = QueueDepthController::new(POLICY, now);
        let target = target(now, 30);
        let lun = target.lun(0);
        target.lun(1);
        for _ in 0..9 {
            controller.observe(&observation(DepthSignal::Success, &target, &lun), now);
        }
        let work = controller.resource_error(now).unwrap();
        let changes = controller.apply(&work, &[target.clone()], now);
        assert_eq!(changes.len(), 2);
        assert!(target.luns().iter().all(|lun| lun.depth() == 27));
    }

    #[test]
    fn queue_full_decreases_strictly_to_floor() {
        let now = Instant::now();
        let controller = QueueDepthController::new(POLICY, now);
        let target = target(now, 4);
        let lun = target.lun(0);
        let mut depths = Vec::new();
        for _ in 0..5 {
            let work = DepthWork::QueueFull {
                target: target.clone(),
                lun: lun.clone(),
                in_flight: 10,
            };
            controller.apply(&work, &[], now);
            depths.push(lun.depth());
        }
        assert_eq!(depths, vec![3, 2, 1, 1, 1]);
        assert_eq!(lun.last_full(), Some(now));
    }

    #[test]
    fn queue_full_caps_at_in_flight() {
        let now = Instant::now();
        let controller = QueueDepthController::new(POLICY, now);
        let target = target(now, 30);
        let lun = target.lun(0);
        let work = DepthWork::QueueFull {
            target: target.clone(),
            lun: lun.clone(),
            in_flight: 8,
        };
        let changes = controller.apply(&work, &[], now);
        assert_eq!(lun.depth(), 7);
        assert_eq!(changes[0].old, 30);
    }

    #[test]
    fn ramp_up_waits_for_cooldown_and_skips_grace() {
        let start = Instant::now();
        let controller = QueueDepthController::new(POLICY, start);
        let target = target(start, 40);
        let lun = target.lun(0);
        let full = target.lun(1);
        lun.set_depth(20);
        full.set_depth(20);
        full.mark_full(start + Duration::from_secs(250));

        let early = controller.observe(&observation(DepthSignal::Success, &target, &lun), start);
        assert!(!early.iter().any(|w| matches!(w, DepthWork::RampUp)));

        let later = start + RAMP_UP_INTERVAL;
        let work = controller.observe(&observation(DepthSignal::Success, &target, &lun), later);
        let ramp = work
            .iter()
            .find(|w| matches!(w, DepthWork::RampUp))
            .unwrap();
        controller.apply(ramp, &[target.clone()], later);
        assert_eq!(lun.depth(), 21);
        assert_eq!(full.depth(), 20);
    }

    #[test]
    fn ramp_up_blocked_by_recent_resource_error() {
        let start = Instant::now();
        let controller = QueueDepthController::new(POLICY, start);
        let target = target(start, 40);
        let lun = target.lun(0);
        lun.set_depth(10);
        controller.resource_error(start + Duration::from_secs(200));
        let at = start + RAMP_UP_INTERVAL;
        let work = controller.observe(&observation(DepthSignal::Success, &target, &lun), at);
        assert!(!work.iter().any(|w| matches!(w, DepthWork::RampUp)));
    }

    #[test]
    fn ramp_up_never_exceeds_ceiling() {
        let now = Instant::now();
        let controller = QueueDepthController::new(POLICY, now);
        let target = target(now, 30);
        let lun = target.lun(0);
        lun.set_depth(29);
        controller.apply(&DepthWork::RampUp, &[target.clone()], now);
        controller.apply(&DepthWork::RampUp, &[target.clone()], now);
        assert_eq!(lun.depth(), 30);
    }

    #[test]
    fn slow_completion_throttles_target_ceiling() {
        let now = Instant::now();
        let policy = DepthPolicy {
            max_completion_time: Some(Duration::from_millis(100)),
            ..POLICY
        };
        let controller = QueueDepthController::new(policy, now);
        let target = target(now, 30);
        let lun = target.lun(0);
        let obs = Observation {
            latency: Duration::from_millis(150),
            pending: 200,
            ..observation(DepthSignal::Success, &target, &lun)
        };
        let work = controller.observe(&obs, now);
        let throttle = work
            .iter()
            .find(|w| matches!(w, DepthWork::Throttle { .. }))
            .unwrap();
        let changes = controller.apply(throttle, &[], now);
        assert_eq!(target.ceiling(), 200);
        assert_eq!(changes[0].lun, None);

        // a slow completion with few pending commands leaves the ceiling alone
        let obs = Observation { pending: 50, ..obs };
        assert!(controller.observe(&obs, now).is_empty());
    }

    #[test]
    fn ceiling_steps_back_up() {
        let now = Instant::now();
        let controller = QueueDepthController::new(POLICY, now);
        let target = target(now, 30);
        let lun = target.lun(0);
        target.set_ceiling(100, now);
        let at = now + CEILING_STEP_INTERVAL;
        let work = controller.observe(&observation(DepthSignal::Neutral, &target, &lun), at);
        assert_eq!(work.len(), 1);
        controller.apply(&work[0], &[], at);
        assert_eq!(target.ceiling(), 105);
        assert!(controller
            .observe(&observation(DepthSignal::Neutral, &target, &lun), at)
            .is_empty());
    }

    #[test]
    fn floor_drops_every_lun() {
        let now = Instant::now();
        let controller = QueueDepthController::new(POLICY, now);
        let target = target(now, 30);
        target.lun(0);
        target.lun(7);
        let changes = controller.apply(&DepthWork::Floor { target: target.clone() }, &[], now);
        assert_eq!(changes.len(), 2);
        assert!(target.luns().iter().all(|lun| lun.depth() == 1));
    }
}
