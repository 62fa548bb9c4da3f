use crate::config::{BucketKind, LatencyConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const LATENCY_BUCKETS: usize = 20;

/// Completion latency histogram for one target.
#[derive(Debug)]
pub struct LatencyHistogram {
    kind: BucketKind,
    base_ms: u64,
    step_ms: u64,
    buckets: [AtomicU64; LATENCY_BUCKETS],
}

impl LatencyHistogram {
    /// `None` when histograms are disabled.
    pub fn new(config: &LatencyConfig) -> Option<Self> {
        if config.kind == BucketKind::None || config.step_ms == 0 {
            return None;
        }
        Some(Self {
            kind: config.kind,
            base_ms: config.base_ms,
            step_ms: config.step_ms,
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        })
    }

    pub fn bucket_for(&self, latency: Duration) -> usize {
        let ms = latency.as_millis().min(u64::MAX as u128) as u64;
        if ms <= self.base_ms {
            return 0;
        }
        let index = match self.kind {
            BucketKind::Linear => (ms - self.base_ms).div_ceil(self.step_ms),
            BucketKind::Power2 | BucketKind::None => (0..LATENCY_BUCKETS as u32 - 1)
                .find(|&i| {
                    ms <= self
                        .base_ms
                        .saturating_add(self.step_ms.saturating_mul(1 << i))
                })
                .map_or(LATENCY_BUCKETS as u64 - 1, u64::from),
        };
        (index as usize).min(LATENCY_BUCKETS - 1)
    }

    pub fn record(&self, latency: Duration) {
        self.buckets[self.bucket_for(latency)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|bucket| bucket.load(Ordering::Relaxed))
            .collect()
    }

    pub(crate) fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
    }
}
