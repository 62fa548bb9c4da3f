use crate::error::ConfigError;
use anyhow::{Context, Result};
use bitflags::bitflags;
use fcio_buffers::Generation;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

/// Largest descriptor table the preparer will build.
pub const MAX_SG_SEGMENTS: usize = 4096;

bitflags! {
    /// Optional engine behaviors.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct EngineFlags: u32 {
        /// Keep per-target completion statistics.
        const STATS = 1 << 0;
        /// Record per-target latency histograms.
        const LATENCY = 1 << 1;
        /// Grow LUN depth after sustained error-free operation.
        const RAMP_UP = 1 << 2;
    }
}

impl Default for EngineFlags {
    fn default() -> Self {
        EngineFlags::STATS | EngineFlags::RAMP_UP
    }
}

/// Shape of the per-target latency histogram buckets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketKind {
    #[default]
    None,
    Linear,
    Power2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    pub kind: BucketKind,
    /// Latency in milliseconds at or below which samples land in bucket 0.
    pub base_ms: u64,
    pub step_ms: u64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            kind: BucketKind::None,
            base_ms: 10,
            step_ms: 10,
        }
    }
}

/// Engine tunables. Durations are milliseconds on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub generation: Generation,
    /// Exchanges the adapter supports.
    pub hba_queue_depth: u16,
    /// Exchanges kept back for discovery and ELS traffic.
    pub discovery_reserve: u16,
    pub lun_queue_depth: u32,
    pub target_queue_depth: u32,
    pub max_sg_segments: usize,
    pub xri_base: u16,
    pub command_timeout_ms: u64,
    pub devloss_timeout_ms: u64,
    pub task_mgmt_timeout_ms: u64,
    /// 0 disables the target latency throttle.
    pub max_completion_time_ms: u64,
    pub ramp_up_percent: u32,
    pub reuse_hold_ms: u64,
    pub latency: LatencyConfig,
    pub flags: EngineFlags,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            generation: Generation::default(),
            hba_queue_depth: 1024,
            discovery_reserve: 20,
            lun_queue_depth: 30,
            target_queue_depth: 8192,
            max_sg_segments: 64,
            xri_base: 0x40,
            command_timeout_ms: 30_000,
            devloss_timeout_ms: 30_000,
            task_mgmt_timeout_ms: 60_000,
            max_completion_time_ms: 0,
            ramp_up_percent: 5,
            reuse_hold_ms: 20_000,
            latency: LatencyConfig::default(),
            flags: EngineFlags::default(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let config: EngineConfig =
            serde_json::from_slice(&data).with_context(|| format!("decode {}", path.display()))?;
        config.validate().context("validate engine config")?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.lun_queue_depth == 0 {
            return Err(ConfigError::new("lun_queue_depth", "must be at least 1"));
        }
        if self.target_queue_depth == 0 {
            return Err(ConfigError::new("target_queue_depth", "must be at least 1"));
        }
        if self.hba_queue_depth <= self.discovery_reserve {
            return Err(ConfigError::new(
                "hba_queue_depth",
                format!("must exceed discovery_reserve ({})", self.discovery_reserve),
            ));
        }
        if self.max_sg_segments == 0 || self.max_sg_segments > MAX_SG_SEGMENTS {
            return Err(ConfigError::new(
                "max_sg_segments",
                format!("must be within 1..={MAX_SG_SEGMENTS}"),
            ));
        }
        if self.ramp_up_percent == 0 || self.ramp_up_percent > 100 {
            return Err(ConfigError::new("ramp_up_percent", "must be within 1..=100"));
        }
        if self.generation == Generation::Modern
            && u32::from(self.xri_base) + u32::from(self.hba_queue_depth) > u32::from(u16::MAX)
        {
            return Err(ConfigError::new("xri_base", "exchange window exceeds 16 bits"));
        }
        if self.latency.kind != BucketKind::None && self.latency.step_ms == 0 {
            return Err(ConfigError::new("latency.step_ms", "must be positive"));
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::new("command_timeout_ms", "must be positive"));
        }
        Ok(())
    }

    /// Buffers the pool may provision for I/O.
    pub fn io_exchange_limit(&self) -> u16 {
        self.hba_queue_depth - self.discovery_reserve
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn devloss_timeout(&self) -> Duration {
        Duration::from_millis(self.devloss_timeout_ms)
    }

    /// How long a single-exchange abort waits for confirmation.
    pub fn abort_wait(&self) -> Duration {
        self.devloss_timeout() * 2
    }

    /// Bound on the post-reset sweep.
    pub fn sweep_bound(&self) -> Duration {
        self.command_timeout() * 2
    }

    pub fn task_mgmt_timeout(&self) -> Duration {
        Duration::from_millis(self.task_mgmt_timeout_ms)
    }

    pub fn max_completion_time(&self) -> Option<Duration> {
        (self.max_completion_time_ms > 0).then(|| Duration::from_millis(self.max_completion_time_ms))
    }

    pub fn reuse_hold(&self) -> Duration {
        Duration::from_millis(self.reuse_hold_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.io_exchange_limit(), 1004);
        assert_eq!(config.abort_wait(), Duration::from_secs(60));
        assert!(config.max_completion_time().is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"generation":"legacy","lun_queue_depth":8,"flags":"STATS | LATENCY"}"#,
        )
        .unwrap();
        assert_eq!(config.generation, Generation::Legacy);
        assert_eq!(config.lun_queue_depth, 8);
        assert_eq!(config.flags, EngineFlags::STATS | EngineFlags::LATENCY);
        assert_eq!(config.max_sg_segments, 64);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_str::<EngineConfig>(r#"{"lun_depth":8}"#).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn validate_reports_field() {
        let config = EngineConfig {
            discovery_reserve: 2048,
            ..EngineConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().field(), "hba_queue_depth");

        let config = EngineConfig {
            lun_queue_depth: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().field(), "lun_queue_depth");
    }

    #[test]
    fn load_reads_and_validates_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"max_sg_segments":128,"latency":{"kind":"power2","base_ms":1,"step_ms":2}}"#)
            .unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.max_sg_segments, 128);
        assert_eq!(config.latency.kind, BucketKind::Power2);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        bad.write_all(br#"{"max_sg_segments":0}"#).unwrap();
        let err = EngineConfig::load(bad.path()).unwrap_err();
        assert!(format!("{err:#}").contains("max_sg_segments"));
    }
}
