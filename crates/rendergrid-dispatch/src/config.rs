//! Dispatcher configuration, read from a TOML file.
//!
//! Every field has a default, so an empty file (or none at all) yields a
//! working configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, DispatchResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub booking: BookingConfig,
    pub report: ReportConfig,
    pub queues: QueuesConfig,
    pub frames: FramesConfig,
}

/// Thresholds applied when offering a host to pending work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookingConfig {
    /// Idle cores a host must keep before it is offered.
    pub min_idle_cores: u32,
    /// Idle memory (KB) a host must keep before it is offered.
    pub min_idle_memory_kb: u64,
    /// Free system memory (KB) reported by the host.
    pub min_free_system_memory_kb: u64,
    pub max_candidate_jobs: usize,
    pub frames_per_job_per_pass: usize,
    pub max_procs_per_pass: usize,
    /// Unmet burst, in cores, before a show counts as bookable.
    pub burst_min_deficit_cores: u32,
    /// Fraction of total cores tolerated as load before idle cores shrink.
    pub core_load_threshold: f64,
    pub local_job_limit: usize,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            min_idle_cores: 1,
            min_idle_memory_kb: 262_144,
            min_free_system_memory_kb: 524_288,
            max_candidate_jobs: 20,
            frames_per_job_per_pass: 1,
            max_procs_per_pass: 8,
            burst_min_deficit_cores: 1,
            core_load_threshold: 0.05,
            local_job_limit: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Running frames younger than this are trusted unverified.
    pub frame_verification_grace_secs: u64,
    /// Used swap above this fraction of total swap puts a host in distress.
    pub swap_distress_ratio: f64,
    /// Memory (KB) left above a sibling's peak when balancing.
    pub balance_headroom_kb: u64,
    pub slow_report_ms: u64,
    /// Allocation given to hosts registered from a report.
    pub default_allocation: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            frame_verification_grace_secs: 120,
            swap_distress_ratio: 0.5,
            balance_headroom_kb: 102_400,
            slow_report_ms: 100,
            default_allocation: "general".to_string(),
        }
    }
}

impl ReportConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.frame_verification_grace_secs)
    }

    pub fn slow_report(&self) -> Duration {
        Duration::from_millis(self.slow_report_ms)
    }
}

/// Sizing of one bounded work queue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub workers: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    pub report: QueueConfig,
    pub dispatch: QueueConfig,
    pub kill: QueueConfig,
    pub depend: QueueConfig,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            report: QueueConfig { workers: 4, capacity: 1000 },
            dispatch: QueueConfig { workers: 4, capacity: 500 },
            kill: QueueConfig { workers: 2, capacity: 1000 },
            depend: QueueConfig { workers: 2, capacity: 1000 },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramesConfig {
    /// Failed attempts before a frame is marked Dead.
    pub max_retries: u32,
}

impl Default for FramesConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl DispatchConfig {
    pub fn from_file(path: &Path) -> DispatchResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DispatchError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> DispatchResult<Self> {
        toml::from_str(content).map_err(|e| DispatchError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = DispatchConfig::from_toml_str("").unwrap();
        assert_eq!(config, DispatchConfig::default());
        assert_eq!(config.booking.min_free_system_memory_kb, 524_288);
        assert_eq!(config.report.grace_period(), Duration::from_secs(120));
        assert_eq!(config.frames.max_retries, 3);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = DispatchConfig::from_toml_str(
            r#"
            [booking]
            max_procs_per_pass = 2

            [queues.report]
            workers = 1
            capacity = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.booking.max_procs_per_pass, 2);
        assert_eq!(config.booking.min_idle_cores, 1);
        assert_eq!(config.queues.report, QueueConfig { workers: 1, capacity: 16 });
        assert_eq!(config.queues.kill, QueuesConfig::default().kill);
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let err = DispatchConfig::from_toml_str("[booking\n").unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
    }

    #[test]
    fn reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rendergrid.toml");
        std::fs::write(&path, "[frames]\nmax_retries = 7\n").unwrap();
        let config = DispatchConfig::from_file(&path).unwrap();
        assert_eq!(config.frames.max_retries, 7);
    }
}
