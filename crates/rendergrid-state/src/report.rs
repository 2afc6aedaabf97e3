//! Wire types delivered by the host agent.
//!
//! A `HostReport` arrives on a fixed interval from every host; the same
//! shape is used for the one-off boot report. `FrameCompleteReport` is sent
//! when a frame's process exits.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{FrameId, HardwareState, JobId, LayerId, ProcId};

/// Host snapshot carried by every report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderHost {
    pub name: String,
    pub facility: String,
    #[serde(default)]
    pub allocation: Option<String>,
    pub state: HardwareState,
    #[serde(default)]
    pub nimby_enabled: bool,
    #[serde(default)]
    pub nimby_locked: bool,
    pub total_mem: u64,
    pub free_mem: u64,
    pub total_swap: u64,
    pub free_swap: u64,
    pub total_mcp: u64,
    pub free_mcp: u64,
    pub load: f64,
    /// Epoch seconds.
    pub boot_time: u64,
    /// Bookable cores on the machine.
    pub cores: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl RenderHost {
    fn numeric_attribute(&self, key: &str) -> u64 {
        self.attributes
            .get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0)
    }

    /// Total GPU units, `0` when the agent does not report them.
    pub fn total_gpu(&self) -> u32 {
        u32::try_from(self.numeric_attribute("totalGpu")).unwrap_or(u32::MAX)
    }

    /// Free GPU units, `0` when the agent does not report them.
    pub fn free_gpu(&self) -> u32 {
        u32::try_from(self.numeric_attribute("freeGpu")).unwrap_or(u32::MAX)
    }

    /// Pages swapped out since the last report.
    pub fn swap_out(&self) -> u64 {
        self.numeric_attribute("swapout")
    }

    /// Operating system tag, from the `SP_OS` attribute.
    pub fn os(&self) -> Option<&str> {
        self.attributes.get("SP_OS").map(String::as_str)
    }
}

/// A frame the agent believes is running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunningFrameInfo {
    /// Proc the frame was launched under.
    pub resource_id: ProcId,
    pub job_id: JobId,
    pub job_name: String,
    pub frame_id: FrameId,
    pub frame_name: String,
    pub layer_id: LayerId,
    pub rss: u64,
    pub max_rss: u64,
    pub vsize: u64,
    pub max_vsize: u64,
    /// Epoch milliseconds.
    pub start_time: u64,
}

/// Periodic (or boot) heartbeat from a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostReport {
    pub host: RenderHost,
    #[serde(default)]
    pub frames: Vec<RunningFrameInfo>,
}

/// Sent once when a frame's process exits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameCompleteReport {
    pub host_name: String,
    pub frame: RunningFrameInfo,
    pub exit_status: i32,
    #[serde(default)]
    pub exit_signal: i32,
    /// Seconds.
    #[serde(default)]
    pub run_time: u64,
}

impl FrameCompleteReport {
    /// True if the process exited cleanly.
    pub fn succeeded(&self) -> bool {
        self.exit_status == 0 && self.exit_signal == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_host() -> RenderHost {
        RenderHost {
            name: "beta".to_string(),
            facility: "spi".to_string(),
            allocation: None,
            state: HardwareState::Up,
            nimby_enabled: false,
            nimby_locked: false,
            total_mem: 8_173_264,
            free_mem: 53_500,
            total_swap: 20_960,
            free_swap: 20_760,
            total_mcp: 195_430,
            free_mcp: 76_020,
            load: 1.0,
            boot_time: 1_192_369_572,
            cores: 8,
            tags: vec!["test".to_string()],
            attributes: HashMap::new(),
        }
    }

    #[test]
    fn gpu_defaults_to_zero_when_absent() {
        let host = render_host();
        assert_eq!(host.total_gpu(), 0);
        assert_eq!(host.free_gpu(), 0);
    }

    #[test]
    fn gpu_read_from_attributes() {
        let mut host = render_host();
        host.attributes.insert("totalGpu".to_string(), "4".to_string());
        host.attributes.insert("freeGpu".to_string(), "2".to_string());
        assert_eq!(host.total_gpu(), 4);
        assert_eq!(host.free_gpu(), 2);
    }

    #[test]
    fn malformed_attribute_is_zero() {
        let mut host = render_host();
        host.attributes.insert("swapout".to_string(), "lots".to_string());
        assert_eq!(host.swap_out(), 0);
    }

    #[test]
    fn os_comes_from_sp_os() {
        let mut host = render_host();
        assert_eq!(host.os(), None);
        host.attributes.insert("SP_OS".to_string(), "rhel7".to_string());
        assert_eq!(host.os(), Some("rhel7"));
    }

    #[test]
    fn report_deserializes_without_frames() {
        let json = serde_json::json!({
            "host": serde_json::to_value(render_host()).unwrap(),
        });
        let report: HostReport = serde_json::from_value(json).unwrap();
        assert!(report.frames.is_empty());
    }
}
