//! Shared fixtures for unit tests.

use std::collections::HashMap;

use crate::report::RenderHost;
use crate::store::StateStore;
use crate::types::*;

/// One gigabyte in KB.
pub const GB: u64 = 1_048_576;

/// A store holding one show, one 8-core/8GB host, and one job with two
/// waiting frames.
pub fn seeded_store() -> StateStore {
    let store = StateStore::open_in_memory().unwrap();
    store.import(&snapshot()).unwrap();
    store
}

pub fn snapshot() -> FarmSnapshot {
    FarmSnapshot {
        shows: vec![Show {
            id: "show-1".to_string(),
            name: "pipe".to_string(),
            active: true,
        }],
        subscriptions: vec![Subscription {
            show_id: "show-1".to_string(),
            allocation: "general".to_string(),
            size: 100,
            burst: 200,
            cores: 0,
            tier: 0.0,
        }],
        points: vec![Point {
            id: "point-1".to_string(),
            show_id: "show-1".to_string(),
            department: "lighting".to_string(),
            tier: 0.0,
        }],
        folders: vec![Folder {
            id: "folder-1".to_string(),
            show_id: "show-1".to_string(),
            point_id: "point-1".to_string(),
            name: "root".to_string(),
            cores: 0,
            max_cores: Folder::UNLIMITED,
            tier: 0.0,
        }],
        jobs: vec![Job {
            id: "job-1".to_string(),
            name: "pipe-shot01-render".to_string(),
            show_id: "show-1".to_string(),
            folder_id: "folder-1".to_string(),
            facility: "spi".to_string(),
            os: "linux".to_string(),
            state: JobState::Pending,
            paused: false,
            cores: 0,
            min_cores: 0,
            max_cores: 100,
            tier: 0.0,
            max_rss: 0,
        }],
        layers: vec![Layer {
            id: "layer-1".to_string(),
            job_id: "job-1".to_string(),
            name: "render".to_string(),
            command: "render -f #IFRAME#".to_string(),
            min_cores: 1,
            max_cores: 1,
            min_memory: GB,
            min_gpu: 0,
            max_gpu: 0,
            threadable: false,
            tags: "general".to_string(),
            chunk_size: 1,
            max_rss: 0,
        }],
        frames: (1..=2)
            .map(|n| Frame {
                id: format!("frame-{n}"),
                job_id: "job-1".to_string(),
                layer_id: "layer-1".to_string(),
                name: format!("{n:04}-render"),
                number: n,
                state: FrameState::Waiting,
                retries: 0,
                dispatch_order: n as u32,
                layer_order: 0,
                depend_count: 0,
                rss: 0,
                max_rss: 0,
                vsize: 0,
                max_vsize: 0,
                exit_status: None,
            })
            .collect(),
        hosts: vec![Host {
            id: "host-1".to_string(),
            name: "beta".to_string(),
            allocation: "general".to_string(),
            facility: "spi".to_string(),
            os: "linux".to_string(),
            tags: vec!["general".to_string()],
            state: HardwareState::Up,
            lock_state: LockState::Open,
            thread_mode: ThreadMode::Auto,
            total_cores: 8,
            idle_cores: 8,
            total_memory: 8 * GB,
            idle_memory: 8 * GB,
            total_gpu: 0,
            idle_gpu: 0,
            free_memory: 6 * GB,
            total_swap: 2 * GB,
            free_swap: 2 * GB,
            total_mcp: GB,
            free_mcp: GB,
            load: 0.0,
            boot_time: 1_700_000_000,
            ping_time: 1_700_000_000,
            preferred_show: None,
        }],
        local_assignments: Vec::new(),
    }
}

pub fn render_host(name: &str) -> RenderHost {
    RenderHost {
        name: name.to_string(),
        facility: "spi".to_string(),
        allocation: None,
        state: HardwareState::Up,
        nimby_enabled: false,
        nimby_locked: false,
        total_mem: 8 * GB,
        free_mem: 6 * GB,
        total_swap: 2 * GB,
        free_swap: 2 * GB,
        total_mcp: GB,
        free_mcp: GB,
        load: 0.0,
        boot_time: 1_700_000_000,
        cores: 8,
        tags: vec!["general".to_string()],
        attributes: HashMap::new(),
    }
}
