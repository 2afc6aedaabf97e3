//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::sync::Arc;

use rendergrid_state::*;

use crate::allocator::ProcAllocator;
use crate::config::{DispatchConfig, QueueConfig};
use crate::dispatcher::Dispatcher;
use crate::kill::{KillQueue, RecordingKillTransport};
use crate::locks::HostLocks;
use crate::queue::WorkQueue;
use crate::report::HostReportHandler;
use crate::stats::DispatchStats;

/// One gigabyte in KB.
pub const GB: u64 = 1_048_576;

/// A store holding one show, one 8-core/8GB host named "beta", and one job
/// with two waiting single-core frames.
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

/// A local assignment of job-1 onto host-1.
pub fn local_assignment(max_cores: u32, max_memory: u64) -> LocalHostAssignment {
    LocalHostAssignment {
        id: "lha-1".to_string(),
        host_id: "host-1".to_string(),
        job_id: "job-1".to_string(),
        layer_id: None,
        frame_id: None,
        max_cores,
        max_memory,
        max_gpu: 0,
        cores: 0,
        memory: 0,
        gpu: 0,
        tier: 0.0,
    }
}

/// The seeded host as its agent would describe it.
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

pub fn host_report(frames: Vec<RunningFrameInfo>) -> HostReport {
    HostReport {
        host: render_host("beta"),
        frames,
    }
}

/// A frame of job-1 the agent says is running under `proc_id`.
pub fn running(proc_id: &str, frame_id: &str, start_time: u64, rss: u64, max_rss: u64) -> RunningFrameInfo {
    RunningFrameInfo {
        resource_id: proc_id.to_string(),
        job_id: "job-1".to_string(),
        job_name: "pipe-shot01-render".to_string(),
        frame_id: frame_id.to_string(),
        frame_name: format!("{frame_id}-render"),
        layer_id: "layer-1".to_string(),
        rss,
        max_rss,
        vsize: rss,
        max_vsize: max_rss,
        start_time,
    }
}

/// A report handler wired to an inline dispatcher and a recording kill
/// transport.
pub struct Harness {
    pub store: StateStore,
    pub stats: Arc<DispatchStats>,
    pub transport: Arc<RecordingKillTransport>,
    pub kill_queue: Arc<WorkQueue>,
    pub dispatcher: Dispatcher,
    pub handler: HostReportHandler,
}

impl Harness {
    pub fn new(store: StateStore) -> Self {
        Self::with_config(store, DispatchConfig::default())
    }

    pub fn with_config(store: StateStore, config: DispatchConfig) -> Self {
        let config = Arc::new(config);
        let stats = Arc::new(DispatchStats::new());
        let locks = HostLocks::new();
        let allocator = ProcAllocator::new(
            store.clone(),
            stats.clone(),
            config.report.balance_headroom_kb,
        );
        let dispatcher = Dispatcher::new(store.clone(), allocator, locks.clone(), config.clone());
        let transport = Arc::new(RecordingKillTransport::new());
        let kill_queue = Arc::new(WorkQueue::new("kill", QueueConfig { workers: 1, capacity: 64 }));
        let kills = KillQueue::new(kill_queue.clone(), transport.clone(), stats.clone());
        let handler = HostReportHandler::new(
            store.clone(),
            config,
            dispatcher.clone(),
            kills,
            locks,
            stats.clone(),
        );
        Self {
            store,
            stats,
            transport,
            kill_queue,
            dispatcher,
            handler,
        }
    }

    /// Book host-1 once and return the proc now running frame-1.
    pub async fn book_frame_1(&self) -> VirtualProc {
        let procs = self.dispatcher.dispatch_host_to_job("host-1", "job-1").await.unwrap();
        assert_eq!(procs[0].frame_id.as_deref(), Some("frame-1"));
        procs[0].clone()
    }

    /// Kill commands delivered so far.
    pub async fn kills(&self) -> Vec<crate::kill::KillCommand> {
        self.kill_queue.wait_idle().await;
        self.transport.commands().await
    }
}
