//! Farm fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use rendergrid_dispatch::{
    DispatchConfig, DispatchStats, Dispatcher, FrameCompleteHandler, HostLocks, HostReportHandler,
    KillCommand, KillQueue, ProcAllocator, QueueConfig, RecordingKillTransport, WorkQueue,
};
use rendergrid_state::*;

pub const GB: u64 = 1_048_576;

/// One show with a generous burst on the "general" allocation and an
/// unlimited root folder. No hosts or jobs.
pub fn empty_farm() -> FarmSnapshot {
    FarmSnapshot {
        shows: vec![Show {
            id: "show-1".to_string(),
            name: "pipe".to_string(),
            active: true,
        }],
        subscriptions: vec![Subscription {
            show_id: "show-1".to_string(),
            allocation: "general".to_string(),
            size: 500,
            burst: 1000,
            cores: 0,
            tier: 0.0,
        }],
        points: vec![Point {
            id: "point-1".to_string(),
            show_id: "show-1".to_string(),
            department: "fx".to_string(),
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
        jobs: Vec::new(),
        layers: Vec::new(),
        frames: Vec::new(),
        hosts: Vec::new(),
        local_assignments: Vec::new(),
    }
}

pub fn host(id: &str, name: &str, cores: u32, memory: u64) -> Host {
    Host {
        id: id.to_string(),
        name: name.to_string(),
        allocation: "general".to_string(),
        facility: "spi".to_string(),
        os: "linux".to_string(),
        tags: vec!["general".to_string()],
        state: HardwareState::Up,
        lock_state: LockState::Open,
        thread_mode: ThreadMode::Auto,
        total_cores: cores,
        idle_cores: cores,
        total_memory: memory,
        idle_memory: memory,
        total_gpu: 0,
        idle_gpu: 0,
        free_memory: memory,
        total_swap: 4 * GB,
        free_swap: 4 * GB,
        total_mcp: GB,
        free_mcp: GB,
        load: 0.0,
        boot_time: 1_700_000_000,
        ping_time: 1_700_000_000,
        preferred_show: None,
    }
}

pub fn job(id: &str, max_cores: u32) -> Job {
    Job {
        id: id.to_string(),
        name: format!("pipe-{id}"),
        show_id: "show-1".to_string(),
        folder_id: "folder-1".to_string(),
        facility: "spi".to_string(),
        os: "linux".to_string(),
        state: JobState::Pending,
        paused: false,
        cores: 0,
        min_cores: 0,
        max_cores,
        tier: 0.0,
        max_rss: 0,
    }
}

pub fn layer(id: &str, job_id: &str, cores: u32, memory: u64) -> Layer {
    Layer {
        id: id.to_string(),
        job_id: job_id.to_string(),
        name: id.to_string(),
        command: "render -f #IFRAME#".to_string(),
        min_cores: cores,
        max_cores: cores,
        min_memory: memory,
        min_gpu: 0,
        max_gpu: 0,
        threadable: false,
        tags: "general".to_string(),
        chunk_size: 1,
        max_rss: 0,
    }
}

/// `count` waiting frames named `<layer>-<n>`, in dispatch order.
pub fn frames(job_id: &str, layer_id: &str, count: u32) -> Vec<Frame> {
    (1..=count)
        .map(|n| Frame {
            id: format!("{layer_id}-{n}"),
            job_id: job_id.to_string(),
            layer_id: layer_id.to_string(),
            name: format!("{n:04}-{layer_id}"),
            number: n as i32,
            state: FrameState::Waiting,
            retries: 0,
            dispatch_order: n,
            layer_order: 0,
            depend_count: 0,
            rss: 0,
            max_rss: 0,
            vsize: 0,
            max_vsize: 0,
            exit_status: None,
        })
        .collect()
}

/// A farm with one 8-core/8GB host "beta" and one job of single-core,
/// 1GB frames.
pub fn small_farm(frame_count: u32) -> FarmSnapshot {
    let mut farm = empty_farm();
    farm.hosts.push(host("host-1", "beta", 8, 8 * GB));
    farm.jobs.push(job("job-1", 100));
    farm.layers.push(layer("render", "job-1", 1, GB));
    farm.frames = frames("job-1", "render", frame_count);
    farm
}

pub fn open(farm: &FarmSnapshot) -> StateStore {
    let store = StateStore::open_in_memory().unwrap();
    store.import(farm).unwrap();
    store
}

/// What the agent on `host` would report, before any frames.
pub fn render_host(host: &Host) -> RenderHost {
    RenderHost {
        name: host.name.clone(),
        facility: host.facility.clone(),
        allocation: Some(host.allocation.clone()),
        state: HardwareState::Up,
        nimby_enabled: false,
        nimby_locked: false,
        total_mem: host.total_memory,
        free_mem: host.free_memory,
        total_swap: host.total_swap,
        free_swap: host.free_swap,
        total_mcp: host.total_mcp,
        free_mcp: host.free_mcp,
        load: 0.0,
        boot_time: host.boot_time,
        cores: host.total_cores,
        tags: host.tags.clone(),
        attributes: HashMap::new(),
    }
}

pub fn running(proc_id: &str, frame: &Frame, start_time: u64, rss: u64) -> RunningFrameInfo {
    RunningFrameInfo {
        resource_id: proc_id.to_string(),
        job_id: frame.job_id.clone(),
        job_name: format!("pipe-{}", frame.job_id),
        frame_id: frame.id.clone(),
        frame_name: frame.name.clone(),
        layer_id: frame.layer_id.clone(),
        rss,
        max_rss: rss,
        vsize: rss,
        max_vsize: rss,
        start_time,
    }
}

/// Every handler wired inline over one store, with kills recorded.
pub struct Rig {
    pub store: StateStore,
    pub stats: Arc<DispatchStats>,
    pub dispatcher: Dispatcher,
    pub reports: HostReportHandler,
    pub completions: FrameCompleteHandler,
    transport: Arc<RecordingKillTransport>,
    kill_queue: Arc<WorkQueue>,
}

impl Rig {
    pub fn new(store: StateStore, config: DispatchConfig) -> Self {
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
        let reports = HostReportHandler::new(
            store.clone(),
            config.clone(),
            dispatcher.clone(),
            kills,
            locks,
            stats.clone(),
        );
        let completions =
            FrameCompleteHandler::new(store.clone(), config, dispatcher.clone(), stats.clone());
        Self {
            store,
            stats,
            dispatcher,
            reports,
            completions,
            transport,
            kill_queue,
        }
    }

    pub fn host(&self, id: &str) -> Host {
        self.store.get_host(id).unwrap().unwrap()
    }

    pub fn frame(&self, id: &str) -> Frame {
        self.store.get_frame(id).unwrap().unwrap()
    }

    /// Kill commands delivered so far.
    pub async fn kills(&self) -> Vec<KillCommand> {
        self.kill_queue.wait_idle().await;
        self.transport.commands().await
    }
}
