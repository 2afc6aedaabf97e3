//! Domain types for the RenderGrid database of record.
//!
//! These types represent the persisted state of shows, fair-share folders,
//! jobs, layers, frames, hosts, virtual procs, local host assignments and
//! dependency edges. All types are serializable to/from JSON for storage in
//! redb tables.
//!
//! Units: cores are whole cores, memory is KB, GPU is whole units.

use serde::{Deserialize, Serialize};

/// Unique identifier for a show.
pub type ShowId = String;

/// Unique identifier for a scheduling point (department x show).
pub type PointId = String;

/// Unique identifier for a folder (fair-share group).
pub type FolderId = String;

/// Unique identifier for a job.
pub type JobId = String;

/// Unique identifier for a layer within a job.
pub type LayerId = String;

/// Unique identifier for a frame within a layer.
pub type FrameId = String;

/// Unique identifier for a render host.
pub type HostId = String;

/// Unique identifier for a virtual proc.
pub type ProcId = String;

/// Unique identifier for a local host assignment.
pub type AssignmentId = String;

/// Unique identifier for a depend edge (its signature).
pub type DependId = String;

// ── Shows ─────────────────────────────────────────────────────────

/// Top-level organizational unit owning jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Show {
    pub id: ShowId,
    pub name: String,
    pub active: bool,
}

/// A show's share of one allocation of hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub show_id: ShowId,
    pub allocation: String,
    /// Baseline number of cores the show is entitled to.
    pub size: u32,
    /// Ceiling the show may burst to when idle capacity exists.
    pub burst: u32,
    /// Cores currently booked by the show on this allocation.
    pub cores: u32,
    /// Fair-share tier maintained by the accounting layer.
    pub tier: f64,
}

impl Subscription {
    /// Build the composite key for the subscriptions table.
    pub fn table_key(&self) -> String {
        subscription_key(&self.show_id, &self.allocation)
    }

    /// Cores left before the show hits its burst ceiling.
    pub fn burst_deficit(&self) -> u32 {
        self.burst.saturating_sub(self.cores)
    }
}

/// Composite key for a subscription: `{show_id}:{allocation}`.
pub fn subscription_key(show_id: &str, allocation: &str) -> String {
    format!("{show_id}:{allocation}")
}

/// A scheduling point: one department within one show.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub id: PointId,
    pub show_id: ShowId,
    pub department: String,
    pub tier: f64,
}

/// A fair-share grouping of jobs within a show.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Folder {
    pub id: FolderId,
    pub show_id: ShowId,
    pub point_id: PointId,
    pub name: String,
    /// Cores currently booked by jobs in this folder.
    pub cores: u32,
    /// Core ceiling, or [`Folder::UNLIMITED`].
    pub max_cores: i32,
    pub tier: f64,
}

impl Folder {
    /// Sentinel for a folder without a core ceiling.
    pub const UNLIMITED: i32 = -1;

    /// True if the folder may take more cores.
    pub fn has_capacity(&self) -> bool {
        self.max_cores == Self::UNLIMITED || i64::from(self.cores) < i64::from(self.max_cores)
    }
}

// ── Jobs ──────────────────────────────────────────────────────────

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Finished,
    Shutdown,
}

/// A submission unit owning layers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub show_id: ShowId,
    pub folder_id: FolderId,
    pub facility: String,
    pub os: String,
    pub state: JobState,
    pub paused: bool,
    /// Cores currently booked by this job.
    pub cores: u32,
    /// Fair-share minimum.
    pub min_cores: u32,
    pub max_cores: u32,
    pub tier: f64,
    /// Peak resident memory observed across the job's frames (KB).
    pub max_rss: u64,
}

impl Job {
    /// True if the job may receive new procs.
    pub fn is_dispatchable(&self) -> bool {
        self.state == JobState::Pending && !self.paused
    }

    /// True if the job holds more cores than its fair-share minimum.
    pub fn is_over_min(&self) -> bool {
        self.cores > self.min_cores
    }
}

/// A homogeneous step within a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Layer {
    pub id: LayerId,
    pub job_id: JobId,
    pub name: String,
    pub command: String,
    pub min_cores: u32,
    pub max_cores: u32,
    /// Minimum memory reserved per frame (KB).
    pub min_memory: u64,
    pub min_gpu: u32,
    pub max_gpu: u32,
    pub threadable: bool,
    /// Tag expression, e.g. `"general | desktop"`.
    pub tags: String,
    pub chunk_size: u32,
    /// Peak resident memory observed across the layer's frames (KB).
    pub max_rss: u64,
}

/// Lifecycle state of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameState {
    Waiting,
    Depend,
    Running,
    Succeeded,
    Dead,
    Eaten,
}

impl FrameState {
    /// True for states a frame never leaves without operator action.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Dead | Self::Eaten)
    }
}

/// One unit of work within a layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub id: FrameId,
    pub job_id: JobId,
    pub layer_id: LayerId,
    pub name: String,
    pub number: i32,
    pub state: FrameState,
    pub retries: u32,
    pub dispatch_order: u32,
    pub layer_order: u32,
    /// Number of unsatisfied depend edges gating this frame.
    pub depend_count: u32,
    pub rss: u64,
    pub max_rss: u64,
    pub vsize: u64,
    pub max_vsize: u64,
    pub exit_status: Option<i32>,
}

// ── Hosts ─────────────────────────────────────────────────────────

/// Hardware state of a render host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareState {
    Up,
    Down,
    Rebooting,
    RebootWhenIdle,
    Repair,
}

/// Lock state of a render host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Open,
    Locked,
    NimbyLocked,
}

/// How a host hands out cores to layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThreadMode {
    /// Any layer may book.
    #[default]
    Auto,
    /// Only threadable layers may book.
    All,
}

/// A compute node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    pub allocation: String,
    pub facility: String,
    pub os: String,
    pub tags: Vec<String>,
    pub state: HardwareState,
    pub lock_state: LockState,
    #[serde(default)]
    pub thread_mode: ThreadMode,
    pub total_cores: u32,
    pub idle_cores: u32,
    pub total_memory: u64,
    pub idle_memory: u64,
    pub total_gpu: u32,
    pub idle_gpu: u32,
    /// Free system memory as last reported (KB).
    pub free_memory: u64,
    pub total_swap: u64,
    pub free_swap: u64,
    pub total_mcp: u64,
    pub free_mcp: u64,
    pub load: f64,
    /// Boot time in epoch seconds.
    pub boot_time: u64,
    /// Last report time in epoch seconds.
    pub ping_time: u64,
    pub preferred_show: Option<ShowId>,
}

impl Host {
    /// Swap in use (KB).
    pub fn used_swap(&self) -> u64 {
        self.total_swap.saturating_sub(self.free_swap)
    }

    /// True if more than `ratio` of the swap space is in use.
    pub fn is_swapping(&self, ratio: f64) -> bool {
        self.total_swap > 0 && self.used_swap() as f64 > self.total_swap as f64 * ratio
    }
}

/// Hardware/OS statistics carried by every host report.
#[derive(Debug, Clone, PartialEq)]
pub struct HostStatistics {
    pub total_memory: u64,
    pub free_memory: u64,
    pub total_swap: u64,
    pub free_swap: u64,
    pub total_mcp: u64,
    pub free_mcp: u64,
    pub total_gpu: u32,
    pub free_gpu: u32,
    pub load: f64,
    pub boot_time: u64,
    pub os: Option<String>,
    pub ping_time: u64,
}

// ── Procs ─────────────────────────────────────────────────────────

/// A reservation of a slice of a host's cores and memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualProc {
    pub id: ProcId,
    pub host_id: HostId,
    pub host_name: String,
    pub allocation: String,
    pub show_id: ShowId,
    pub job_id: JobId,
    pub layer_id: LayerId,
    /// Frame currently bound to this proc (back-reference only).
    pub frame_id: Option<FrameId>,
    pub cores: u32,
    pub memory_reserved: u64,
    pub gpu_reserved: u32,
    pub rss: u64,
    pub max_rss: u64,
    pub vsize: u64,
    pub max_vsize: u64,
    pub is_local: bool,
    pub assignment_id: Option<AssignmentId>,
    /// Epoch seconds.
    pub booked_at: u64,
}

impl VirtualProc {
    /// Human readable `host/proc` name for log lines.
    pub fn name(&self) -> String {
        format!("{}/{}", self.host_name, self.id)
    }
}

/// A pinned reservation of a host for one job, layer or frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalHostAssignment {
    pub id: AssignmentId,
    pub host_id: HostId,
    pub job_id: JobId,
    pub layer_id: Option<LayerId>,
    pub frame_id: Option<FrameId>,
    pub max_cores: u32,
    pub max_memory: u64,
    pub max_gpu: u32,
    /// Resources currently booked through this assignment.
    pub cores: u32,
    pub memory: u64,
    pub gpu: u32,
    pub tier: f64,
}

impl LocalHostAssignment {
    pub fn idle_cores(&self) -> u32 {
        self.max_cores.saturating_sub(self.cores)
    }

    pub fn idle_memory(&self) -> u64 {
        self.max_memory.saturating_sub(self.memory)
    }

    pub fn idle_gpu(&self) -> u32 {
        self.max_gpu.saturating_sub(self.gpu)
    }

    /// True if more is booked than the assignment allows.
    pub fn has_deficit(&self) -> bool {
        self.cores > self.max_cores || self.memory > self.max_memory || self.gpu > self.max_gpu
    }
}

// ── Depends ───────────────────────────────────────────────────────

/// Kind of depend edge, named `{depender}On{dependee}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependType {
    JobOnJob,
    LayerOnLayer,
    LayerOnFrame,
    FrameOnFrame,
}

impl DependType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JobOnJob => "JobOnJob",
            Self::LayerOnLayer => "LayerOnLayer",
            Self::LayerOnFrame => "LayerOnFrame",
            Self::FrameOnFrame => "FrameOnFrame",
        }
    }
}

/// Whether an edge stays inside one job or crosses jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependTarget {
    Internal,
    External,
    /// Query filter matching both.
    Any,
}

impl DependTarget {
    /// True if an edge classified as `edge` passes this filter.
    pub fn matches(self, edge: DependTarget) -> bool {
        self == Self::Any || self == edge
    }
}

/// Reference to a job, layer or frame, with enclosing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub job_id: JobId,
    pub layer_id: Option<LayerId>,
    pub frame_id: Option<FrameId>,
}

impl EntityRef {
    pub fn job(job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: job_id.into(),
            layer_id: None,
            frame_id: None,
        }
    }

    pub fn layer(job_id: impl Into<JobId>, layer_id: impl Into<LayerId>) -> Self {
        Self {
            job_id: job_id.into(),
            layer_id: Some(layer_id.into()),
            frame_id: None,
        }
    }

    pub fn frame(
        job_id: impl Into<JobId>,
        layer_id: impl Into<LayerId>,
        frame_id: impl Into<FrameId>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            layer_id: Some(layer_id.into()),
            frame_id: Some(frame_id.into()),
        }
    }
}

/// A persisted depend edge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DependRecord {
    /// Signature of the edge; doubles as its key.
    pub id: DependId,
    pub kind: DependType,
    pub target: DependTarget,
    pub depender: EntityRef,
    pub dependee: EntityRef,
    /// Epoch seconds.
    pub created_at: u64,
}

// ── Seeding ───────────────────────────────────────────────────────

/// A full farm snapshot, used to seed a store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmSnapshot {
    pub shows: Vec<Show>,
    pub subscriptions: Vec<Subscription>,
    pub points: Vec<Point>,
    pub folders: Vec<Folder>,
    pub jobs: Vec<Job>,
    pub layers: Vec<Layer>,
    pub frames: Vec<Frame>,
    pub hosts: Vec<Host>,
    pub local_assignments: Vec<LocalHostAssignment>,
}
