//! redb table definitions for the RenderGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{parent_id}:{child_id}`.

use redb::TableDefinition;

/// Shows keyed by `{show_id}`.
pub const SHOWS: TableDefinition<&str, &[u8]> = TableDefinition::new("shows");

/// Subscriptions keyed by `{show_id}:{allocation}`.
pub const SUBSCRIPTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("subscriptions");

/// Scheduling points keyed by `{point_id}`.
pub const POINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("points");

/// Folders keyed by `{folder_id}`.
pub const FOLDERS: TableDefinition<&str, &[u8]> = TableDefinition::new("folders");

/// Jobs keyed by `{job_id}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Layers keyed by `{layer_id}`.
pub const LAYERS: TableDefinition<&str, &[u8]> = TableDefinition::new("layers");

/// Frames keyed by `{frame_id}`.
pub const FRAMES: TableDefinition<&str, &[u8]> = TableDefinition::new("frames");

/// Hosts keyed by `{host_id}`.
pub const HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");

/// Virtual procs keyed by `{proc_id}`.
pub const PROCS: TableDefinition<&str, &[u8]> = TableDefinition::new("procs");

/// Frame to proc binding keyed by `{frame_id}`, value is the proc id.
/// Enforces at most one proc per frame.
pub const FRAME_PROCS: TableDefinition<&str, &str> = TableDefinition::new("frame_procs");

/// Local host assignments keyed by `{assignment_id}`.
pub const LOCAL_ASSIGNMENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("local_assignments");

/// Depend edges keyed by their signature.
pub const DEPENDS: TableDefinition<&str, &[u8]> = TableDefinition::new("depends");

/// Monotonic id sequences keyed by prefix.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");
