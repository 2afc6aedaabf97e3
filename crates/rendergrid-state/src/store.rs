//! StateStore — redb-backed database of record for RenderGrid.
//!
//! Provides typed CRUD operations over shows, folders, jobs, layers, frames,
//! hosts, procs, local assignments and depend edges. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! redb admits a single write transaction at a time, so every mutation
//! that reads and then writes host capacity (see `booking`) observes a
//! consistent view and cannot over-commit a host.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, Table, TableDefinition,
    WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// JSON table definition shared by every entity table.
pub(crate) type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        self.write(|txn| {
            for table in [
                SHOWS,
                SUBSCRIPTIONS,
                POINTS,
                FOLDERS,
                JOBS,
                LAYERS,
                FRAMES,
                HOSTS,
                PROCS,
                LOCAL_ASSIGNMENTS,
                DEPENDS,
            ] {
                txn.open_table(table).map_err(map_err!(Table))?;
            }
            txn.open_table(FRAME_PROCS).map_err(map_err!(Table))?;
            txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            Ok(())
        })
    }

    /// Run `f` inside a write transaction, committing on success and
    /// aborting on error.
    pub(crate) fn write<R>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> StateResult<R>,
    ) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        match f(&txn) {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = txn.abort() {
                    warn!(error = %abort, "failed to abort write transaction");
                }
                Err(e)
            }
        }
    }

    /// Run `f` inside a read transaction.
    pub(crate) fn read<R>(
        &self,
        f: impl FnOnce(&ReadTransaction) -> StateResult<R>,
    ) -> StateResult<R> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        f(&txn)
    }

    fn put_entity<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        self.write(|txn| {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            put_json(&mut t, key, value)
        })
    }

    fn get_entity<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        self.read(|txn| {
            let t = txn.open_table(table).map_err(map_err!(Table))?;
            get_json(&t, key)
        })
    }

    fn list_entities<T: DeserializeOwned>(&self, table: JsonTable) -> StateResult<Vec<T>> {
        self.read(|txn| {
            let t = txn.open_table(table).map_err(map_err!(Table))?;
            list_json(&t)
        })
    }

    fn delete_entity(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        self.write(|txn| {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            let existed = t.remove(key).map_err(map_err!(Write))?.is_some();
            Ok(existed)
        })
    }

    /// Seed the store from a farm snapshot, overwriting matching keys.
    pub fn import(&self, snapshot: &FarmSnapshot) -> StateResult<()> {
        self.write(|txn| {
            let mut shows = txn.open_table(SHOWS).map_err(map_err!(Table))?;
            for show in &snapshot.shows {
                put_json(&mut shows, &show.id, show)?;
            }
            let mut subs = txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
            for sub in &snapshot.subscriptions {
                put_json(&mut subs, &sub.table_key(), sub)?;
            }
            let mut points = txn.open_table(POINTS).map_err(map_err!(Table))?;
            for point in &snapshot.points {
                put_json(&mut points, &point.id, point)?;
            }
            let mut folders = txn.open_table(FOLDERS).map_err(map_err!(Table))?;
            for folder in &snapshot.folders {
                put_json(&mut folders, &folder.id, folder)?;
            }
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            for job in &snapshot.jobs {
                put_json(&mut jobs, &job.id, job)?;
            }
            let mut layers = txn.open_table(LAYERS).map_err(map_err!(Table))?;
            for layer in &snapshot.layers {
                put_json(&mut layers, &layer.id, layer)?;
            }
            let mut frames = txn.open_table(FRAMES).map_err(map_err!(Table))?;
            for frame in &snapshot.frames {
                put_json(&mut frames, &frame.id, frame)?;
            }
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            for host in &snapshot.hosts {
                put_json(&mut hosts, &host.id, host)?;
            }
            let mut assignments = txn.open_table(LOCAL_ASSIGNMENTS).map_err(map_err!(Table))?;
            for lha in &snapshot.local_assignments {
                put_json(&mut assignments, &lha.id, lha)?;
            }
            Ok(())
        })?;
        debug!(
            jobs = snapshot.jobs.len(),
            frames = snapshot.frames.len(),
            hosts = snapshot.hosts.len(),
            "farm snapshot imported"
        );
        Ok(())
    }

    // ── Shows ──────────────────────────────────────────────────────

    pub fn put_show(&self, show: &Show) -> StateResult<()> {
        self.put_entity(SHOWS, &show.id, show)
    }

    pub fn get_show(&self, show_id: &str) -> StateResult<Option<Show>> {
        self.get_entity(SHOWS, show_id)
    }

    pub fn list_shows(&self) -> StateResult<Vec<Show>> {
        self.list_entities(SHOWS)
    }

    pub fn put_subscription(&self, sub: &Subscription) -> StateResult<()> {
        self.put_entity(SUBSCRIPTIONS, &sub.table_key(), sub)
    }

    pub fn get_subscription(&self, show_id: &str, allocation: &str) -> StateResult<Option<Subscription>> {
        self.get_entity(SUBSCRIPTIONS, &subscription_key(show_id, allocation))
    }

    /// All subscriptions on the given allocation.
    pub fn list_subscriptions_for_allocation(&self, allocation: &str) -> StateResult<Vec<Subscription>> {
        let subs: Vec<Subscription> = self.list_entities(SUBSCRIPTIONS)?;
        Ok(subs.into_iter().filter(|s| s.allocation == allocation).collect())
    }

    pub fn put_point(&self, point: &Point) -> StateResult<()> {
        self.put_entity(POINTS, &point.id, point)
    }

    pub fn list_points(&self) -> StateResult<Vec<Point>> {
        self.list_entities(POINTS)
    }

    pub fn put_folder(&self, folder: &Folder) -> StateResult<()> {
        self.put_entity(FOLDERS, &folder.id, folder)
    }

    pub fn get_folder(&self, folder_id: &str) -> StateResult<Option<Folder>> {
        self.get_entity(FOLDERS, folder_id)
    }

    pub fn list_folders(&self) -> StateResult<Vec<Folder>> {
        self.list_entities(FOLDERS)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    pub fn put_job(&self, job: &Job) -> StateResult<()> {
        self.put_entity(JOBS, &job.id, job)
    }

    pub fn get_job(&self, job_id: &str) -> StateResult<Option<Job>> {
        self.get_entity(JOBS, job_id)
    }

    pub fn list_jobs(&self) -> StateResult<Vec<Job>> {
        self.list_entities(JOBS)
    }

    /// Set a job's state. Returns false if the job does not exist.
    pub fn set_job_state(&self, job_id: &str, state: JobState) -> StateResult<bool> {
        self.write(|txn| {
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let Some(mut job) = get_json::<Job, _>(&jobs, job_id)? else {
                return Ok(false);
            };
            job.state = state;
            put_json(&mut jobs, job_id, &job)?;
            Ok(true)
        })
    }

    /// Raise a job's peak rss if `max_rss` exceeds it.
    pub fn update_job_max_rss(&self, job_id: &str, max_rss: u64) -> StateResult<()> {
        self.write(|txn| {
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            if let Some(mut job) = get_json::<Job, _>(&jobs, job_id)? {
                if max_rss > job.max_rss {
                    job.max_rss = max_rss;
                    put_json(&mut jobs, job_id, &job)?;
                }
            }
            Ok(())
        })
    }

    // ── Layers ─────────────────────────────────────────────────────

    pub fn put_layer(&self, layer: &Layer) -> StateResult<()> {
        self.put_entity(LAYERS, &layer.id, layer)
    }

    pub fn get_layer(&self, layer_id: &str) -> StateResult<Option<Layer>> {
        self.get_entity(LAYERS, layer_id)
    }

    pub fn list_layers(&self) -> StateResult<Vec<Layer>> {
        self.list_entities(LAYERS)
    }

    pub fn list_layers_for_job(&self, job_id: &str) -> StateResult<Vec<Layer>> {
        let layers: Vec<Layer> = self.list_entities(LAYERS)?;
        Ok(layers.into_iter().filter(|l| l.job_id == job_id).collect())
    }

    /// Raise a layer's peak rss, and its minimum memory, to `max_rss`.
    ///
    /// Future frames of the layer then reserve what their siblings used.
    pub fn update_layer_max_rss(&self, layer_id: &str, max_rss: u64) -> StateResult<()> {
        self.write(|txn| {
            let mut layers = txn.open_table(LAYERS).map_err(map_err!(Table))?;
            if let Some(mut layer) = get_json::<Layer, _>(&layers, layer_id)? {
                let mut changed = false;
                if max_rss > layer.max_rss {
                    layer.max_rss = max_rss;
                    changed = true;
                }
                if max_rss > layer.min_memory {
                    layer.min_memory = max_rss;
                    changed = true;
                }
                if changed {
                    put_json(&mut layers, layer_id, &layer)?;
                }
            }
            Ok(())
        })
    }

    // ── Frames ─────────────────────────────────────────────────────

    pub fn put_frame(&self, frame: &Frame) -> StateResult<()> {
        self.put_entity(FRAMES, &frame.id, frame)
    }

    pub fn get_frame(&self, frame_id: &str) -> StateResult<Option<Frame>> {
        self.get_entity(FRAMES, frame_id)
    }

    pub fn list_frames(&self) -> StateResult<Vec<Frame>> {
        self.list_entities(FRAMES)
    }

    pub fn list_frames_for_job(&self, job_id: &str) -> StateResult<Vec<Frame>> {
        let frames: Vec<Frame> = self.list_entities(FRAMES)?;
        Ok(frames.into_iter().filter(|f| f.job_id == job_id).collect())
    }

    pub fn list_frames_for_layer(&self, layer_id: &str) -> StateResult<Vec<Frame>> {
        let frames: Vec<Frame> = self.list_entities(FRAMES)?;
        Ok(frames.into_iter().filter(|f| f.layer_id == layer_id).collect())
    }

    /// Record current and peak memory for a running frame.
    pub fn update_frame_memory(&self, frame_id: &str, rss: u64, max_rss: u64) -> StateResult<()> {
        self.write(|txn| {
            let mut frames = txn.open_table(FRAMES).map_err(map_err!(Table))?;
            if let Some(mut frame) = get_json::<Frame, _>(&frames, frame_id)? {
                frame.rss = rss;
                frame.max_rss = frame.max_rss.max(max_rss);
                put_json(&mut frames, frame_id, &frame)?;
            }
            Ok(())
        })
    }

    // ── Hosts ──────────────────────────────────────────────────────

    pub fn put_host(&self, host: &Host) -> StateResult<()> {
        self.put_entity(HOSTS, &host.id, host)
    }

    pub fn get_host(&self, host_id: &str) -> StateResult<Option<Host>> {
        self.get_entity(HOSTS, host_id)
    }

    pub fn list_hosts(&self) -> StateResult<Vec<Host>> {
        self.list_entities(HOSTS)
    }

    /// Look a host up by its network name.
    pub fn find_host_by_name(&self, name: &str) -> StateResult<Option<Host>> {
        let hosts: Vec<Host> = self.list_entities(HOSTS)?;
        Ok(hosts.into_iter().find(|h| h.name == name))
    }

    /// Store the statistics from a host report.
    pub fn set_host_statistics(&self, host_id: &str, stats: &HostStatistics) -> StateResult<Host> {
        self.write(|txn| {
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let mut host: Host = require_json(&hosts, host_id, "host")?;
            host.free_memory = stats.free_memory;
            host.total_swap = stats.total_swap;
            host.free_swap = stats.free_swap;
            host.total_mcp = stats.total_mcp;
            host.free_mcp = stats.free_mcp;
            host.load = stats.load;
            host.boot_time = stats.boot_time;
            host.ping_time = stats.ping_time;
            if let Some(os) = &stats.os {
                host.os = os.clone();
            }
            put_json(&mut hosts, host_id, &host)?;
            Ok(host)
        })
    }

    pub fn set_host_state(&self, host_id: &str, state: HardwareState) -> StateResult<()> {
        self.write(|txn| {
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let mut host: Host = require_json(&hosts, host_id, "host")?;
            host.state = state;
            put_json(&mut hosts, host_id, &host)
        })
    }

    pub fn set_host_lock(&self, host_id: &str, lock: LockState) -> StateResult<()> {
        self.write(|txn| {
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let mut host: Host = require_json(&hosts, host_id, "host")?;
            host.lock_state = lock;
            put_json(&mut hosts, host_id, &host)
        })
    }

    /// Recompute a host's bookable totals from scratch.
    ///
    /// Idle capacity becomes the totals minus what booked procs hold.
    pub fn set_host_resources(
        &self,
        host_id: &str,
        cores: u32,
        memory: u64,
        gpu: u32,
    ) -> StateResult<Host> {
        self.write(|txn| {
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let procs = txn.open_table(PROCS).map_err(map_err!(Table))?;
            let mut host: Host = require_json(&hosts, host_id, "host")?;
            let booked: Vec<VirtualProc> = list_json::<VirtualProc, _>(&procs)?
                .into_iter()
                .filter(|p| p.host_id == host_id)
                .collect();
            let used_cores: u32 = booked.iter().map(|p| p.cores).sum();
            let used_memory: u64 = booked.iter().map(|p| p.memory_reserved).sum();
            let used_gpu: u32 = booked.iter().map(|p| p.gpu_reserved).sum();
            host.total_cores = cores;
            host.total_memory = memory;
            host.total_gpu = gpu;
            host.idle_cores = cores.saturating_sub(used_cores);
            host.idle_memory = memory.saturating_sub(used_memory);
            host.idle_gpu = gpu.saturating_sub(used_gpu);
            put_json(&mut hosts, host_id, &host)?;
            Ok(host)
        })
    }

    // ── Procs ──────────────────────────────────────────────────────

    pub fn get_proc(&self, proc_id: &str) -> StateResult<Option<VirtualProc>> {
        self.get_entity(PROCS, proc_id)
    }

    pub fn list_procs(&self) -> StateResult<Vec<VirtualProc>> {
        self.list_entities(PROCS)
    }

    pub fn list_procs_for_host(&self, host_id: &str) -> StateResult<Vec<VirtualProc>> {
        let procs: Vec<VirtualProc> = self.list_entities(PROCS)?;
        Ok(procs.into_iter().filter(|p| p.host_id == host_id).collect())
    }

    /// The proc currently bound to a frame, if any.
    pub fn find_proc_for_frame(&self, frame_id: &str) -> StateResult<Option<VirtualProc>> {
        self.read(|txn| {
            let bindings = txn.open_table(FRAME_PROCS).map_err(map_err!(Table))?;
            let procs = txn.open_table(PROCS).map_err(map_err!(Table))?;
            let proc_id = bindings
                .get(frame_id)
                .map_err(map_err!(Read))?
                .map(|g| g.value().to_string());
            match proc_id {
                Some(id) => get_json(&procs, &id),
                None => Ok(None),
            }
        })
    }

    /// Record current and peak memory for a proc.
    pub fn update_proc_memory(
        &self,
        proc_id: &str,
        rss: u64,
        max_rss: u64,
        vsize: u64,
        max_vsize: u64,
    ) -> StateResult<()> {
        self.write(|txn| {
            let mut procs = txn.open_table(PROCS).map_err(map_err!(Table))?;
            if let Some(mut proc) = get_json::<VirtualProc, _>(&procs, proc_id)? {
                proc.rss = rss;
                proc.max_rss = proc.max_rss.max(max_rss);
                proc.vsize = vsize;
                proc.max_vsize = proc.max_vsize.max(max_vsize);
                put_json(&mut procs, proc_id, &proc)?;
            }
            Ok(())
        })
    }

    /// The running proc on a host with the largest resident memory.
    /// Unbound procs keep a stale rss and are never chosen.
    pub fn worst_memory_offender(&self, host_id: &str) -> StateResult<Option<VirtualProc>> {
        let procs = self.list_procs_for_host(host_id)?;
        Ok(procs
            .into_iter()
            .filter(|p| p.frame_id.is_some())
            .max_by_key(|p| p.rss))
    }

    // ── Local assignments ──────────────────────────────────────────

    pub fn put_local_assignment(&self, lha: &LocalHostAssignment) -> StateResult<()> {
        self.put_entity(LOCAL_ASSIGNMENTS, &lha.id, lha)
    }

    pub fn get_local_assignment(&self, id: &str) -> StateResult<Option<LocalHostAssignment>> {
        self.get_entity(LOCAL_ASSIGNMENTS, id)
    }

    pub fn list_local_assignments_for_host(&self, host_id: &str) -> StateResult<Vec<LocalHostAssignment>> {
        let all: Vec<LocalHostAssignment> = self.list_entities(LOCAL_ASSIGNMENTS)?;
        Ok(all.into_iter().filter(|a| a.host_id == host_id).collect())
    }

    pub fn delete_local_assignment(&self, id: &str) -> StateResult<bool> {
        self.delete_entity(LOCAL_ASSIGNMENTS, id)
    }

    // ── Depends ────────────────────────────────────────────────────

    pub fn get_depend(&self, id: &str) -> StateResult<Option<DependRecord>> {
        self.get_entity(DEPENDS, id)
    }

    pub fn list_depends(&self) -> StateResult<Vec<DependRecord>> {
        self.list_entities(DEPENDS)
    }
}

// ── Table helpers ─────────────────────────────────────────────────

/// Read and decode one JSON value.
pub(crate) fn get_json<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => serde_json::from_slice(guard.value())
            .map(Some)
            .map_err(map_err!(Deserialize)),
        None => Ok(None),
    }
}

/// Like [`get_json`], but a missing key is `StateError::NotFound`.
pub(crate) fn require_json<T, R>(table: &R, key: &str, what: &str) -> StateResult<T>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    get_json(table, key)?.ok_or_else(|| StateError::NotFound(format!("{what} {key}")))
}

/// Decode every value in a table.
pub(crate) fn list_json<T, R>(table: &R) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
    }
    Ok(results)
}

/// Encode and store one JSON value.
pub(crate) fn put_json<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Allocate the next `{prefix}-{n}` identifier.
pub(crate) fn next_id(txn: &WriteTransaction, prefix: &str) -> StateResult<String> {
    let mut seq = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let next = seq
        .get(prefix)
        .map_err(map_err!(Read))?
        .map(|g| g.value())
        .unwrap_or(0)
        + 1;
    seq.insert(prefix, next).map_err(map_err!(Write))?;
    Ok(format!("{prefix}-{next}"))
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
