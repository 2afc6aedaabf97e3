//! HostReportHandler — reconciles each heartbeat with the database of
//! record, then decides whether the host should be booked.
//!
//! Steps run in a fixed order: host statistics, hardware and NIMBY state,
//! boot-time resources, frame verification, memory accounting, swap
//! distress, local assignment cleanup, the bookability gate and finally
//! booking. Everything up to the gate runs under the host's lock. From
//! frame verification on, a failing record is logged and skipped so it
//! never aborts the rest of the report.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use rendergrid_matcher::effective_idle_cores;
use rendergrid_state::{
    HardwareState, Host, HostReport, HostStatistics, JobState, LockState, RenderHost,
    RunningFrameInfo, ShowId, StateStore, VirtualProc, epoch_millis, epoch_secs,
};
use tracing::{debug, info, trace, warn};

use crate::allocator::ProcAllocator;
use crate::config::DispatchConfig;
use crate::dispatcher::Dispatcher;
use crate::error::DispatchResult;
use crate::kill::{KillCommand, KillQueue};
use crate::locks::HostLocks;
use crate::queue::WorkQueue;
use crate::stats::{Counter, DispatchStats};

const KB_PER_MB: u64 = 1024;

/// Which booking path a bookable host takes.
#[derive(Debug, Clone, PartialEq)]
pub enum BookingKind {
    /// Through the host's local assignments only.
    Local,
    PreferredShow(ShowId),
    AllShows,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Booking {
    /// The gate refused the host; the reason is informational.
    Skipped(String),
    /// Booked inline.
    Booked {
        kind: BookingKind,
        procs: Vec<VirtualProc>,
    },
    /// Handed to the booking queue.
    Queued(BookingKind),
}

impl Booking {
    /// Procs bound while handling the report; empty when skipped or queued.
    pub fn procs(&self) -> &[VirtualProc] {
        match self {
            Self::Booked { procs, .. } => procs,
            _ => &[],
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}

/// What one heartbeat changed.
#[derive(Debug, Clone)]
pub struct ReportOutcome {
    pub host: Host,
    /// Running frames that passed verification.
    pub verified: Vec<RunningFrameInfo>,
    /// Kill commands issued while reconciling.
    pub kills: usize,
    pub booking: Booking,
}

#[derive(Clone)]
pub struct HostReportHandler {
    store: StateStore,
    config: Arc<DispatchConfig>,
    dispatcher: Dispatcher,
    allocator: ProcAllocator,
    kills: KillQueue,
    locks: HostLocks,
    stats: Arc<DispatchStats>,
    booking_queue: Option<Arc<WorkQueue>>,
    report_queue: Option<Arc<WorkQueue>>,
}

impl HostReportHandler {
    pub fn new(
        store: StateStore,
        config: Arc<DispatchConfig>,
        dispatcher: Dispatcher,
        kills: KillQueue,
        locks: HostLocks,
        stats: Arc<DispatchStats>,
    ) -> Self {
        let allocator = dispatcher.allocator().clone();
        Self {
            store,
            config,
            dispatcher,
            allocator,
            kills,
            locks,
            stats,
            booking_queue: None,
            report_queue: None,
        }
    }

    /// Book through this queue instead of inline.
    pub fn with_booking_queue(mut self, queue: Arc<WorkQueue>) -> Self {
        self.booking_queue = Some(queue);
        self
    }

    /// The queue this handler is fed from, for slow-report logging.
    pub fn with_report_queue(mut self, queue: Arc<WorkQueue>) -> Self {
        self.report_queue = Some(queue);
        self
    }

    /// Process one heartbeat, or the boot report when `is_boot`.
    pub async fn handle(&self, report: &HostReport, is_boot: bool) -> DispatchResult<ReportOutcome> {
        let started = Instant::now();
        let outcome = self.reconcile(report, is_boot).await;

        let elapsed = started.elapsed();
        let waiting = self
            .report_queue
            .as_ref()
            .map(|q| q.pending().saturating_sub(1))
            .unwrap_or(0);
        if waiting > 0 || elapsed > self.config.report.slow_report() {
            info!(
                host = %report.host.name,
                frames = report.frames.len(),
                waiting,
                elapsed_ms = elapsed.as_millis() as u64,
                "host report handled"
            );
        }
        outcome
    }

    async fn reconcile(&self, report: &HostReport, is_boot: bool) -> DispatchResult<ReportOutcome> {
        let rhost = &report.host;
        let swap_out = rhost.swap_out();
        if swap_out > 0 {
            info!(host = %rhost.name, swap_out, "host swapping out");
        }

        let host = match self.store.find_host_by_name(&rhost.name)? {
            Some(host) => host,
            None => {
                warn!(host = %rhost.name, "unknown host, creating it");
                self.store
                    .create_host_from_report(rhost, &self.config.report.default_allocation)?
            }
        };

        let (host, verified, kills) = {
            let _guard = self.locks.lock(&host.id).await;
            let host = self.update_host(&host, rhost, is_boot)?;
            let mut kills = 0;
            let verified = self.verify_running_frames(&host, &report.frames, &mut kills);
            self.update_memory_usage(&verified);
            self.handle_memory_reservations(&host, &verified, &mut kills);
            self.handle_swapping(&host, &mut kills);
            self.remove_inactive_local_assignments(&host);
            let host = self.store.get_host(&host.id)?.unwrap_or(host);
            (host, verified, kills)
        };

        let booking = match self.check_bookable(&host, rhost) {
            Ok(kind) => self.book(&host, kind).await,
            Err(reason) => {
                trace!(host = %host.name, %reason, "host not bookable");
                Booking::Skipped(reason)
            }
        };

        Ok(ReportOutcome {
            host,
            verified,
            kills,
            booking,
        })
    }

    // ── Host state ─────────────────────────────────────────────────

    fn update_host(&self, host: &Host, rhost: &RenderHost, is_boot: bool) -> DispatchResult<Host> {
        let stats = HostStatistics {
            total_memory: rhost.total_mem,
            free_memory: rhost.free_mem,
            total_swap: rhost.total_swap,
            free_swap: rhost.free_swap,
            total_mcp: rhost.total_mcp,
            free_mcp: rhost.free_mcp,
            total_gpu: rhost.total_gpu(),
            free_gpu: rhost.free_gpu(),
            load: rhost.load,
            boot_time: rhost.boot_time,
            os: rhost.os().map(str::to_string),
            ping_time: epoch_secs(),
        };
        let mut host = self.store.set_host_statistics(&host.id, &stats)?;

        if let Some(state) = next_hardware_state(host.state, rhost.state) {
            info!(host = %host.name, from = ?host.state, to = ?state, "hardware state changed");
            self.store.set_host_state(&host.id, state)?;
            host.state = state;
        }
        if let Some(lock) = next_lock_state(host.lock_state, rhost.nimby_locked) {
            info!(host = %host.name, from = ?host.lock_state, to = ?lock, "NIMBY lock changed");
            self.store.set_host_lock(&host.id, lock)?;
            host.lock_state = lock;
        }

        // Only on boot; routine heartbeats would fight the dispatcher.
        if is_boot {
            host = self.store.set_host_resources(
                &host.id,
                rhost.cores,
                rhost.total_mem,
                rhost.total_gpu(),
            )?;
            info!(host = %host.name, cores = host.total_cores, memory = host.total_memory, "host resources set from boot report");
        }
        Ok(host)
    }

    // ── Frame verification ─────────────────────────────────────────

    fn verify_running_frames(
        &self,
        host: &Host,
        frames: &[RunningFrameInfo],
        kills: &mut usize,
    ) -> Vec<RunningFrameInfo> {
        let now = epoch_millis();
        let grace = self.config.report.frame_verification_grace_secs;
        let mut verified = Vec::with_capacity(frames.len());

        for rf in frames {
            let runtime_secs = now.saturating_sub(rf.start_time) / 1000;
            if runtime_secs < grace {
                debug!(host = %host.name, job = %rf.job_name, frame = %rf.frame_name, runtime_secs, "verified by grace period");
                verified.push(rf.clone());
                continue;
            }
            match self.verify_frame(host, rf, runtime_secs, kills) {
                Ok(true) => verified.push(rf.clone()),
                Ok(false) => {}
                Err(e) => {
                    warn!(host = %host.name, job = %rf.job_name, frame = %rf.frame_name, error = %e, "failed to verify frame");
                }
            }
        }
        verified
    }

    /// Cross-check one frame against its proc. Unverifiable frames are
    /// killed when their proc is gone or orphaned; the frame record itself
    /// is never touched.
    fn verify_frame(
        &self,
        host: &Host,
        rf: &RunningFrameInfo,
        runtime_secs: u64,
        kills: &mut usize,
    ) -> DispatchResult<bool> {
        if self.store.verify_running_proc(&rf.resource_id, &rf.frame_id)? {
            return Ok(true);
        }
        self.stats.incr(Counter::AccountingErrors);

        let kill = match self.store.get_proc(&rf.resource_id)? {
            None => {
                info!(
                    host = %host.name,
                    proc = %rf.resource_id,
                    job = %rf.job_name,
                    frame = %rf.frame_name,
                    runtime_secs,
                    "running frame not reflected in the database, proc does not exist"
                );
                true
            }
            Some(proc) => {
                info!(
                    host = %host.name,
                    proc = %proc.name(),
                    assigned = ?proc.frame_id,
                    frame = %rf.frame_id,
                    runtime_secs,
                    "running frame not reflected in the database"
                );
                if self.store.is_orphan(&proc.id)? {
                    self.store.clear_proc_assignment(&proc.id)?;
                    self.allocator.release(&proc.id)?;
                    self.stats.incr(Counter::OrphansCleared);
                    true
                } else {
                    false
                }
            }
        };

        if kill {
            self.kill(KillCommand {
                host_name: host.name.clone(),
                frame_id: rf.frame_id.clone(),
                proc_id: Some(rf.resource_id.clone()),
                reason: "could not verify this frame".to_string(),
            });
            *kills += 1;
        }
        Ok(false)
    }

    // ── Memory ─────────────────────────────────────────────────────

    fn update_memory_usage(&self, frames: &[RunningFrameInfo]) {
        let mut job_peaks: HashMap<&str, u64> = HashMap::new();
        let mut layer_peaks: HashMap<&str, u64> = HashMap::new();

        for rf in frames {
            if let Err(e) = self.store.update_frame_memory(&rf.frame_id, rf.rss, rf.max_rss) {
                warn!(frame = %rf.frame_name, error = %e, "failed to update frame memory");
            }
            if let Err(e) = self.store.update_proc_memory(
                &rf.resource_id,
                rf.rss,
                rf.max_rss,
                rf.vsize,
                rf.max_vsize,
            ) {
                warn!(proc = %rf.resource_id, error = %e, "failed to update proc memory");
            }
            let job = job_peaks.entry(rf.job_id.as_str()).or_default();
            *job = (*job).max(rf.max_rss);
            let layer = layer_peaks.entry(rf.layer_id.as_str()).or_default();
            *layer = (*layer).max(rf.max_rss);
        }

        for (job_id, peak) in job_peaks {
            if let Err(e) = self.store.update_job_max_rss(job_id, peak) {
                warn!(job = %job_id, error = %e, "failed to update job memory");
            }
        }
        for (layer_id, peak) in layer_peaks {
            if let Err(e) = self.store.update_layer_max_rss(layer_id, peak) {
                warn!(layer = %layer_id, error = %e, "failed to update layer memory");
            }
        }
    }

    fn handle_memory_reservations(&self, host: &Host, frames: &[RunningFrameInfo], kills: &mut usize) {
        for rf in frames {
            let proc = match self.store.get_proc(&rf.resource_id) {
                Ok(Some(proc)) => proc,
                Ok(None) => continue,
                Err(e) => {
                    warn!(proc = %rf.resource_id, error = %e, "failed to load proc");
                    continue;
                }
            };
            if proc.is_local {
                continue;
            }

            if rf.rss > host.total_memory {
                info!(job = %rf.job_name, frame = %rf.frame_name, proc = %proc.name(), "killing frame, out of memory");
                self.kill(KillCommand {
                    host_name: host.name.clone(),
                    frame_id: rf.frame_id.clone(),
                    proc_id: Some(proc.id.clone()),
                    reason: format!(
                        "the frame required {}MB but the machine only has {}MB",
                        rf.rss / KB_PER_MB,
                        host.total_memory / KB_PER_MB
                    ),
                });
                self.stats.incr(Counter::KilledOomProcs);
                *kills += 1;
                continue;
            }

            if let Err(e) = self.allocator.ensure_memory(&proc, rf.rss) {
                warn!(proc = %proc.name(), error = %e, "failed to adjust reserved memory");
            }
        }
    }

    fn handle_swapping(&self, host: &Host, kills: &mut usize) {
        if !host.is_swapping(self.config.report.swap_distress_ratio) {
            return;
        }
        let proc = match self.store.worst_memory_offender(&host.id) {
            Ok(Some(proc)) => proc,
            Ok(None) => {
                info!(host = %host.name, "host is swapping and no proc is running on it");
                return;
            }
            Err(e) => {
                warn!(host = %host.name, error = %e, "failed to find worst memory offender");
                return;
            }
        };
        let Some(frame_id) = proc.frame_id.clone() else {
            info!(proc = %proc.name(), "worst memory offender runs no frame");
            return;
        };

        info!(proc = %proc.name(), rss = proc.rss, "killing frame, host is distressed");
        self.stats.incr(Counter::KilledOffenderProcs);
        self.kill(KillCommand {
            host_name: host.name.clone(),
            frame_id,
            proc_id: Some(proc.id.clone()),
            reason: "the host was dangerously low on memory and swapping".to_string(),
        });
        *kills += 1;
    }

    fn kill(&self, command: KillCommand) {
        self.kills.submit(command);
    }

    // ── Booking ────────────────────────────────────────────────────

    fn remove_inactive_local_assignments(&self, host: &Host) {
        let assignments = match self.store.list_local_assignments_for_host(&host.id) {
            Ok(assignments) => assignments,
            Err(e) => {
                warn!(host = %host.name, error = %e, "failed to list local assignments");
                return;
            }
        };
        for lha in assignments {
            let active = matches!(
                self.store.get_job(&lha.job_id),
                Ok(Some(job)) if job.state == JobState::Pending
            );
            if active {
                continue;
            }
            match self.store.delete_local_assignment(&lha.id) {
                Ok(_) => info!(host = %host.name, assignment = %lha.id, job = %lha.job_id, "removed inactive local assignment"),
                Err(e) => warn!(assignment = %lha.id, error = %e, "failed to remove local assignment"),
            }
        }
    }

    /// The bookability gate. `Err` carries the reason the host is skipped.
    fn check_bookable(&self, host: &Host, rhost: &RenderHost) -> Result<BookingKind, String> {
        let booking = &self.config.booking;
        let idle_cores = effective_idle_cores(host, booking.core_load_threshold);
        if idle_cores < booking.min_idle_cores {
            return Err(format!(
                "{} doesn't have enough idle cores, {idle_cores} needs {}",
                host.name, booking.min_idle_cores
            ));
        }
        if host.idle_memory < booking.min_idle_memory_kb {
            return Err(format!(
                "{} doesn't have enough idle memory, {} needs {}",
                host.name, host.idle_memory, booking.min_idle_memory_kb
            ));
        }
        if rhost.free_mem < booking.min_free_system_memory_kb {
            return Err(format!(
                "{} doesn't have enough free system memory, {} needs {}",
                host.name, rhost.free_mem, booking.min_free_system_memory_kb
            ));
        }
        if host.state != HardwareState::Up {
            return Err(format!("{} is not in the Up state", host.name));
        }
        if host.lock_state == LockState::Locked {
            return Err(format!("{} is locked", host.name));
        }

        let has_local = self
            .store
            .list_local_assignments_for_host(&host.id)
            .map(|a| !a.is_empty())
            .map_err(|e| e.to_string())?;
        if rhost.nimby_locked && !has_local {
            return Err(format!("{} is NIMBY locked", host.name));
        }
        if has_local {
            return match self.dispatcher.has_local_headroom(&host.id) {
                Ok(true) => Ok(BookingKind::Local),
                Ok(false) => Err(format!("{} local assignments have no headroom", host.name)),
                Err(e) => Err(e.to_string()),
            };
        }

        let shows = self.dispatcher.bookable_shows(host).map_err(|e| e.to_string())?;
        if shows.is_empty() {
            return Err("no show has pending work".to_string());
        }
        Ok(match &host.preferred_show {
            Some(show_id) => BookingKind::PreferredShow(show_id.clone()),
            None => BookingKind::AllShows,
        })
    }

    async fn book(&self, host: &Host, kind: BookingKind) -> Booking {
        let Some(queue) = &self.booking_queue else {
            let procs = match run_booking(&self.dispatcher, &host.id, &kind).await {
                Ok(procs) => procs,
                Err(e) => {
                    warn!(host = %host.name, error = %e, "booking failed");
                    Vec::new()
                }
            };
            return Booking::Booked { kind, procs };
        };

        let dispatcher = self.dispatcher.clone();
        let host_id = host.id.clone();
        let task_kind = kind.clone();
        let submitted = queue.submit(async move {
            if let Err(e) = run_booking(&dispatcher, &host_id, &task_kind).await {
                warn!(host = %host_id, error = %e, "booking failed");
            }
        });
        match submitted {
            Ok(()) => Booking::Queued(kind),
            Err(e) => {
                warn!(host = %host.name, error = %e, "unable to queue booking");
                Booking::Skipped(e.to_string())
            }
        }
    }
}

async fn run_booking(
    dispatcher: &Dispatcher,
    host_id: &str,
    kind: &BookingKind,
) -> DispatchResult<Vec<VirtualProc>> {
    match kind {
        BookingKind::Local => dispatcher.dispatch_host_local(host_id).await,
        BookingKind::PreferredShow(show_id) => {
            dispatcher.dispatch_host_to_show(host_id, show_id).await
        }
        BookingKind::AllShows => dispatcher.dispatch_host(host_id).await,
    }
}

/// Hardware state a report moves a host to, if any.
///
/// Repair is only ever cleared by hand. Any sign of life from a Down or
/// rebooting host reads as Up.
pub fn next_hardware_state(stored: HardwareState, reported: HardwareState) -> Option<HardwareState> {
    use HardwareState::*;
    if stored == reported || stored == Repair {
        return None;
    }
    if reported == Up && matches!(stored, Down | Rebooting | RebootWhenIdle) {
        return Some(Up);
    }
    Some(reported)
}

/// Lock state a report's NIMBY flag moves a host to, if any.
pub fn next_lock_state(stored: LockState, nimby_locked: bool) -> Option<LockState> {
    match (stored, nimby_locked) {
        (LockState::Open, true) => Some(LockState::NimbyLocked),
        (LockState::NimbyLocked, false) => Some(LockState::Open),
        _ => None,
    }
}
