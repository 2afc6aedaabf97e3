//! Dispatcher — books waiting frames onto hosts.
//!
//! One dispatch attempt per candidate frame:
//! match → reserve → bind. A reservation that fails (capacity changed
//! under us) abandons that candidate for the rest of the pass; the next
//! heartbeat drives a fresh attempt. Every entry point holds the host's
//! lock for its whole pass, so two passes never see the same idle
//! capacity.

use std::collections::HashMap;
use std::sync::Arc;

use rendergrid_matcher::{
    CandidateJob, DispatchFrame, FrameFilter, MatchScope, ResourceOffer, candidate_jobs,
    effective_idle_cores, find_bookable_shows, find_candidate_jobs, find_dispatch_frames,
    find_local_dispatch_frames, find_local_jobs, has_under_proced_job_elsewhere, host_offer,
    proc_offer, proc_shape,
};
use rendergrid_state::{
    Frame, FrameState, Host, JobId, ProcRequest, ShowId, StateError, StateStore, VirtualProc,
};
use tracing::{debug, info, warn};

use crate::allocator::ProcAllocator;
use crate::config::DispatchConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::locks::HostLocks;

/// Jobs and frames read once per pass.
struct FarmView {
    jobs: Vec<CandidateJob>,
    frames: Vec<Frame>,
}

impl FarmView {
    fn load(store: &StateStore) -> DispatchResult<Self> {
        let jobs = store.list_jobs()?;
        let folders = store.list_folders()?;
        let points = store.list_points()?;
        let layers = store.list_layers()?;
        let frames = store.list_frames()?;
        Ok(Self {
            jobs: candidate_jobs(&jobs, &folders, &points, &layers, &frames),
            frames,
        })
    }

    fn job(&self, job_id: &str) -> Option<&CandidateJob> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }

    fn has_waiting_work(&self, show_id: &str) -> bool {
        self.jobs.iter().any(|job| {
            job.show_id == show_id
                && job.dispatchable
                && job.layers.iter().any(|l| l.waiting_count > 0)
        })
    }

    /// Reflect a booking so later candidates in the same pass see it.
    fn record(&mut self, frame: &DispatchFrame, cores: u32) {
        if let Some(job) = self.jobs.iter_mut().find(|j| j.job_id == frame.job_id) {
            job.cores += cores;
            if let Some(layer) = job.layers.iter_mut().find(|l| l.layer_id == frame.layer_id) {
                layer.waiting_count = layer.waiting_count.saturating_sub(1);
            }
        }
        if let Some(f) = self.frames.iter_mut().find(|f| f.id == frame.frame_id) {
            f.state = FrameState::Running;
        }
    }
}

/// What is left to hand out during one pass over one host.
struct Pass {
    offer: ResourceOffer,
    budget: usize,
    per_job: usize,
    booked: Vec<VirtualProc>,
    jobs_booked: HashMap<JobId, usize>,
}

impl Pass {
    fn new(offer: ResourceOffer, budget: usize, per_job: usize) -> Self {
        Self {
            offer,
            budget,
            per_job,
            booked: Vec::new(),
            jobs_booked: HashMap::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.booked.len() >= self.budget
    }

    fn remaining_for(&self, job_id: &str) -> usize {
        let used = self.jobs_booked.get(job_id).copied().unwrap_or(0);
        self.per_job
            .saturating_sub(used)
            .min(self.budget.saturating_sub(self.booked.len()))
    }

    fn fits(&self, frame: &DispatchFrame) -> bool {
        frame.cores <= self.offer.cores
            && frame.memory <= self.offer.memory
            && frame.gpu <= self.offer.gpu
    }

    fn record(&mut self, proc: VirtualProc) {
        self.offer.cores = self.offer.cores.saturating_sub(proc.cores);
        self.offer.memory = self.offer.memory.saturating_sub(proc.memory_reserved);
        self.offer.gpu = self.offer.gpu.saturating_sub(proc.gpu_reserved);
        *self.jobs_booked.entry(proc.job_id.clone()).or_default() += 1;
        self.booked.push(proc);
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    store: StateStore,
    allocator: ProcAllocator,
    locks: HostLocks,
    config: Arc<DispatchConfig>,
}

impl Dispatcher {
    pub fn new(
        store: StateStore,
        allocator: ProcAllocator,
        locks: HostLocks,
        config: Arc<DispatchConfig>,
    ) -> Self {
        Self {
            store,
            allocator,
            locks,
            config,
        }
    }

    pub fn allocator(&self) -> &ProcAllocator {
        &self.allocator
    }

    pub fn locks(&self) -> &HostLocks {
        &self.locks
    }

    /// Book a host across every bookable show, largest unmet burst first.
    pub async fn dispatch_host(&self, host_id: &str) -> DispatchResult<Vec<VirtualProc>> {
        let _guard = self.locks.lock(host_id).await;
        let host = self.require_host(host_id)?;
        let mut view = FarmView::load(&self.store)?;
        let shows = self.bookable_shows_in(&host, &view)?;
        let mut pass = self.open_pass(&host);
        for show_id in shows {
            if pass.is_full() {
                break;
            }
            self.book_scope(&host, &mut pass, &mut view, &MatchScope::Show(show_id));
        }
        Ok(self.close_pass(&host, pass))
    }

    pub async fn dispatch_host_to_show(
        &self,
        host_id: &str,
        show_id: &str,
    ) -> DispatchResult<Vec<VirtualProc>> {
        self.dispatch_scoped(host_id, MatchScope::Show(show_id.to_string()))
            .await
    }

    pub async fn dispatch_host_to_group(
        &self,
        host_id: &str,
        folder_id: &str,
    ) -> DispatchResult<Vec<VirtualProc>> {
        self.dispatch_scoped(host_id, MatchScope::Group(folder_id.to_string()))
            .await
    }

    pub async fn dispatch_host_to_job(
        &self,
        host_id: &str,
        job_id: &str,
    ) -> DispatchResult<Vec<VirtualProc>> {
        self.dispatch_scoped(host_id, MatchScope::Job(job_id.to_string()))
            .await
    }

    async fn dispatch_scoped(
        &self,
        host_id: &str,
        scope: MatchScope,
    ) -> DispatchResult<Vec<VirtualProc>> {
        let _guard = self.locks.lock(host_id).await;
        let host = self.require_host(host_id)?;
        let mut view = FarmView::load(&self.store)?;
        let mut pass = self.open_pass(&host);
        self.book_scope(&host, &mut pass, &mut view, &scope);
        Ok(self.close_pass(&host, pass))
    }

    /// Start the next frame of the proc's job on an unbound proc, without
    /// a new reservation.
    ///
    /// Returns `None` when the job has nothing the proc can run, or when a
    /// job of the same show below its minimum could use the proc instead;
    /// the caller should then release it. Local procs are never reused.
    pub async fn dispatch_proc_to_job(&self, proc_id: &str) -> DispatchResult<Option<VirtualProc>> {
        let Some(proc) = self.store.get_proc(proc_id)? else {
            return Ok(None);
        };
        let _guard = self.locks.lock(&proc.host_id).await;
        let Some(proc) = self.store.get_proc(proc_id)? else {
            return Ok(None);
        };
        if let Some(frame_id) = &proc.frame_id {
            return Err(DispatchError::ResourceDuplication(format!(
                "proc {} still runs frame {frame_id}",
                proc.name()
            )));
        }
        if proc.is_local {
            return Ok(None);
        }
        let host = self.require_host(&proc.host_id)?;
        let view = FarmView::load(&self.store)?;
        let Some(job) = view.job(&proc.job_id) else {
            return Ok(None);
        };
        if has_under_proced_job_elsewhere(job, &proc_shape(&proc), &view.jobs) {
            info!(proc = %proc.name(), job = %job.name, "proc wanted by an under-proced job");
            return Ok(None);
        }

        let offer = proc_offer(&proc, &host);
        let frames = find_dispatch_frames(&offer, job, &view.frames, &FrameFilter::default(), 1);
        let Some(frame) = frames.first() else {
            return Ok(None);
        };
        match self.allocator.bind(&proc.id, &frame.frame_id) {
            Ok(bound) => {
                info!(proc = %bound.name(), frame = %frame.frame_name, "proc reused");
                Ok(Some(bound))
            }
            Err(DispatchError::ResourceDuplication(reason)) => {
                debug!(proc = %proc.name(), %reason, "frame taken before reuse");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Book a host through its local assignments, ignoring tiers.
    pub async fn dispatch_host_local(&self, host_id: &str) -> DispatchResult<Vec<VirtualProc>> {
        let _guard = self.locks.lock(host_id).await;
        let host = self.require_host(host_id)?;
        let assignments = self.store.list_local_assignments_for_host(host_id)?;
        let mut view = FarmView::load(&self.store)?;
        let booking = &self.config.booking;
        let budget = booking.max_procs_per_pass;
        let mut pass = Pass::new(host_offer(&host, host.idle_cores), budget, budget);

        let ranks = find_local_jobs(&pass.offer, &assignments, &view.jobs, booking.local_job_limit);
        for rank in ranks {
            if pass.is_full() {
                break;
            }
            let Some(lha) = self.store.get_local_assignment(&rank.assignment_id)? else {
                continue;
            };
            let Some(job) = view.job(&rank.job_id).cloned() else {
                continue;
            };
            let limit = pass.remaining_for(&job.job_id);
            let frames = find_local_dispatch_frames(&pass.offer, &lha, &job, &view.frames, limit);
            for frame in frames {
                if pass.is_full() || !pass.fits(&frame) {
                    break;
                }
                match self.book_frame(&host, &frame, Some(&lha.id)) {
                    Some(proc) => {
                        view.record(&frame, proc.cores);
                        pass.record(proc);
                    }
                    None => break,
                }
            }
        }
        Ok(self.close_pass(&host, pass))
    }

    /// True if the host has a local assignment with idle budget left.
    pub fn has_local_headroom(&self, host_id: &str) -> DispatchResult<bool> {
        Ok(self
            .store
            .list_local_assignments_for_host(host_id)?
            .iter()
            .any(|lha| !lha.has_deficit() && lha.idle_cores() > 0 && lha.idle_memory() > 0))
    }

    /// Shows the host may be booked for: active, bursting short by at
    /// least the minimum deficit, and holding waiting work.
    pub fn bookable_shows(&self, host: &Host) -> DispatchResult<Vec<ShowId>> {
        let view = FarmView::load(&self.store)?;
        self.bookable_shows_in(host, &view)
    }

    fn bookable_shows_in(&self, host: &Host, view: &FarmView) -> DispatchResult<Vec<ShowId>> {
        let subscriptions = self.store.list_subscriptions_for_allocation(&host.allocation)?;
        let shows = self.store.list_shows()?;
        let mut bookable = find_bookable_shows(
            &subscriptions,
            &shows,
            self.config.booking.burst_min_deficit_cores,
        );
        bookable.retain(|show_id| view.has_waiting_work(show_id));
        Ok(bookable)
    }

    fn require_host(&self, host_id: &str) -> DispatchResult<Host> {
        self.store
            .get_host(host_id)?
            .ok_or_else(|| DispatchError::State(StateError::NotFound(format!("host {host_id}"))))
    }

    fn open_pass(&self, host: &Host) -> Pass {
        let booking = &self.config.booking;
        let idle = effective_idle_cores(host, booking.core_load_threshold);
        Pass::new(
            host_offer(host, idle),
            booking.max_procs_per_pass,
            booking.frames_per_job_per_pass,
        )
    }

    fn close_pass(&self, host: &Host, pass: Pass) -> Vec<VirtualProc> {
        if pass.booked.is_empty() {
            debug!(host = %host.name, "no candidates booked");
        } else {
            info!(host = %host.name, procs = pass.booked.len(), "host booked");
        }
        pass.booked
    }

    fn book_scope(&self, host: &Host, pass: &mut Pass, view: &mut FarmView, scope: &MatchScope) {
        let ranks = find_candidate_jobs(
            &pass.offer,
            &view.jobs,
            scope,
            self.config.booking.max_candidate_jobs,
        );
        for rank in ranks {
            if pass.is_full() {
                break;
            }
            let limit = pass.remaining_for(&rank.job_id);
            if limit == 0 {
                continue;
            }
            let Some(job) = view.job(&rank.job_id).cloned() else {
                continue;
            };
            let frames = find_dispatch_frames(
                &pass.offer,
                &job,
                &view.frames,
                &FrameFilter::default(),
                limit,
            );
            for frame in frames {
                if pass.is_full() || !pass.fits(&frame) {
                    break;
                }
                match self.book_frame(host, &frame, None) {
                    Some(proc) => {
                        view.record(&frame, proc.cores);
                        pass.record(proc);
                    }
                    None => break,
                }
            }
        }
    }

    /// One reserve → bind attempt. Any failure abandons the candidate.
    fn book_frame(
        &self,
        host: &Host,
        frame: &DispatchFrame,
        assignment_id: Option<&str>,
    ) -> Option<VirtualProc> {
        let req = ProcRequest {
            host_id: host.id.clone(),
            job_id: frame.job_id.clone(),
            layer_id: frame.layer_id.clone(),
            cores: frame.cores,
            memory: frame.memory,
            gpu: frame.gpu,
            assignment_id: assignment_id.map(str::to_string),
        };
        let proc = match self.allocator.reserve(&req) {
            Ok(proc) => proc,
            Err(DispatchError::ResourceExhausted(reason)) => {
                debug!(host = %host.name, frame = %frame.frame_name, %reason, "reservation failed");
                return None;
            }
            Err(e) => {
                warn!(host = %host.name, frame = %frame.frame_name, error = %e, "reservation error");
                return None;
            }
        };

        match self.allocator.bind(&proc.id, &frame.frame_id) {
            Ok(bound) => {
                info!(
                    proc = %bound.name(),
                    frame = %frame.frame_name,
                    cores = bound.cores,
                    memory = bound.memory_reserved,
                    "frame dispatched"
                );
                Some(bound)
            }
            Err(e) => {
                debug!(proc = %proc.name(), frame = %frame.frame_name, error = %e, "bind failed, unbooking");
                if let Err(e) = self.allocator.release(&proc.id) {
                    warn!(proc = %proc.name(), error = %e, "failed to unbook proc");
                }
                None
            }
        }
    }
}
