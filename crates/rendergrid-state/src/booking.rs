//! Atomic proc bookkeeping.
//!
//! Every operation here runs in one write transaction and touches the
//! host's idle counters together with the job, folder, subscription and
//! local assignment usage, so partial bookings are never visible.

use redb::{ReadableTable, Table, WriteTransaction};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::report::RenderHost;
use crate::store::{StateStore, epoch_secs, get_json, list_json, next_id, put_json, require_json};
use crate::tables::*;
use crate::types::*;

/// What to carve out of a host for a new proc.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcRequest {
    pub host_id: HostId,
    pub job_id: JobId,
    pub layer_id: LayerId,
    pub cores: u32,
    pub memory: u64,
    pub gpu: u32,
    /// Set when booking through a local host assignment.
    pub assignment_id: Option<AssignmentId>,
}

impl StateStore {
    /// Reserve a proc on a host and charge it to the job's accounting.
    ///
    /// Fails with `ResourceExhausted` if the host (or local assignment)
    /// lacks idle capacity, or the job would exceed its core ceiling.
    pub fn reserve_proc(&self, req: &ProcRequest) -> StateResult<VirtualProc> {
        let proc = self.write(|txn| {
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let mut assignments = txn.open_table(LOCAL_ASSIGNMENTS).map_err(map_err!(Table))?;

            let mut host: Host = require_json(&hosts, &req.host_id, "host")?;
            if host.idle_cores < req.cores || host.idle_memory < req.memory || host.idle_gpu < req.gpu
            {
                return Err(StateError::ResourceExhausted(format!(
                    "host {} idle {}c/{}KB/{}g, requested {}c/{}KB/{}g",
                    host.name,
                    host.idle_cores,
                    host.idle_memory,
                    host.idle_gpu,
                    req.cores,
                    req.memory,
                    req.gpu
                )));
            }

            let mut job: Job = require_json(&jobs, &req.job_id, "job")?;
            if job.cores + req.cores > job.max_cores {
                return Err(StateError::ResourceExhausted(format!(
                    "job {} at {} of {} cores",
                    job.name, job.cores, job.max_cores
                )));
            }

            let mut assignment = match &req.assignment_id {
                Some(id) => {
                    let lha: LocalHostAssignment = require_json(&assignments, id, "local assignment")?;
                    if lha.idle_cores() < req.cores
                        || lha.idle_memory() < req.memory
                        || lha.idle_gpu() < req.gpu
                    {
                        return Err(StateError::ResourceExhausted(format!(
                            "local assignment {id} has {}c/{}KB/{}g idle",
                            lha.idle_cores(),
                            lha.idle_memory(),
                            lha.idle_gpu()
                        )));
                    }
                    Some(lha)
                }
                None => None,
            };

            host.idle_cores -= req.cores;
            host.idle_memory -= req.memory;
            host.idle_gpu -= req.gpu;
            put_json(&mut hosts, &host.id, &host)?;

            job.cores += req.cores;
            put_json(&mut jobs, &job.id, &job)?;

            charge_cores(txn, &job, &host.allocation, i64::from(req.cores))?;

            if let Some(lha) = assignment.as_mut() {
                lha.cores += req.cores;
                lha.memory += req.memory;
                lha.gpu += req.gpu;
                put_json(&mut assignments, &lha.id, &*lha)?;
            }

            let proc = VirtualProc {
                id: next_id(txn, "proc")?,
                host_id: host.id.clone(),
                host_name: host.name.clone(),
                allocation: host.allocation.clone(),
                show_id: job.show_id.clone(),
                job_id: job.id.clone(),
                layer_id: req.layer_id.clone(),
                frame_id: None,
                cores: req.cores,
                memory_reserved: req.memory,
                gpu_reserved: req.gpu,
                rss: 0,
                max_rss: 0,
                vsize: 0,
                max_vsize: 0,
                is_local: req.assignment_id.is_some(),
                assignment_id: req.assignment_id.clone(),
                booked_at: epoch_secs(),
            };
            let mut procs = txn.open_table(PROCS).map_err(map_err!(Table))?;
            put_json(&mut procs, &proc.id, &proc)?;
            Ok(proc)
        })?;
        debug!(proc = %proc.name(), job = %proc.job_id, cores = proc.cores, memory = proc.memory_reserved, "proc reserved");
        Ok(proc)
    }

    /// Bind a reserved proc to a waiting frame, moving the frame to Running.
    ///
    /// Fails with `Duplicate` if either side is already bound.
    pub fn bind_proc(&self, proc_id: &str, frame_id: &str) -> StateResult<VirtualProc> {
        self.write(|txn| {
            let mut procs = txn.open_table(PROCS).map_err(map_err!(Table))?;
            let mut frames = txn.open_table(FRAMES).map_err(map_err!(Table))?;
            let mut bindings = txn.open_table(FRAME_PROCS).map_err(map_err!(Table))?;

            let mut proc: VirtualProc = require_json(&procs, proc_id, "proc")?;
            if let Some(current) = &proc.frame_id {
                return Err(StateError::Duplicate(format!(
                    "proc {proc_id} already runs frame {current}"
                )));
            }
            let owner = bindings
                .get(frame_id)
                .map_err(map_err!(Read))?
                .map(|g| g.value().to_string());
            if let Some(owner) = owner {
                return Err(StateError::Duplicate(format!(
                    "frame {frame_id} already bound to proc {owner}"
                )));
            }

            let mut frame: Frame = require_json(&frames, frame_id, "frame")?;
            if frame.state != FrameState::Waiting {
                return Err(StateError::InvalidState(format!(
                    "frame {} is {:?}, expected Waiting",
                    frame.name, frame.state
                )));
            }
            if frame.job_id != proc.job_id {
                return Err(StateError::InvalidState(format!(
                    "frame {} belongs to job {}, proc booked for {}",
                    frame.name, frame.job_id, proc.job_id
                )));
            }

            frame.state = FrameState::Running;
            frame.rss = 0;
            frame.vsize = 0;
            frame.exit_status = None;
            put_json(&mut frames, frame_id, &frame)?;

            proc.frame_id = Some(frame_id.to_string());
            proc.layer_id = frame.layer_id.clone();
            proc.rss = 0;
            proc.max_rss = 0;
            proc.vsize = 0;
            proc.max_vsize = 0;
            put_json(&mut procs, proc_id, &proc)?;

            bindings
                .insert(frame_id, proc_id)
                .map_err(map_err!(Write))?;
            Ok(proc)
        })
    }

    /// Return a proc's resources to its host and drop it.
    ///
    /// Idempotent: releasing an unknown proc returns `Ok(None)`. The bound
    /// frame's state is left to the caller.
    pub fn release_proc(&self, proc_id: &str) -> StateResult<Option<VirtualProc>> {
        let released = self.write(|txn| {
            let mut procs = txn.open_table(PROCS).map_err(map_err!(Table))?;
            let Some(proc) = get_json::<VirtualProc, _>(&procs, proc_id)? else {
                return Ok(None);
            };
            procs.remove(proc_id).map_err(map_err!(Write))?;

            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            if let Some(mut host) = get_json::<Host, _>(&hosts, &proc.host_id)? {
                host.idle_cores = (host.idle_cores + proc.cores).min(host.total_cores);
                host.idle_memory = (host.idle_memory + proc.memory_reserved).min(host.total_memory);
                host.idle_gpu = (host.idle_gpu + proc.gpu_reserved).min(host.total_gpu);
                put_json(&mut hosts, &host.id, &host)?;
            }

            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            if let Some(mut job) = get_json::<Job, _>(&jobs, &proc.job_id)? {
                job.cores = job.cores.saturating_sub(proc.cores);
                put_json(&mut jobs, &job.id, &job)?;
                charge_cores(txn, &job, &proc.allocation, -i64::from(proc.cores))?;
            }

            if let Some(id) = &proc.assignment_id {
                let mut assignments = txn.open_table(LOCAL_ASSIGNMENTS).map_err(map_err!(Table))?;
                if let Some(mut lha) = get_json::<LocalHostAssignment, _>(&assignments, id)? {
                    lha.cores = lha.cores.saturating_sub(proc.cores);
                    lha.memory = lha.memory.saturating_sub(proc.memory_reserved);
                    lha.gpu = lha.gpu.saturating_sub(proc.gpu_reserved);
                    put_json(&mut assignments, id, &lha)?;
                }
            }

            if let Some(frame_id) = &proc.frame_id {
                let mut bindings = txn.open_table(FRAME_PROCS).map_err(map_err!(Table))?;
                unbind(&mut bindings, frame_id, proc_id)?;
            }
            Ok(Some(proc))
        })?;
        if let Some(proc) = &released {
            debug!(proc = %proc.name(), cores = proc.cores, "proc released");
        }
        Ok(released)
    }

    /// Detach a proc from its frame without releasing its resources.
    ///
    /// Returns true if the proc was bound.
    pub fn clear_proc_assignment(&self, proc_id: &str) -> StateResult<bool> {
        self.write(|txn| {
            let mut procs = txn.open_table(PROCS).map_err(map_err!(Table))?;
            let Some(mut proc) = get_json::<VirtualProc, _>(&procs, proc_id)? else {
                return Ok(false);
            };
            let Some(frame_id) = proc.frame_id.take() else {
                return Ok(false);
            };
            put_json(&mut procs, proc_id, &proc)?;
            let mut bindings = txn.open_table(FRAME_PROCS).map_err(map_err!(Table))?;
            unbind(&mut bindings, &frame_id, proc_id)?;
            Ok(true)
        })
    }

    /// Record a frame's exit: set its next state and detach it from `proc_id`.
    ///
    /// A frame sent back to Waiting counts one retry, and parks in Depend
    /// while it still has unsatisfied depends. Fails with `InvalidState`,
    /// changing nothing, unless `proc_id` is still bound to the frame.
    pub fn complete_frame(
        &self,
        frame_id: &str,
        proc_id: &str,
        exit_status: i32,
        next: FrameState,
    ) -> StateResult<Frame> {
        self.write(|txn| {
            let mut procs = txn.open_table(PROCS).map_err(map_err!(Table))?;
            let bound = get_json::<VirtualProc, _>(&procs, proc_id)?
                .filter(|p| p.frame_id.as_deref() == Some(frame_id));
            let Some(mut proc) = bound else {
                return Err(StateError::InvalidState(format!(
                    "proc {proc_id} is not running frame {frame_id}"
                )));
            };

            let mut frames = txn.open_table(FRAMES).map_err(map_err!(Table))?;
            let mut frame: Frame = require_json(&frames, frame_id, "frame")?;
            frame.exit_status = Some(exit_status);
            frame.state = match next {
                FrameState::Waiting => {
                    frame.retries += 1;
                    if frame.depend_count > 0 {
                        FrameState::Depend
                    } else {
                        FrameState::Waiting
                    }
                }
                other => other,
            };
            put_json(&mut frames, frame_id, &frame)?;

            proc.frame_id = None;
            put_json(&mut procs, proc_id, &proc)?;
            let mut bindings = txn.open_table(FRAME_PROCS).map_err(map_err!(Table))?;
            unbind(&mut bindings, frame_id, proc_id)?;
            Ok(frame)
        })
    }

    /// Grow a proc's memory reservation to `new_kb`.
    ///
    /// Returns `Ok(false)` if `new_kb` is not larger than the current
    /// reservation, `ReservationFailure` if the host cannot cover it.
    pub fn increase_reserved_memory(&self, proc_id: &str, new_kb: u64) -> StateResult<bool> {
        self.write(|txn| {
            let mut procs = txn.open_table(PROCS).map_err(map_err!(Table))?;
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let mut proc: VirtualProc = require_json(&procs, proc_id, "proc")?;
            if new_kb <= proc.memory_reserved {
                return Ok(false);
            }
            let mut host: Host = require_json(&hosts, &proc.host_id, "host")?;
            let delta = new_kb - proc.memory_reserved;
            if new_kb > host.total_memory {
                return Err(StateError::ReservationFailure(format!(
                    "proc {} wants {new_kb}KB, host {} has {}KB total",
                    proc.id, host.name, host.total_memory
                )));
            }
            if host.idle_memory < delta {
                return Err(StateError::ReservationFailure(format!(
                    "proc {} needs {delta}KB more, host {} has {}KB idle",
                    proc.id, host.name, host.idle_memory
                )));
            }
            host.idle_memory -= delta;
            proc.memory_reserved = new_kb;
            put_json(&mut hosts, &host.id, &host)?;
            put_json(&mut procs, proc_id, &proc)?;

            if let Some(id) = &proc.assignment_id {
                let mut assignments = txn.open_table(LOCAL_ASSIGNMENTS).map_err(map_err!(Table))?;
                if let Some(mut lha) = get_json::<LocalHostAssignment, _>(&assignments, id)? {
                    lha.memory += delta;
                    put_json(&mut assignments, id, &lha)?;
                }
            }
            Ok(true)
        })
    }

    /// Cover a proc's memory shortfall from idle host memory plus the
    /// slack of sibling procs on the same host.
    ///
    /// A sibling's slack is its reservation minus its peak usage and
    /// `headroom_kb`. Nothing is written unless the full shortfall can be
    /// covered. Local procs are never balanced.
    pub fn balance_reserved_memory(
        &self,
        proc_id: &str,
        needed_kb: u64,
        headroom_kb: u64,
    ) -> StateResult<bool> {
        let balanced = self.write(|txn| {
            let mut procs = txn.open_table(PROCS).map_err(map_err!(Table))?;
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let mut target: VirtualProc = require_json(&procs, proc_id, "proc")?;
            if target.is_local {
                return Ok(false);
            }
            if needed_kb <= target.memory_reserved {
                return Ok(true);
            }
            let mut host: Host = require_json(&hosts, &target.host_id, "host")?;
            if needed_kb > host.total_memory {
                return Ok(false);
            }

            let mut remaining = needed_kb - target.memory_reserved;
            let from_host = remaining.min(host.idle_memory);
            remaining -= from_host;

            let mut siblings: Vec<(VirtualProc, u64)> = list_json::<VirtualProc, _>(&procs)?
                .into_iter()
                .filter(|p| p.host_id == target.host_id && p.id != target.id && !p.is_local)
                .map(|p| {
                    let used = p.rss.max(p.max_rss) + headroom_kb;
                    let slack = p.memory_reserved.saturating_sub(used);
                    (p, slack)
                })
                .filter(|(_, slack)| *slack > 0)
                .collect();
            siblings.sort_by(|a, b| b.1.cmp(&a.1));

            let mut donors = Vec::new();
            for (mut sibling, slack) in siblings {
                if remaining == 0 {
                    break;
                }
                let take = slack.min(remaining);
                sibling.memory_reserved -= take;
                remaining -= take;
                donors.push((sibling, take));
            }
            if remaining > 0 {
                return Ok(false);
            }

            for (sibling, take) in &donors {
                debug!(donor = %sibling.name(), take, "memory moved between procs");
                put_json(&mut procs, &sibling.id, sibling)?;
            }
            host.idle_memory -= from_host;
            put_json(&mut hosts, &host.id, &host)?;
            target.memory_reserved = needed_kb;
            put_json(&mut procs, proc_id, &target)?;
            Ok(true)
        })?;
        Ok(balanced)
    }

    /// True if the proc exists and is bound to `frame_id`.
    pub fn verify_running_proc(&self, proc_id: &str, frame_id: &str) -> StateResult<bool> {
        Ok(self
            .get_proc(proc_id)?
            .is_some_and(|p| p.frame_id.as_deref() == Some(frame_id)))
    }

    /// True if a proc is not doing useful work: unbound, or bound to a
    /// frame that is missing or not running on it. Unknown procs are not
    /// orphans.
    pub fn is_orphan(&self, proc_id: &str) -> StateResult<bool> {
        self.read(|txn| {
            let procs = txn.open_table(PROCS).map_err(map_err!(Table))?;
            let frames = txn.open_table(FRAMES).map_err(map_err!(Table))?;
            let bindings = txn.open_table(FRAME_PROCS).map_err(map_err!(Table))?;
            let Some(proc) = get_json::<VirtualProc, _>(&procs, proc_id)? else {
                return Ok(false);
            };
            let Some(frame_id) = proc.frame_id else {
                return Ok(true);
            };
            let running = get_json::<Frame, _>(&frames, &frame_id)?
                .is_some_and(|f| f.state == FrameState::Running);
            let owned = bindings
                .get(frame_id.as_str())
                .map_err(map_err!(Read))?
                .is_some_and(|g| g.value() == proc_id);
            Ok(!(running && owned))
        })
    }

    // ── Host registration ──────────────────────────────────────────

    /// Register a host seen for the first time in a report.
    ///
    /// Returns the existing host if one with the same name is already
    /// registered.
    pub fn create_host_from_report(
        &self,
        report: &RenderHost,
        default_allocation: &str,
    ) -> StateResult<Host> {
        let (host, created) = self.write(|txn| {
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let existing = list_json::<Host, _>(&hosts)?
                .into_iter()
                .find(|h| h.name == report.name);
            if let Some(host) = existing {
                return Ok((host, false));
            }
            let total_gpu = report.total_gpu();
            let host = Host {
                id: next_id(txn, "host")?,
                name: report.name.clone(),
                allocation: report
                    .allocation
                    .clone()
                    .unwrap_or_else(|| default_allocation.to_string()),
                facility: report.facility.clone(),
                os: report.os().unwrap_or_default().to_string(),
                tags: report.tags.clone(),
                state: report.state,
                lock_state: if report.nimby_locked {
                    LockState::NimbyLocked
                } else {
                    LockState::Open
                },
                thread_mode: ThreadMode::default(),
                total_cores: report.cores,
                idle_cores: report.cores,
                total_memory: report.total_mem,
                idle_memory: report.total_mem,
                total_gpu,
                idle_gpu: total_gpu,
                free_memory: report.free_mem,
                total_swap: report.total_swap,
                free_swap: report.free_swap,
                total_mcp: report.total_mcp,
                free_mcp: report.free_mcp,
                load: report.load,
                boot_time: report.boot_time,
                ping_time: epoch_secs(),
                preferred_show: None,
            };
            put_json(&mut hosts, &host.id, &host)?;
            Ok((host, true))
        })?;
        if created {
            info!(host = %host.name, id = %host.id, allocation = %host.allocation, "host registered");
        }
        Ok(host)
    }
}

/// Add `delta` cores to a job's folder and its show's subscription.
fn charge_cores(txn: &WriteTransaction, job: &Job, allocation: &str, delta: i64) -> StateResult<()> {
    let apply = |current: u32| -> u32 {
        u32::try_from((i64::from(current) + delta).max(0)).unwrap_or(u32::MAX)
    };

    let mut folders = txn.open_table(FOLDERS).map_err(map_err!(Table))?;
    if let Some(mut folder) = get_json::<Folder, _>(&folders, &job.folder_id)? {
        folder.cores = apply(folder.cores);
        put_json(&mut folders, &folder.id, &folder)?;
    }

    let mut subs = txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
    let key = subscription_key(&job.show_id, allocation);
    if let Some(mut sub) = get_json::<Subscription, _>(&subs, &key)? {
        sub.cores = apply(sub.cores);
        put_json(&mut subs, &key, &sub)?;
    }
    Ok(())
}

/// Drop the `frame_id -> proc_id` binding if `proc_id` still owns it.
fn unbind(
    bindings: &mut Table<'_, &'static str, &'static str>,
    frame_id: &str,
    proc_id: &str,
) -> StateResult<()> {
    let owned = bindings
        .get(frame_id)
        .map_err(map_err!(Read))?
        .is_some_and(|g| g.value() == proc_id);
    if owned {
        bindings.remove(frame_id).map_err(map_err!(Write))?;
    }
    Ok(())
}
