//! FrameCompleteHandler — records a frame's exit and decides what its
//! proc does next.

use std::sync::Arc;

use rendergrid_depend::DependManager;
use rendergrid_state::{
    EntityRef, Frame, FrameCompleteReport, FrameState, JobState, StateError, StateStore,
    VirtualProc,
};
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, DispatchResult};
use crate::queue::WorkQueue;
use crate::stats::{Counter, DispatchStats};

/// What happened to the proc that ran the frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcDisposition {
    /// Bound straight to the next frame of the same job.
    Reused(VirtualProc),
    Released,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The reporting proc was not running the frame; nothing changed.
    Ignored,
    Recorded {
        frame: Frame,
        proc: ProcDisposition,
        job_finished: bool,
    },
}

#[derive(Clone)]
pub struct FrameCompleteHandler {
    store: StateStore,
    config: Arc<DispatchConfig>,
    dispatcher: Dispatcher,
    depends: DependManager,
    stats: Arc<DispatchStats>,
    depend_queue: Option<Arc<WorkQueue>>,
}

impl FrameCompleteHandler {
    pub fn new(
        store: StateStore,
        config: Arc<DispatchConfig>,
        dispatcher: Dispatcher,
        stats: Arc<DispatchStats>,
    ) -> Self {
        let depends = DependManager::new(store.clone());
        Self {
            store,
            config,
            dispatcher,
            depends,
            stats,
            depend_queue: None,
        }
    }

    /// Resolve depends on this queue instead of inline.
    pub fn with_depend_queue(mut self, queue: Arc<WorkQueue>) -> Self {
        self.depend_queue = Some(queue);
        self
    }

    pub async fn handle(&self, report: &FrameCompleteReport) -> DispatchResult<Completion> {
        let rf = &report.frame;
        if self.store.get_frame(&rf.frame_id)?.is_none() {
            return Err(DispatchError::State(StateError::NotFound(format!(
                "frame {}",
                rf.frame_id
            ))));
        }
        let Some(proc) = self.store.get_proc(&rf.resource_id)? else {
            return Ok(self.mismatch(report));
        };

        // Kills, releases and reuse on the host cannot land between the
        // binding check and the frame update.
        let frame = {
            let _guard = self.dispatcher.locks().lock(&proc.host_id).await;
            if !self.store.verify_running_proc(&rf.resource_id, &rf.frame_id)? {
                return Ok(self.mismatch(report));
            }
            self.store.update_frame_memory(&rf.frame_id, rf.rss, rf.max_rss)?;
            let next = self.next_state(report)?;
            match self
                .store
                .complete_frame(&rf.frame_id, &rf.resource_id, report.exit_status, next)
            {
                Ok(frame) => frame,
                Err(StateError::InvalidState(_)) => return Ok(self.mismatch(report)),
                Err(e) => return Err(e.into()),
            }
        };
        info!(
            host = %report.host_name,
            frame = %frame.name,
            exit_status = report.exit_status,
            exit_signal = report.exit_signal,
            run_time = report.run_time,
            state = ?frame.state,
            "frame completed"
        );

        let mut job_finished = false;
        if frame.state == FrameState::Succeeded {
            self.satisfy_depends(&frame);
            job_finished = self.finish_job_if_done(&frame.job_id)?;
        }

        let proc = if job_finished {
            self.release(&rf.resource_id)?
        } else {
            self.reuse_or_release(&rf.resource_id).await?
        };

        Ok(Completion::Recorded {
            frame,
            proc,
            job_finished,
        })
    }

    fn mismatch(&self, report: &FrameCompleteReport) -> Completion {
        self.stats.incr(Counter::AccountingErrors);
        warn!(
            host = %report.host_name,
            proc = %report.frame.resource_id,
            frame = %report.frame.frame_name,
            "completed frame was not running on the reporting proc"
        );
        Completion::Ignored
    }

    fn next_state(&self, report: &FrameCompleteReport) -> DispatchResult<FrameState> {
        if report.succeeded() {
            return Ok(FrameState::Succeeded);
        }
        let retries = self
            .store
            .get_frame(&report.frame.frame_id)?
            .map(|f| f.retries)
            .unwrap_or_default();
        if retries >= self.config.frames.max_retries {
            Ok(FrameState::Dead)
        } else {
            Ok(FrameState::Waiting)
        }
    }

    /// Satisfy edges on the frame, its layer and its job, in that order.
    fn satisfy_depends(&self, frame: &Frame) {
        let entities = vec![
            EntityRef::frame(&frame.job_id, &frame.layer_id, &frame.id),
            EntityRef::layer(&frame.job_id, &frame.layer_id),
            EntityRef::job(&frame.job_id),
        ];
        let Some(queue) = &self.depend_queue else {
            resolve_depends(&self.depends, &entities);
            return;
        };
        let depends = self.depends.clone();
        let queued = entities.clone();
        if let Err(e) = queue.submit(async move { resolve_depends(&depends, &queued) }) {
            warn!(frame = %frame.name, error = %e, "depend queue refused work, resolving inline");
            resolve_depends(&self.depends, &entities);
        }
    }

    fn finish_job_if_done(&self, job_id: &str) -> DispatchResult<bool> {
        if !self.store.is_entity_complete(&EntityRef::job(job_id))? {
            return Ok(false);
        }
        let pending = self
            .store
            .get_job(job_id)?
            .is_some_and(|job| job.state == JobState::Pending);
        if pending && self.store.set_job_state(job_id, JobState::Finished)? {
            info!(job = %job_id, "job finished");
            return Ok(true);
        }
        Ok(false)
    }

    async fn reuse_or_release(&self, proc_id: &str) -> DispatchResult<ProcDisposition> {
        match self.dispatcher.dispatch_proc_to_job(proc_id).await {
            Ok(Some(proc)) => Ok(ProcDisposition::Reused(proc)),
            Ok(None) => self.release(proc_id),
            Err(e) => {
                warn!(proc = %proc_id, error = %e, "proc reuse failed");
                self.release(proc_id)
            }
        }
    }

    fn release(&self, proc_id: &str) -> DispatchResult<ProcDisposition> {
        self.dispatcher.allocator().release(proc_id)?;
        Ok(ProcDisposition::Released)
    }
}

fn resolve_depends(depends: &DependManager, entities: &[EntityRef]) {
    for entity in entities {
        match depends.resolve_completed(entity) {
            Ok(0) => {}
            Ok(satisfied) => debug!(job = %entity.job_id, layer = ?entity.layer_id, frame = ?entity.frame_id, satisfied, "depends satisfied"),
            Err(e) => warn!(job = %entity.job_id, error = %e, "failed to satisfy depends"),
        }
    }
}
