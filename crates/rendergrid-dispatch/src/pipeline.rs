//! DispatchPipeline — wires the store, handlers and work queues together.
//!
//! Host reports run on the report queue. Bookings decided by a report, and
//! frame completions, run on the dispatch queue. Depend satisfaction and
//! kill delivery each have a queue of their own. Producers never block:
//! every `queue_*` call either accepts the work or returns a
//! [`SubmitError`] saying whether to resend.

use std::sync::Arc;

use rendergrid_state::{FrameCompleteReport, HostReport, StateStore};
use tracing::{info, warn};

use crate::allocator::ProcAllocator;
use crate::completion::FrameCompleteHandler;
use crate::config::DispatchConfig;
use crate::dispatcher::Dispatcher;
use crate::error::SubmitError;
use crate::kill::{KillQueue, KillTransport};
use crate::lifecycle::Lifecycle;
use crate::locks::HostLocks;
use crate::queue::WorkQueue;
use crate::report::HostReportHandler;
use crate::stats::{Counter, DispatchStats, StatsSnapshot};

pub struct DispatchPipeline {
    store: StateStore,
    config: Arc<DispatchConfig>,
    lifecycle: Lifecycle,
    stats: Arc<DispatchStats>,
    dispatcher: Dispatcher,
    reports: HostReportHandler,
    completions: FrameCompleteHandler,
    report_queue: Arc<WorkQueue>,
    dispatch_queue: Arc<WorkQueue>,
    depend_queue: Arc<WorkQueue>,
    kill_queue: Arc<WorkQueue>,
}

impl DispatchPipeline {
    /// Build every component. Queues start their workers immediately, so
    /// this must run inside a tokio runtime; work is refused until
    /// [`start`](Self::start).
    pub fn new(
        store: StateStore,
        config: DispatchConfig,
        transport: Arc<dyn KillTransport>,
    ) -> Self {
        let config = Arc::new(config);
        let stats = Arc::new(DispatchStats::new());
        let locks = HostLocks::new();

        let queues = &config.queues;
        let report_queue = Arc::new(WorkQueue::new("report", queues.report));
        let dispatch_queue = Arc::new(WorkQueue::new("dispatch", queues.dispatch));
        let depend_queue = Arc::new(WorkQueue::new("depend", queues.depend));
        let kill_queue = Arc::new(WorkQueue::new("kill", queues.kill));

        let allocator = ProcAllocator::new(
            store.clone(),
            stats.clone(),
            config.report.balance_headroom_kb,
        );
        let dispatcher = Dispatcher::new(store.clone(), allocator, locks.clone(), config.clone());
        let kills = KillQueue::new(kill_queue.clone(), transport, stats.clone());

        let reports = HostReportHandler::new(
            store.clone(),
            config.clone(),
            dispatcher.clone(),
            kills,
            locks,
            stats.clone(),
        )
        .with_booking_queue(dispatch_queue.clone())
        .with_report_queue(report_queue.clone());
        let completions =
            FrameCompleteHandler::new(store.clone(), config.clone(), dispatcher.clone(), stats.clone())
                .with_depend_queue(depend_queue.clone());

        Self {
            store,
            config,
            lifecycle: Lifecycle::new(),
            stats,
            dispatcher,
            reports,
            completions,
            report_queue,
            dispatch_queue,
            depend_queue,
            kill_queue,
        }
    }

    pub fn start(&self) -> bool {
        self.lifecycle.start()
    }

    pub fn queue_host_report(&self, report: HostReport) -> Result<(), SubmitError> {
        self.queue_report(report, false)
    }

    pub fn queue_boot_report(&self, report: HostReport) -> Result<(), SubmitError> {
        self.queue_report(report, true)
    }

    fn queue_report(&self, report: HostReport, is_boot: bool) -> Result<(), SubmitError> {
        let host = report.host.name.clone();
        let handler = self.reports.clone();
        let submitted = self.lifecycle.check_accepting().and_then(|()| {
            self.report_queue.submit(async move {
                if let Err(e) = handler.handle(&report, is_boot).await {
                    warn!(host = %report.host.name, error = %e, "failed to handle host report");
                }
            })
        });
        if let Err(e) = submitted {
            self.stats.incr(Counter::RejectedReports);
            warn!(%host, is_boot, error = %e, "host report rejected");
        }
        submitted
    }

    pub fn queue_frame_complete(&self, report: FrameCompleteReport) -> Result<(), SubmitError> {
        let host = report.host_name.clone();
        let handler = self.completions.clone();
        let submitted = self.lifecycle.check_accepting().and_then(|()| {
            self.dispatch_queue.submit(async move {
                if let Err(e) = handler.handle(&report).await {
                    warn!(host = %report.host_name, frame = %report.frame.frame_name, error = %e, "failed to handle frame complete");
                }
            })
        });
        if let Err(e) = submitted {
            self.stats.incr(Counter::RejectedReports);
            warn!(%host, error = %e, "frame complete rejected");
        }
        submitted
    }

    /// Wait until no queue holds work, including work queued by other work.
    pub async fn wait_idle(&self) {
        loop {
            for queue in self.queues() {
                queue.wait_idle().await;
            }
            if self.queues().iter().all(|q| q.pending() == 0) {
                return;
            }
        }
    }

    /// Refuse new work, finish what is queued, then stop every worker.
    ///
    /// Queues stop upstream first so nothing is handed to a stopped queue.
    pub async fn shutdown(&self) {
        if !self.lifecycle.drain() {
            return;
        }
        for queue in self.queues() {
            queue.shutdown().await;
        }
        self.lifecycle.stop();
        info!(stats = ?self.stats.snapshot(), "dispatch pipeline stopped");
    }

    fn queues(&self) -> [&Arc<WorkQueue>; 4] {
        [
            &self.report_queue,
            &self.dispatch_queue,
            &self.depend_queue,
            &self.kill_queue,
        ]
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }
}
