//! Fire-and-forget kill commands sent to host agents.
//!
//! Producers call [`KillQueue::submit`], which never blocks. Delivery runs
//! on the kill queue's workers through a [`KillTransport`]; a failed
//! delivery is retried once, then logged and dropped.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rendergrid_state::{FrameId, ProcId};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::queue::WorkQueue;
use crate::stats::{Counter, DispatchStats};

/// Terminate one frame on one host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KillCommand {
    pub host_name: String,
    pub frame_id: FrameId,
    pub proc_id: Option<ProcId>,
    pub reason: String,
}

pub type KillFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

/// Delivers kill commands to host agents. Implementations retry transient
/// delivery failures on their own.
pub trait KillTransport: Send + Sync {
    fn kill<'a>(&'a self, command: &'a KillCommand) -> KillFuture<'a>;
}

#[derive(Clone)]
pub struct KillQueue {
    queue: Arc<WorkQueue>,
    transport: Arc<dyn KillTransport>,
    stats: Arc<DispatchStats>,
}

impl KillQueue {
    pub fn new(
        queue: Arc<WorkQueue>,
        transport: Arc<dyn KillTransport>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self {
            queue,
            transport,
            stats,
        }
    }

    /// Queue a kill. Returns false if the queue refused it; the refusal is
    /// logged and counted, never raised.
    pub fn submit(&self, command: KillCommand) -> bool {
        let transport = self.transport.clone();
        let frame_id = command.frame_id.clone();
        let host = command.host_name.clone();
        let task = async move {
            if let Err(e) = transport.kill(&command).await {
                debug!(host = %command.host_name, frame = %command.frame_id, error = %e, "kill delivery failed, retrying");
                if let Err(e) = transport.kill(&command).await {
                    warn!(host = %command.host_name, frame = %command.frame_id, error = %e, "kill delivery failed");
                }
            }
        };
        match self.queue.submit(task) {
            Ok(()) => true,
            Err(e) => {
                self.stats.incr(Counter::RejectedKills);
                warn!(%host, frame = %frame_id, error = %e, "unable to queue kill");
                false
            }
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }
}

/// Transport that only logs, for replay runs without live agents.
#[derive(Debug, Default)]
pub struct LoggingKillTransport;

impl KillTransport for LoggingKillTransport {
    fn kill<'a>(&'a self, command: &'a KillCommand) -> KillFuture<'a> {
        Box::pin(async move {
            info!(
                host = %command.host_name,
                frame = %command.frame_id,
                proc = ?command.proc_id,
                reason = %command.reason,
                "kill frame"
            );
            Ok(())
        })
    }
}

/// Transport that keeps every command in memory.
#[derive(Debug, Default)]
pub struct RecordingKillTransport {
    commands: Mutex<Vec<KillCommand>>,
}

impl RecordingKillTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn commands(&self) -> Vec<KillCommand> {
        self.commands.lock().await.clone()
    }
}

impl KillTransport for RecordingKillTransport {
    fn kill<'a>(&'a self, command: &'a KillCommand) -> KillFuture<'a> {
        Box::pin(async move {
            self.commands.lock().await.push(command.clone());
            Ok(())
        })
    }
}
