//! rendergrid-dispatch — the booking core of the RenderGrid scheduler.
//!
//! Reconciles host heartbeats with the database of record, books waiting
//! frames onto hosts as virtual procs, and routes frame completions back
//! into proc reuse and depend satisfaction.
//!
//! # Architecture
//!
//! ```text
//! DispatchPipeline
//!   ├── report queue ── HostReportHandler
//!   │                     ├── verify frames / memory / swap → KillQueue
//!   │                     └── bookability gate → dispatch queue
//!   ├── dispatch queue ── Dispatcher (host, show, group, job, local, proc)
//!   │                  └─ FrameCompleteHandler → depend queue
//!   ├── depend queue ─── DependManager::resolve_completed
//!   └── kill queue ───── KillTransport
//! ```
//!
//! Every reserve → bind → release sequence on a host runs under that
//! host's lock in [`HostLocks`]; the store's transactions keep each step
//! atomic.

pub mod allocator;
pub mod completion;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod kill;
pub mod lifecycle;
pub mod locks;
pub mod pipeline;
pub mod queue;
pub mod report;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use allocator::{MemoryAdjustment, ProcAllocator};
pub use completion::{Completion, FrameCompleteHandler, ProcDisposition};
pub use config::{
    BookingConfig, DispatchConfig, FramesConfig, QueueConfig, QueuesConfig, ReportConfig,
};
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, DispatchResult, SubmitError};
pub use kill::{
    KillCommand, KillFuture, KillQueue, KillTransport, LoggingKillTransport,
    RecordingKillTransport,
};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use locks::HostLocks;
pub use pipeline::DispatchPipeline;
pub use queue::WorkQueue;
pub use report::{
    Booking, BookingKind, HostReportHandler, ReportOutcome, next_hardware_state, next_lock_state,
};
pub use stats::{Counter, DispatchStats, StatsSnapshot};
