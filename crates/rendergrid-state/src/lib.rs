//! rendergrid-state — database of record for the RenderGrid scheduler.
//!
//! Backed by [redb](https://docs.rs/redb), holds shows, fair-share folders,
//! jobs, layers, frames, hosts, virtual procs, local host assignments and
//! depend edges, plus the wire types reported by host agents.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Proc booking operations each run
//! in a single write transaction so host capacity is never over-committed.

/// Map a redb/serde error into the named `StateError` variant.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod booking;
pub mod depends;
pub mod error;
pub mod report;
pub mod store;
pub mod tables;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use booking::ProcRequest;
pub use error::{StateError, StateResult};
pub use report::{FrameCompleteReport, HostReport, RenderHost, RunningFrameInfo};
pub use store::{StateStore, epoch_millis, epoch_secs};
pub use types::*;
