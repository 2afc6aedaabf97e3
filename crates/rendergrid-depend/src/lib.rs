//! rendergrid-depend — dependency graph between jobs, layers and frames.
//!
//! A [`Depend`] is one of four edge kinds (`JobOnJob`, `LayerOnLayer`,
//! `LayerOnFrame`, `FrameOnFrame`). Edges are identified by a stable
//! signature, classified Internal or External, and persisted through the
//! [`DependManager`], which gates depender frames until the edge is
//! satisfied.

pub mod depend;
pub mod error;
pub mod manager;

pub use depend::{Depend, DependVisitor, Endpoint, FrameRef, LayerRef};
pub use error::{DependError, DependResult};
pub use manager::{CreateOutcome, DependManager};
