//! Error types for the dependency graph.

use rendergrid_state::StateError;
use thiserror::Error;

/// Result type alias for dependency graph operations.
pub type DependResult<T> = Result<T, DependError>;

#[derive(Debug, Error)]
pub enum DependError {
    /// Depender and dependee are the same entity.
    #[error("{0} cannot depend on itself")]
    SelfDependency(String),

    /// An endpoint does not exist or its ids disagree with each other.
    #[error("invalid depend: {0}")]
    InvalidEdge(String),

    #[error(transparent)]
    State(#[from] StateError),
}
