//! Dispatch error types.

use rendergrid_depend::DependError;
use rendergrid_state::StateError;
use thiserror::Error;

/// Errors raised while booking, reconciling or completing work.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Not enough idle capacity at reservation time. Callers treat this as
    /// "no candidate", not a failure.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The frame or proc is already bound.
    #[error("resource duplication: {0}")]
    ResourceDuplication(String),

    /// A memory reservation could not be raised.
    #[error("reservation adjustment failed: {0}")]
    ReservationAdjustment(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("state store error: {0}")]
    State(StateError),

    #[error("depend error: {0}")]
    Depend(#[from] DependError),
}

impl From<StateError> for DispatchError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::ResourceExhausted(msg) => Self::ResourceExhausted(msg),
            StateError::Duplicate(msg) => Self::ResourceDuplication(msg),
            StateError::ReservationFailure(msg) => Self::ReservationAdjustment(msg),
            other => Self::State(other),
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Why a queue refused new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The subsystem is draining; resend later.
    #[error("not accepting work, shutting down")]
    ShuttingDown,

    /// The subsystem has not started accepting work yet.
    #[error("not accepting work yet")]
    NotStarted,

    /// The queue is at capacity; resend later.
    #[error("{0} queue is full")]
    QueueFull(&'static str),

    /// The queue has stopped for good.
    #[error("{0} queue is closed")]
    Closed(&'static str),
}

impl SubmitError {
    /// True if the producer should back off and resend.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Closed(_))
    }
}
