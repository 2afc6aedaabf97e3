//! Accept-new-work state shared by every queue producer.
//!
//! Transitions only move forward: `Init → Accepting → Draining → Stopped`.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::error::SubmitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Init,
    Accepting,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct Lifecycle {
    tx: Arc<watch::Sender<LifecycleState>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecycleState::Init);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    /// Start accepting work. Returns false if already past `Init`.
    pub fn start(&self) -> bool {
        self.advance(LifecycleState::Accepting)
    }

    /// Stop accepting work; in-flight tasks keep running.
    pub fn drain(&self) -> bool {
        self.advance(LifecycleState::Draining)
    }

    pub fn stop(&self) -> bool {
        self.advance(LifecycleState::Stopped)
    }

    pub fn is_accepting(&self) -> bool {
        self.state() == LifecycleState::Accepting
    }

    /// Gate for queue submission.
    pub fn check_accepting(&self) -> Result<(), SubmitError> {
        match self.state() {
            LifecycleState::Accepting => Ok(()),
            LifecycleState::Init => Err(SubmitError::NotStarted),
            LifecycleState::Draining | LifecycleState::Stopped => Err(SubmitError::ShuttingDown),
        }
    }

    /// Wait until the state reaches at least `target`.
    pub async fn wait_for(&self, target: LifecycleState) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state >= target).await;
    }

    fn advance(&self, next: LifecycleState) -> bool {
        let moved = self.tx.send_if_modified(|state| {
            if *state < next {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            info!(state = ?next, "lifecycle changed");
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moves_forward_only() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.check_accepting(), Err(SubmitError::NotStarted));
        assert!(lifecycle.start());
        assert!(!lifecycle.start());
        assert!(lifecycle.check_accepting().is_ok());
        assert!(lifecycle.drain());
        assert_eq!(lifecycle.check_accepting(), Err(SubmitError::ShuttingDown));
        assert!(lifecycle.stop());
        assert!(!lifecycle.drain());
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn observers_see_transitions() {
        let lifecycle = Lifecycle::new();
        lifecycle.start();
        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.wait_for(LifecycleState::Draining).await })
        };
        lifecycle.drain();
        waiter.await.unwrap();
        assert!(!lifecycle.is_accepting());
    }
}
