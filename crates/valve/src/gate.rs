//! [`Gate`]: the shared pause/resume state for controlled listeners.
//!
//! The gate is the only mutable state shared across the hot path. It is a
//! `tokio::sync::watch` channel wrapped so that transitions are idempotent
//! and observers can block on a state change without lost wake-ups. One
//! instance is created by the service and handed by `Arc` to the controller
//! and to every controlled listener.

use tokio::sync::watch;

/// Pause/resume state with condition-wait semantics.
#[derive(Debug)]
pub struct Gate {
    // Channel value: true = paused (admission closed).
    paused: watch::Sender<bool>,
}

impl Gate {
    /// Creates a gate in the given initial state.
    pub fn new(paused: bool) -> Self {
        let (tx, _rx) = watch::channel(paused);
        Self { paused: tx }
    }

    /// Closes the gate. Returns false when it was already paused.
    pub fn pause(&self) -> bool {
        self.paused.send_if_modified(|paused| {
            if *paused {
                false
            } else {
                *paused = true;
                true
            }
        })
    }

    /// Opens the gate. Returns false when it was already resumed.
    pub fn resume(&self) -> bool {
        self.paused.send_if_modified(|paused| {
            if *paused {
                *paused = false;
                true
            } else {
                false
            }
        })
    }

    /// Current state.
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// A receiver that observes every transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }

    /// Waits until the gate reaches the given state. Returns immediately
    /// when already there. Callers bound the wait with `tokio::time::timeout`.
    pub async fn wait_for(&self, paused: bool) {
        let mut rx = self.subscribe();
        // The sender lives in self, so changed() cannot fail while we hold it.
        while *rx.borrow_and_update() != paused {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn starts_in_requested_state() {
        assert!(Gate::new(true).is_paused());
        assert!(!Gate::new(false).is_paused());
    }

    #[test]
    fn transitions_are_idempotent() {
        let gate = Gate::new(true);
        assert!(!gate.pause());
        assert!(gate.resume());
        assert!(!gate.resume());
        assert!(gate.pause());
        assert!(gate.is_paused());
    }

    #[tokio::test]
    async fn wait_for_current_state_returns_immediately() {
        let gate = Gate::new(true);
        timeout(Duration::from_millis(100), gate.wait_for(true))
            .await
            .expect("should not block");
    }

    #[tokio::test]
    async fn wait_for_observes_transition() {
        let gate = Arc::new(Gate::new(true));
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_for(false).await })
        };
        gate.resume();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn no_lost_wakeup_when_transition_precedes_wait() {
        let gate = Gate::new(true);
        gate.resume();
        timeout(Duration::from_millis(100), gate.wait_for(false))
            .await
            .expect("state already reached");
    }

    #[tokio::test]
    async fn subscribers_see_every_transition() {
        let gate = Gate::new(true);
        let mut rx = gate.subscribe();
        gate.resume();
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
        gate.pause();
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
    }
}
