use std::collections::HashMap;

use tokio::sync::{watch, Mutex};

/// Tracks the one allowed farming loop per nickname.
///
/// The registry owns the watch senders; each running loop holds the
/// receiver and polls it once per tick. Stopping flips the flag and
/// forgets the entry; the loop notices at its next wake-up, so stop
/// can lag by up to one tick period.
#[derive(Debug, Default)]
pub struct FarmRegistry {
    inner: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl FarmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a farming slot for `nick`. Returns the run flag for a fresh
    /// loop, or `None` when one is already live (second start is a no-op).
    /// The check-and-set happens under one lock, so two racing starts
    /// can't both get a receiver.
    pub async fn begin(&self, nick: &str) -> Option<watch::Receiver<bool>> {
        let mut m = self.inner.lock().await;
        if let Some(tx) = m.get(nick) {
            // A closed sender means the loop died without a stop command;
            // that slot is free to reclaim.
            if !tx.is_closed() && *tx.borrow() {
                return None;
            }
        }
        let (tx, rx) = watch::channel(true);
        m.insert(nick.to_string(), tx);
        Some(rx)
    }

    /// Signal the loop for `nick` to wind down. Returns false when there
    /// was nothing to stop.
    pub async fn stop(&self, nick: &str) -> bool {
        let mut m = self.inner.lock().await;
        match m.remove(nick) {
            Some(tx) => {
                let _ = tx.send(false);
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self, nick: &str) -> bool {
        let m = self.inner.lock().await;
        m.get(nick).is_some_and(|tx| !tx.is_closed() && *tx.borrow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_begin_is_a_noop() {
        let reg = FarmRegistry::new();
        let rx = reg.begin("Alice").await;
        assert!(rx.is_some());
        assert!(reg.begin("Alice").await.is_none());
        assert!(reg.is_running("Alice").await);
        // Different nicknames don't contend.
        assert!(reg.begin("Bob").await.is_some());
    }

    #[tokio::test]
    async fn stop_flips_the_flag_the_loop_polls() {
        let reg = FarmRegistry::new();
        let rx = reg.begin("Alice").await.unwrap();
        assert!(*rx.borrow());

        assert!(reg.stop("Alice").await);
        assert!(!*rx.borrow());
        assert!(!reg.is_running("Alice").await);
        // Nothing left to stop.
        assert!(!reg.stop("Alice").await);
    }

    #[tokio::test]
    async fn slot_is_reclaimable_after_stop_and_after_loop_death() {
        let reg = FarmRegistry::new();
        let rx = reg.begin("Alice").await.unwrap();
        reg.stop("Alice").await;
        assert!(reg.begin("Alice").await.is_some());

        // Simulate a loop that exited without a stop: drop the receiver.
        reg.stop("Alice").await;
        let rx2 = reg.begin("Alice").await.unwrap();
        drop(rx);
        drop(rx2);
        assert!(!reg.is_running("Alice").await);
        assert!(reg.begin("Alice").await.is_some());
    }
}
