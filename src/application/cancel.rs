//! Cooperative cancellation flag.
//!
//! The ledger is the authority; a background task polls it and latches this
//! flag, which the CPU-bound filter loop and decision path read at their
//! checkpoints without touching the database. The flag is monotonic: once
//! set it stays set.

use crate::infrastructure::persistence::LedgerRepository;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Spawns the poller that mirrors the ledger's cancelled status into `flag`.
/// The returned handle may be aborted once the task finishes.
pub fn spawn_cancellation_poller(
    ledger: LedgerRepository,
    execution_id: String,
    flag: CancelFlag,
    poll_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        loop {
            interval.tick().await;
            match ledger.is_cancelled(&execution_id).await {
                Ok(true) => {
                    flag.set();
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Cancellation poll failed for {}: {}", execution_id, e);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_latches() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        flag.set();
        assert!(flag.is_cancelled());
        let clone = flag.clone();
        assert!(clone.is_cancelled());
    }
}
