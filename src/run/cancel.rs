//! Cooperative cancellation for runs
//!
//! `cancel_run` trips the token; the run driver checks it before starting
//! each task unit and units check it between batches. Nothing in flight is
//! aborted: work already persisted stays persisted.

use std::sync::Arc;
use tokio::sync::watch;

/// Run-scoped cancellation flag shared by the driver, its units and the
/// orchestrator's active-run registry.
///
/// Besides polling, the driver can await [`cancelled`](Self::cancelled)
/// while it waits for a free worker slot.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    tripped: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tripped: Arc::new(tx) }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tripped.borrow()
    }

    /// Trip the token. Returns `true` only for the call that tripped it.
    pub fn cancel(&self) -> bool {
        self.tripped.send_if_modified(|tripped| {
            if *tripped {
                false
            } else {
                *tripped = true;
                true
            }
        })
    }

    /// Resolves once the token is tripped; immediately if it already is.
    pub async fn cancelled(&self) {
        let mut rx = self.tripped.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|tripped| *tripped).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn second_cancel_reports_no_change() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
    }

    #[test]
    fn clones_observe_the_same_run() {
        let token = CancellationToken::new();
        let registry_copy = token.clone();
        registry_copy.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn waiter_wakes_on_cancel_from_another_task() {
        let token = CancellationToken::new();
        let remote = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.cancel();
        });
        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .expect("cancelled() resolves after cancel");
    }

    #[tokio::test]
    async fn already_tripped_token_resolves_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancelled().await;
    }
}
