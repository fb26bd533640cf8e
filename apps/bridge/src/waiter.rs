use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};

use crate::types::Approval;

struct RegisteredWaiter {
    token: u64,
    sender: oneshot::Sender<Approval>,
}

/// Fan-out point between the decision endpoint and suspended long-poll
/// callers. Each wait registers a one-shot completion handle under the
/// approval id; a decision drains and wakes every handle for that id.
///
/// The timeout and notify paths race for each handle: notify removes the
/// whole entry under the lock, a fired timeout removes only its own token.
/// Whichever runs second finds nothing to remove, so exactly one of the two
/// outcomes wins per waiter.
pub struct DecisionWaiters {
    next_token: AtomicU64,
    waiters: Mutex<HashMap<String, Vec<RegisteredWaiter>>>,
}

impl DecisionWaiters {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(0),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Suspends the caller until a decision for `approval_id` is posted or
    /// the timeout elapses. Timeout is a normal outcome: the caller gets
    /// `None` and the registration is gone.
    ///
    /// Callers must check the approval's current status before waiting; a
    /// decision committed before registration will never notify.
    pub async fn wait(&self, approval_id: &str, timeout: Duration) -> Option<Approval> {
        let (sender, receiver) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        {
            let mut waiters = self.waiters.lock().await;
            waiters
                .entry(approval_id.to_string())
                .or_default()
                .push(RegisteredWaiter { token, sender });
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(approval)) => Some(approval),
            // Elapsed, or the sender side was dropped; either way this
            // registration is dead and must not linger in the registry.
            Ok(Err(_)) | Err(_) => {
                self.deregister(approval_id, token).await;
                None
            }
        }
    }

    /// Wakes every waiter registered for this approval, each receiving the
    /// same record. Safe to call with no waiters registered.
    pub async fn notify(&self, approval: &Approval) {
        let drained = { self.waiters.lock().await.remove(&approval.id) };
        let Some(drained) = drained else {
            return;
        };
        for waiter in drained {
            // The receiver may have timed out between the drain and this
            // send; that waiter already returned None on its own.
            let _ = waiter.sender.send(approval.clone());
        }
    }

    async fn deregister(&self, approval_id: &str, token: u64) {
        let mut waiters = self.waiters.lock().await;
        if let Some(registered) = waiters.get_mut(approval_id) {
            registered.retain(|waiter| waiter.token != token);
            if registered.is_empty() {
                waiters.remove(approval_id);
            }
        }
    }

    pub async fn registered(&self, approval_id: &str) -> usize {
        self.waiters
            .lock()
            .await
            .get(approval_id)
            .map_or(0, Vec::len)
    }
}

impl Default for DecisionWaiters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use chrono::Utc;

    use super::*;
    use crate::types::{Approval, ApprovalStatus};

    fn decided_approval(id: &str) -> Approval {
        Approval {
            id: id.to_string(),
            run_id: "run-1".to_string(),
            status: ApprovalStatus::Approved,
            kind: "COMMAND".to_string(),
            command: "rm -rf target".to_string(),
            cwd_hash: "abc".to_string(),
            note: Some("ok".to_string()),
            requested_at: Utc::now(),
            decided_at: Some(Utc::now()),
            decided_by_device_id: None,
        }
    }

    #[tokio::test]
    async fn notify_wakes_every_registered_waiter() {
        let waiters = Arc::new(DecisionWaiters::new());

        let first = tokio::spawn({
            let waiters = waiters.clone();
            async move { waiters.wait("appr-1", Duration::from_secs(5)).await }
        });
        let second = tokio::spawn({
            let waiters = waiters.clone();
            async move { waiters.wait("appr-1", Duration::from_secs(5)).await }
        });

        while waiters.registered("appr-1").await < 2 {
            tokio::task::yield_now().await;
        }

        waiters.notify(&decided_approval("appr-1")).await;

        let first = first.await.expect("join").expect("notified");
        let second = second.await.expect("join").expect("notified");
        assert_eq!(first.status, ApprovalStatus::Approved);
        assert_eq!(first.note, second.note);
        assert_eq!(waiters.registered("appr-1").await, 0);
    }

    #[tokio::test]
    async fn timeout_returns_none_at_or_after_the_deadline_and_deregisters() {
        let waiters = Arc::new(DecisionWaiters::new());

        let started = Instant::now();
        let outcome = waiters.wait("appr-1", Duration::from_millis(100)).await;
        assert!(outcome.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(waiters.registered("appr-1").await, 0);

        // A late decision after the timeout is a no-op.
        waiters.notify(&decided_approval("appr-1")).await;
    }

    #[tokio::test]
    async fn notify_without_waiters_is_a_no_op() {
        let waiters = DecisionWaiters::new();
        waiters.notify(&decided_approval("appr-unseen")).await;
        assert_eq!(waiters.registered("appr-unseen").await, 0);
    }

    #[tokio::test]
    async fn waiters_for_other_approvals_are_untouched() {
        let waiters = Arc::new(DecisionWaiters::new());

        let other = tokio::spawn({
            let waiters = waiters.clone();
            async move { waiters.wait("appr-other", Duration::from_millis(500)).await }
        });

        while waiters.registered("appr-other").await < 1 {
            tokio::task::yield_now().await;
        }

        waiters.notify(&decided_approval("appr-1")).await;
        assert_eq!(waiters.registered("appr-other").await, 1);

        assert!(other.await.expect("join").is_none());
    }
}
