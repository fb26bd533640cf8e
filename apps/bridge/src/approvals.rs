use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::store::{ApprovalUpdate, RecordStore, StoreError};
use crate::types::{Approval, ApprovalDecision, ApprovalStatus};
use crate::waiter::DecisionWaiters;

/// One-way digest of a working directory path. Only the digest is ever
/// stored or shown; the raw path never leaves the caller's machine.
#[must_use]
pub fn hash_cwd(cwd: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cwd.as_bytes());
    hex::encode(hasher.finalize())
}

/// Builds a fresh PENDING approval for a command the local runner wants
/// cleared by a human.
#[must_use]
pub fn new_command_approval(run_id: &str, command: &str, cwd: &str) -> Approval {
    Approval {
        id: Uuid::new_v4().to_string(),
        run_id: run_id.to_string(),
        status: ApprovalStatus::Pending,
        kind: "COMMAND".to_string(),
        command: command.to_string(),
        cwd_hash: hash_cwd(cwd),
        note: None,
        requested_at: Utc::now(),
        decided_at: None,
        decided_by_device_id: None,
    }
}

#[derive(Clone, Debug)]
pub struct DecideApproval {
    pub approval_id: String,
    pub decision: ApprovalDecision,
    pub note: Option<String>,
    pub decided_by_device_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionOutcome {
    pub status: ApprovalStatus,
    pub note: Option<String>,
}

/// Applies a human decision. PENDING is the only state this transitions
/// out of: deciding an already-terminal approval is an idempotent no-op
/// that returns the existing record, so a duplicate or conflicting retry
/// can never overwrite the first decision. On a real transition the
/// update is persisted and every suspended waiter is woken before the
/// caller gets its answer.
pub async fn decide(
    store: &dyn RecordStore,
    waiters: &DecisionWaiters,
    request: DecideApproval,
) -> Result<Option<DecisionOutcome>, StoreError> {
    let Some(approval) = store.get_approval(&request.approval_id).await? else {
        return Ok(None);
    };

    if approval.status.is_terminal() {
        return Ok(Some(DecisionOutcome {
            status: approval.status,
            note: approval.note,
        }));
    }

    let update = ApprovalUpdate {
        status: Some(request.decision.terminal_status()),
        note: request.note.or(approval.note),
        decided_at: Some(Utc::now()),
        decided_by_device_id: request.decided_by_device_id,
    };

    let Some(updated) = store.update_approval(&request.approval_id, update).await? else {
        return Ok(None);
    };

    waiters.notify(&updated).await;

    Ok(Some(DecisionOutcome {
        status: updated.status,
        note: updated.note,
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::MemoryStore;

    async fn seeded_store() -> (MemoryStore, String) {
        let store = MemoryStore::new();
        let approval = new_command_approval("run-1", "rm -rf target", "/home/dev/project");
        let id = approval.id.clone();
        store.create_approval(approval).await.expect("create");
        (store, id)
    }

    #[tokio::test]
    async fn decision_transitions_pending_and_stamps_the_record() {
        let (store, id) = seeded_store().await;
        let waiters = DecisionWaiters::new();

        let outcome = decide(
            &store,
            &waiters,
            DecideApproval {
                approval_id: id.clone(),
                decision: ApprovalDecision::Approve,
                note: Some("looks safe".to_string()),
                decided_by_device_id: Some("device-1".to_string()),
            },
        )
        .await
        .expect("decide")
        .expect("found");

        assert_eq!(outcome.status, ApprovalStatus::Approved);
        assert_eq!(outcome.note.as_deref(), Some("looks safe"));

        let stored = store.get_approval(&id).await.expect("get").expect("present");
        assert!(stored.decided_at.is_some());
        assert_eq!(stored.decided_by_device_id.as_deref(), Some("device-1"));
    }

    #[tokio::test]
    async fn deciding_twice_keeps_the_first_outcome() {
        let (store, id) = seeded_store().await;
        let waiters = DecisionWaiters::new();

        let first = decide(
            &store,
            &waiters,
            DecideApproval {
                approval_id: id.clone(),
                decision: ApprovalDecision::Approve,
                note: Some("first".to_string()),
                decided_by_device_id: None,
            },
        )
        .await
        .expect("decide")
        .expect("found");
        assert_eq!(first.status, ApprovalStatus::Approved);

        let second = decide(
            &store,
            &waiters,
            DecideApproval {
                approval_id: id.clone(),
                decision: ApprovalDecision::Deny,
                note: Some("second".to_string()),
                decided_by_device_id: Some("device-2".to_string()),
            },
        )
        .await
        .expect("decide")
        .expect("found");

        assert_eq!(second.status, ApprovalStatus::Approved);
        assert_eq!(second.note.as_deref(), Some("first"));

        let stored = store.get_approval(&id).await.expect("get").expect("present");
        assert_eq!(stored.status, ApprovalStatus::Approved);
        assert_eq!(stored.decided_by_device_id, None);
    }

    #[tokio::test]
    async fn unknown_approval_is_reported_as_not_found() {
        let store = MemoryStore::new();
        let waiters = DecisionWaiters::new();
        let outcome = decide(
            &store,
            &waiters,
            DecideApproval {
                approval_id: "appr-missing".to_string(),
                decision: ApprovalDecision::Deny,
                note: None,
                decided_by_device_id: None,
            },
        )
        .await
        .expect("decide");
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn decision_wakes_a_suspended_waiter() {
        let (store, id) = seeded_store().await;
        let waiters = std::sync::Arc::new(DecisionWaiters::new());

        let waiting = tokio::spawn({
            let waiters = waiters.clone();
            let id = id.clone();
            async move { waiters.wait(&id, Duration::from_secs(5)).await }
        });
        while waiters.registered(&id).await < 1 {
            tokio::task::yield_now().await;
        }

        decide(
            &store,
            &waiters,
            DecideApproval {
                approval_id: id,
                decision: ApprovalDecision::Deny,
                note: None,
                decided_by_device_id: None,
            },
        )
        .await
        .expect("decide")
        .expect("found");

        let woken = waiting.await.expect("join").expect("notified");
        assert_eq!(woken.status, ApprovalStatus::Denied);
    }

    #[test]
    fn cwd_hash_is_a_stable_sha256_digest() {
        let digest = hash_cwd("/home/dev/project");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, hash_cwd("/home/dev/project"));
        assert_ne!(digest, hash_cwd("/home/dev/other"));
        // The raw path must not survive into the stored form.
        assert!(!digest.contains("home"));
    }
}
