use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{RecordStore, StoreError};
use crate::types::{Device, Platform, Workspace};

#[derive(Clone, Debug)]
struct PairTokenRecord {
    machine_id: String,
    workspace_fingerprint: String,
    display_name: String,
    expires_at_ms: i64,
}

/// What a consumed pair token vouches for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairClaim {
    pub machine_id: String,
    pub workspace_fingerprint: String,
    pub display_name: String,
}

/// One-time pairing tokens. These are ephemeral handshake state like
/// nonces, so they live in process memory even when a durable record store
/// is configured: a token that dies with the process just means the CLI
/// re-runs pairing.
pub struct PairTokenTable {
    ttl_ms: i64,
    tokens: Mutex<HashMap<String, PairTokenRecord>>,
}

impl PairTokenTable {
    #[must_use]
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            ttl_ms,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Issues a fresh single-use token. Returns the token and its expiry.
    pub async fn issue(
        &self,
        machine_id: &str,
        workspace_fingerprint: &str,
        display_name: &str,
    ) -> (String, DateTime<Utc>) {
        let now_ms = Utc::now().timestamp_millis();
        let expires_at_ms = now_ms + self.ttl_ms;
        let token = Uuid::new_v4().to_string();

        self.tokens.lock().await.insert(
            token.clone(),
            PairTokenRecord {
                machine_id: machine_id.to_string(),
                workspace_fingerprint: workspace_fingerprint.to_string(),
                display_name: display_name.to_string(),
                expires_at_ms,
            },
        );

        let expires_at = Utc
            .timestamp_millis_opt(expires_at_ms)
            .single()
            .unwrap_or_else(Utc::now);
        (token, expires_at)
    }

    /// Consumes a token: removes it and returns its claim, or `None` when
    /// the token is unknown or expired. Expired entries are pruned lazily
    /// here, the same way the nonce registry prunes on registration.
    pub async fn consume(&self, token: &str) -> Option<PairClaim> {
        let now_ms = Utc::now().timestamp_millis();
        let mut tokens = self.tokens.lock().await;
        tokens.retain(|_, record| record.expires_at_ms > now_ms);

        let record = tokens.remove(token)?;
        Some(PairClaim {
            machine_id: record.machine_id,
            workspace_fingerprint: record.workspace_fingerprint,
            display_name: record.display_name,
        })
    }
}

/// Finishes pairing: mints the device and its workspace, including the
/// workspace's fresh bridge secret. The secret is returned to the caller
/// exactly once, in the completion response.
pub async fn complete_pairing(
    store: &dyn RecordStore,
    claim: PairClaim,
    platform: Platform,
    push_token: &str,
) -> Result<(Device, Workspace), StoreError> {
    let now = Utc::now();

    let device = store
        .create_device(Device {
            id: Uuid::new_v4().to_string(),
            platform,
            push_token: push_token.to_string(),
            created_at: now,
            updated_at: now,
        })
        .await?;

    let workspace = store
        .create_workspace(Workspace {
            id: Uuid::new_v4().to_string(),
            device_id: device.id.clone(),
            machine_id: claim.machine_id,
            display_name: claim.display_name,
            project_fingerprint: claim.workspace_fingerprint,
            bridge_secret: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
        })
        .await?;

    Ok((device, workspace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn tokens_are_single_use() {
        let table = PairTokenTable::new(60_000);
        let (token, _expires_at) = table.issue("machine-1", "fp-1", "laptop").await;

        let claim = table.consume(&token).await.expect("first consume");
        assert_eq!(claim.machine_id, "machine-1");
        assert_eq!(claim.workspace_fingerprint, "fp-1");

        assert!(table.consume(&token).await.is_none());
    }

    #[tokio::test]
    async fn expired_tokens_are_rejected() {
        let table = PairTokenTable::new(0);
        let (token, _expires_at) = table.issue("machine-1", "fp-1", "laptop").await;
        assert!(table.consume(&token).await.is_none());
    }

    #[tokio::test]
    async fn unknown_tokens_are_rejected() {
        let table = PairTokenTable::new(60_000);
        assert!(table.consume("not-a-token").await.is_none());
    }

    #[tokio::test]
    async fn completion_links_workspace_to_device_with_a_fresh_secret() {
        let store = MemoryStore::new();
        let (device, workspace) = complete_pairing(
            &store,
            PairClaim {
                machine_id: "machine-1".to_string(),
                workspace_fingerprint: "fp-1".to_string(),
                display_name: "laptop".to_string(),
            },
            Platform::Android,
            "push-token-1",
        )
        .await
        .expect("pairing completes");

        assert_eq!(workspace.device_id, device.id);
        assert!(!workspace.bridge_secret.is_empty());
        assert_ne!(workspace.bridge_secret, workspace.id);

        let stored = store
            .get_workspace(&workspace.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.bridge_secret, workspace.bridge_secret);
        let stored_device = store
            .get_device(&device.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored_device.push_token, "push-token-1");
    }
}
