use std::collections::HashMap;

use tokio::sync::Mutex;

/// Anti-replay token registry. A nonce may be registered at most once within
/// the TTL window; stale entries are pruned lazily on each registration
/// attempt, so the map is bounded by the volume of one window.
///
/// The TTL must match the signature freshness window: a nonce that has aged
/// out of this registry belongs to a timestamp that the verifier would
/// reject anyway.
pub struct NonceRegistry {
    ttl_ms: i64,
    seen: Mutex<HashMap<String, i64>>,
}

impl NonceRegistry {
    #[must_use]
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            ttl_ms,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl_ms(&self) -> i64 {
        self.ttl_ms
    }

    /// Returns false if the nonce was already seen within the TTL window.
    pub async fn register(&self, nonce: &str, now_ms: i64) -> bool {
        let mut seen = self.seen.lock().await;
        seen.retain(|_, seen_at| now_ms - *seen_at <= self.ttl_ms);

        if seen.contains_key(nonce) {
            return false;
        }

        seen.insert(nonce.to_string(), now_ms);
        true
    }
}
