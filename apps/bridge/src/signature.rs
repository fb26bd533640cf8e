use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::nonce::NonceRegistry;

pub(crate) type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const NONCE_HEADER: &str = "x-nonce";
pub const WORKSPACE_ID_HEADER: &str = "x-workspace-id";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing signature headers")]
    MissingHeaders,
    #[error("invalid timestamp")]
    InvalidTimestamp,
    #[error("timestamp outside allowed window")]
    StaleTimestamp,
    #[error("missing bridge secret")]
    NoSecret,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("nonce already used")]
    ReplayedNonce,
}

impl AuthError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingHeaders => "missing_signature_headers",
            Self::InvalidTimestamp => "invalid_timestamp",
            Self::StaleTimestamp => "stale_timestamp",
            Self::NoSecret => "missing_bridge_secret",
            Self::InvalidSignature => "invalid_signature",
            Self::ReplayedNonce => "nonce_replayed",
        }
    }
}

/// The signature headers of an inbound bridge request, as sent by the local
/// hook runner.
#[derive(Clone, Debug, Default)]
pub struct SignatureHeaders {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
    pub nonce: Option<String>,
    pub workspace_id: Option<String>,
}

impl SignatureHeaders {
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.to_string())
        };
        Self {
            signature: read(SIGNATURE_HEADER),
            timestamp: read(TIMESTAMP_HEADER),
            nonce: read(NONCE_HEADER),
            workspace_id: read(WORKSPACE_ID_HEADER),
        }
    }
}

/// Serializes the parsed request body back to the exact text the signer
/// hashed. Field order is preserved by the JSON parser, so signer and
/// verifier agree as long as both hash the same object. An absent body
/// canonicalizes as the empty object.
#[must_use]
pub fn canonical_body(body: Option<&Value>) -> String {
    body.map_or_else(|| "{}".to_string(), |value| value.to_string())
}

fn signed_payload(timestamp: &str, nonce: &str, canonical_body: &str) -> String {
    format!("{timestamp}:{nonce}:{canonical_body}")
}

/// Hex HMAC-SHA256 over `"{timestamp}:{nonce}:{canonical-json-body}"`. Used
/// by the verifier below and by anything that needs to sign a request the
/// same way the local hook runner does.
pub fn compute_signature(
    secret: &str,
    timestamp: &str,
    nonce: &str,
    canonical_body: &str,
) -> Result<String, AuthError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::NoSecret)?;
    mac.update(signed_payload(timestamp, nonce, canonical_body).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Validates an inbound request's HMAC signature, timestamp freshness and
/// nonce uniqueness. The freshness window is the nonce registry's TTL, so a
/// nonce can never outlive the window in which its timestamp would already
/// be rejected.
pub struct RequestAuthenticator {
    nonces: Arc<NonceRegistry>,
}

impl RequestAuthenticator {
    #[must_use]
    pub fn new(nonces: Arc<NonceRegistry>) -> Self {
        Self { nonces }
    }

    /// Checks run in a fixed order so the caller always learns the first
    /// failing precondition: headers, timestamp shape, freshness, secret,
    /// signature, nonce. The nonce is registered last; a request that fails
    /// any earlier check does not burn its nonce.
    pub async fn verify(
        &self,
        secret: Option<&str>,
        headers: &SignatureHeaders,
        body: Option<&Value>,
    ) -> Result<(), AuthError> {
        let (Some(signature), Some(timestamp), Some(nonce)) = (
            headers.signature.as_deref(),
            headers.timestamp.as_deref(),
            headers.nonce.as_deref(),
        ) else {
            return Err(AuthError::MissingHeaders);
        };

        let timestamp_ms = timestamp
            .parse::<i64>()
            .map_err(|_| AuthError::InvalidTimestamp)?;

        let now_ms = Utc::now().timestamp_millis();
        if (now_ms - timestamp_ms).abs() > self.nonces.ttl_ms() {
            return Err(AuthError::StaleTimestamp);
        }

        let secret = secret.ok_or(AuthError::NoSecret)?;

        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::NoSecret)?;
        mac.update(signed_payload(timestamp, nonce, &canonical_body(body)).as_bytes());
        let provided = hex::decode(signature).map_err(|_| AuthError::InvalidSignature)?;
        mac.verify_slice(&provided)
            .map_err(|_| AuthError::InvalidSignature)?;

        if !self.nonces.register(nonce, now_ms).await {
            return Err(AuthError::ReplayedNonce);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TTL_MS: i64 = 5 * 60 * 1000;

    fn authenticator() -> RequestAuthenticator {
        RequestAuthenticator::new(Arc::new(NonceRegistry::new(TTL_MS)))
    }

    fn signed_headers(secret: &str, nonce: &str, body: Option<&Value>) -> SignatureHeaders {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = compute_signature(secret, &timestamp, nonce, &canonical_body(body))
            .expect("signature computes");
        SignatureHeaders {
            signature: Some(signature),
            timestamp: Some(timestamp),
            nonce: Some(nonce.to_string()),
            workspace_id: None,
        }
    }

    #[tokio::test]
    async fn accepts_a_freshly_signed_request() {
        let auth = authenticator();
        let body = json!({"run_id": "r1", "event_type": "RUN_STARTED"});
        let headers = signed_headers("secret", "nonce-1", Some(&body));
        assert_eq!(auth.verify(Some("secret"), &headers, Some(&body)).await, Ok(()));
    }

    #[tokio::test]
    async fn rejects_when_any_header_is_missing() {
        let auth = authenticator();
        let mut headers = signed_headers("secret", "nonce-1", None);
        headers.nonce = None;
        assert_eq!(
            auth.verify(Some("secret"), &headers, None).await,
            Err(AuthError::MissingHeaders)
        );
    }

    #[tokio::test]
    async fn rejects_a_non_numeric_timestamp() {
        let auth = authenticator();
        let mut headers = signed_headers("secret", "nonce-1", None);
        headers.timestamp = Some("yesterday".to_string());
        assert_eq!(
            auth.verify(Some("secret"), &headers, None).await,
            Err(AuthError::InvalidTimestamp)
        );
    }

    #[tokio::test]
    async fn rejects_a_timestamp_outside_the_window() {
        let auth = authenticator();
        let timestamp = (Utc::now().timestamp_millis() - TTL_MS - 1_000).to_string();
        let signature = compute_signature("secret", &timestamp, "nonce-1", "{}")
            .expect("signature computes");
        let headers = SignatureHeaders {
            signature: Some(signature),
            timestamp: Some(timestamp),
            nonce: Some("nonce-1".to_string()),
            workspace_id: None,
        };
        assert_eq!(
            auth.verify(Some("secret"), &headers, None).await,
            Err(AuthError::StaleTimestamp)
        );
    }

    #[tokio::test]
    async fn rejects_when_no_secret_resolves() {
        let auth = authenticator();
        let headers = signed_headers("secret", "nonce-1", None);
        assert_eq!(
            auth.verify(None, &headers, None).await,
            Err(AuthError::NoSecret)
        );
    }

    #[tokio::test]
    async fn rejects_equal_length_and_truncated_signatures() {
        let auth = authenticator();
        let mut headers = signed_headers("secret", "nonce-1", None);

        let tampered = headers
            .signature
            .as_deref()
            .map(|sig| {
                let replacement = if sig.starts_with('0') { "1" } else { "0" };
                format!("{replacement}{}", &sig[1..])
            })
            .expect("signature present");
        headers.signature = Some(tampered);
        assert_eq!(
            auth.verify(Some("secret"), &headers, None).await,
            Err(AuthError::InvalidSignature)
        );

        headers.signature = Some("deadbeef".to_string());
        assert_eq!(
            auth.verify(Some("secret"), &headers, None).await,
            Err(AuthError::InvalidSignature)
        );

        headers.signature = Some("not-hex".to_string());
        assert_eq!(
            auth.verify(Some("secret"), &headers, None).await,
            Err(AuthError::InvalidSignature)
        );
    }

    #[tokio::test]
    async fn rejects_a_replayed_nonce() {
        let auth = authenticator();
        let headers = signed_headers("secret", "nonce-1", None);
        assert_eq!(auth.verify(Some("secret"), &headers, None).await, Ok(()));

        // A fresh signature over the same nonce still counts as a replay.
        let headers = signed_headers("secret", "nonce-1", None);
        assert_eq!(
            auth.verify(Some("secret"), &headers, None).await,
            Err(AuthError::ReplayedNonce)
        );
    }

    #[tokio::test]
    async fn a_failed_signature_does_not_burn_the_nonce() {
        let auth = authenticator();
        let mut headers = signed_headers("secret", "nonce-1", None);
        headers.signature = Some("deadbeef".to_string());
        assert_eq!(
            auth.verify(Some("secret"), &headers, None).await,
            Err(AuthError::InvalidSignature)
        );

        let headers = signed_headers("secret", "nonce-1", None);
        assert_eq!(auth.verify(Some("secret"), &headers, None).await, Ok(()));
    }

    #[test]
    fn canonical_body_defaults_to_the_empty_object() {
        assert_eq!(canonical_body(None), "{}");
        let body = json!({"b": 1, "a": 2});
        // Parser order is preserved, not sorted.
        assert_eq!(canonical_body(Some(&body)), "{\"b\":1,\"a\":2}");
    }
}
