//! Generic JSON webhook with HMAC-SHA256 body signatures.
//!
//! Every body is an [`EventEnvelope`]. Receivers verify
//! `X-Voc-Signature: sha256=<hex>` by recomputing the MAC over the raw
//! request body with the shared secret.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use voc_core::{ChannelKind, ChannelTarget, SubscriberEvent};

use super::{AlertNotice, EventEnvelope, NotificationChannel};
use crate::error::DeliveryError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Voc-Signature";
/// Id of the alert event or insight the body describes.
pub const EVENT_HEADER: &str = "X-Voc-Event";
pub const EVENT_TYPE_HEADER: &str = "X-Voc-Event-Type";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const SIGNATURE_PREFIX: &str = "sha256=";

fn mac(secret: &str) -> HmacSha256 {
    HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length")
}

/// Signature header value for `body`: `sha256=<hex>`.
#[must_use]
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = mac(secret);
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Check a received signature header against `body` in constant time.
#[must_use]
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let mut mac = mac(secret);
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub struct WebhookChannel {
    client: reqwest::Client,
    secret: Option<String>,
}

impl WebhookChannel {
    /// # Errors
    ///
    /// Returns [`DeliveryError::ChannelUnreachable`] if the HTTP client
    /// cannot be built.
    pub fn new(secret: Option<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        if secret.is_none() {
            tracing::warn!("notify: webhook secret not set, payloads will be unsigned");
        }
        Ok(Self { client, secret })
    }

    /// POST one envelope to `url`. One call is one attempt.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::ChannelUnreachable`] on transport failure and
    /// [`DeliveryError::Rejected`] for a non-2xx response.
    pub async fn post_event<T: Serialize + Sync>(
        &self,
        url: &str,
        event_type: SubscriberEvent,
        id: i64,
        data: &T,
    ) -> Result<(), DeliveryError> {
        let envelope = EventEnvelope {
            event_type,
            timestamp: Utc::now(),
            data,
        };
        let body = serde_json::to_vec(&envelope)
            .map_err(|e| DeliveryError::InvalidTarget(format!("unserializable {event_type}: {e}")))?;

        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(EVENT_HEADER, id.to_string())
            .header(EVENT_TYPE_HEADER, event_type.as_str());
        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, sign_payload(secret, &body));
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
            });
        }
        tracing::debug!(id, %url, %event_type, "notify: webhook delivered");
        Ok(())
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn send(&self, target: &ChannelTarget, notice: &AlertNotice) -> Result<(), DeliveryError> {
        let ChannelTarget::Webhook { url } = target else {
            return Err(DeliveryError::InvalidTarget(format!(
                "webhook channel cannot deliver to {}",
                target.kind()
            )));
        };
        self.post_event(url, SubscriberEvent::AlertTriggered, notice.event_id, notice)
            .await
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::notify::testing::notice;

    #[test]
    fn signature_round_trips_and_rejects_tampering() {
        let body = br#"{"event_id":42}"#;
        let sig = sign_payload("s3cret", body);

        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        assert!(verify_signature("s3cret", body, &sig));
        assert!(!verify_signature("other", body, &sig));
        assert!(!verify_signature("s3cret", br#"{"event_id":43}"#, &sig));
        assert!(!verify_signature("s3cret", body, "md5=abc"));
    }

    #[tokio::test]
    async fn posts_signed_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/voc"))
            .and(header(EVENT_HEADER, "42"))
            .and(header(EVENT_TYPE_HEADER, "alert.triggered"))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        let channel = WebhookChannel::new(Some("s3cret".to_string()), DEFAULT_TIMEOUT).unwrap();
        let target = ChannelTarget::Webhook {
            url: format!("{}/hooks/voc", server.uri()),
        };

        channel.send(&target, &notice()).await.unwrap();

        let received = &server.received_requests().await.unwrap()[0];
        let sig = received
            .headers
            .get(SIGNATURE_HEADER)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(verify_signature("s3cret", &received.body, sig));
        let json: serde_json::Value = serde_json::from_slice(&received.body).unwrap();
        assert_eq!(json["event_type"], "alert.triggered");
        assert_eq!(json["data"]["severity"], "high");
        assert_eq!(json["data"]["primary_insight"]["id"], 11);
    }

    #[tokio::test]
    async fn error_status_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let channel = WebhookChannel::new(None, DEFAULT_TIMEOUT).unwrap();
        let target = ChannelTarget::Webhook { url: server.uri() };

        let err = channel.send(&target, &notice()).await.unwrap_err();

        assert_eq!(err, DeliveryError::Rejected { status: 503 });
    }

    #[tokio::test]
    async fn wrong_target_kind_is_invalid() {
        let channel = WebhookChannel::new(None, DEFAULT_TIMEOUT).unwrap();
        let target = ChannelTarget::Email {
            to: "ops@example.com".to_string(),
        };

        let err = channel.send(&target, &notice()).await.unwrap_err();

        assert!(matches!(err, DeliveryError::InvalidTarget(_)));
    }
}
