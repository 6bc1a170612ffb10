//! Plain-text alert mail over SMTP.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use voc_core::{ChannelKind, ChannelTarget};

use super::{AlertNotice, NotificationChannel};
use crate::error::DeliveryError;

pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailChannel {
    /// Connects lazily to an SMTP relay at `host:port`.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::InvalidTarget`] if `from` is not a valid
    /// mailbox.
    pub fn new(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        from: &str,
        timeout: Duration,
    ) -> Result<Self, DeliveryError> {
        let from: Mailbox = from
            .parse()
            .map_err(|e| DeliveryError::InvalidTarget(format!("sender {from:?}: {e}")))?;
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(port)
            .timeout(Some(timeout));
        if let (Some(user), Some(pass)) = (username, password) {
            builder = builder.credentials(Credentials::new(user.to_string(), pass.to_string()));
        }
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    fn compose(&self, to: &str, notice: &AlertNotice) -> Result<Message, DeliveryError> {
        let to: Mailbox = to
            .parse()
            .map_err(|e| DeliveryError::InvalidTarget(format!("recipient {to:?}: {e}")))?;
        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(notice.subject())
            .header(ContentType::TEXT_PLAIN)
            .body(notice.text_body())
            .map_err(|e| DeliveryError::InvalidTarget(e.to_string()))
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(&self, target: &ChannelTarget, notice: &AlertNotice) -> Result<(), DeliveryError> {
        let ChannelTarget::Email { to } = target else {
            return Err(DeliveryError::InvalidTarget(format!(
                "email channel cannot deliver to {}",
                target.kind()
            )));
        };
        let message = self.compose(to, notice)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| DeliveryError::ChannelUnreachable(e.to_string()))?;
        tracing::debug!(event_id = notice.event_id, recipient = %to, "notify: email sent");
        Ok(())
    }
}
