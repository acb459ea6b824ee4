//! Delivery processor.
//!
//! Turns a [`DeliveryJob`] into an RFC 5322 message and hands it to the
//! configured [`MailTransport`]. Retry decisions belong to the worker pool.

use crate::error::{NotificationError, NotificationResult};
use crate::models::DeliveryJob;
use crate::providers::MailTransport;
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::Message;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

type HeaderResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// `X-CF-Client-ID`: client that sent the notification.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ClientIdHeader(String);

impl Header for ClientIdHeader {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-CF-Client-ID")
    }

    fn parse(s: &str) -> HeaderResult<Self> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// `X-CF-Notification-ID`: the notification id returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NotificationIdHeader(String);

impl Header for NotificationIdHeader {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-CF-Notification-ID")
    }

    fn parse(s: &str) -> HeaderResult<Self> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// Builds and sends the message for a single delivery job.
pub struct DeliveryProcessor {
    transport: Arc<dyn MailTransport>,
    sender: String,
    send_timeout: Duration,
}

impl DeliveryProcessor {
    pub fn new(transport: Arc<dyn MailTransport>, sender: impl Into<String>, send_timeout: Duration) -> Self {
        Self {
            transport,
            sender: sender.into(),
            send_timeout,
        }
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Formatted message bytes for a job.
    pub fn build_message(&self, job: &DeliveryJob) -> NotificationResult<Vec<u8>> {
        let to_address = job.recipient.email.as_deref().ok_or_else(|| {
            NotificationError::TransportPermanent(format!(
                "Recipient {} has no email address",
                job.recipient.id
            ))
        })?;

        let from: Mailbox = self.sender.parse()?;
        let to: Mailbox = to_address.parse()?;

        let mut builder = Message::builder()
            .from(from)
            .to(to)
            .subject(job.message.subject.as_str())
            .header(ClientIdHeader(job.client_id.clone()))
            .header(NotificationIdHeader(job.id.to_string()));

        if let Some(reply_to) = &job.reply_to {
            let reply_to: Mailbox = reply_to.parse()?;
            builder = builder.reply_to(reply_to);
        }

        let message = match (&job.message.text, &job.message.html) {
            (Some(text), Some(html)) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html.clone()),
                    ),
            )?,
            (Some(text), None) => builder.header(ContentType::TEXT_PLAIN).body(text.clone())?,
            (None, Some(html)) => builder.header(ContentType::TEXT_HTML).body(html.clone())?,
            (None, None) => return Err(NotificationError::EmptyBody),
        };

        Ok(message.formatted())
    }

    /// One delivery attempt. A send that outlives the timeout is transient.
    pub async fn deliver(&self, job: &DeliveryJob) -> NotificationResult<()> {
        let raw = self.build_message(job)?;
        let to = vec![job.recipient.email.clone().unwrap_or_default()];
        let envelope_from = self
            .sender
            .parse::<Mailbox>()
            .map(|mailbox| mailbox.email.to_string())?;

        debug!(
            job_id = %job.id,
            to = %to[0],
            attempt = job.attempts,
            transport = self.transport.name(),
            "Delivering message"
        );

        match tokio::time::timeout(self.send_timeout, self.transport.send(&envelope_from, &to, &raw)).await {
            Ok(Ok(())) => {
                info!(job_id = %job.id, campaign_id = %job.campaign_id, to = %to[0], "Message delivered");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(NotificationError::TransportTransient(format!(
                "Send timed out after {:?}",
                self.send_timeout
            ))),
        }
    }
}
