//! Mail transport implementations.
//!
//! A transport hands an already-formatted RFC 5322 message to a relay. It
//! reports failures as either [`NotificationError::TransportTransient`] or
//! [`NotificationError::TransportPermanent`] so the worker pool can decide
//! whether to retry.
//!
//! [`NotificationError::TransportTransient`]: crate::error::NotificationError::TransportTransient
//! [`NotificationError::TransportPermanent`]: crate::error::NotificationError::TransportPermanent

mod recording;
mod smtp;

pub use recording::{RecordingTransport, SentMessage};
pub use smtp::{SmtpConfig, SmtpMailTransport};

use crate::error::NotificationResult;
use async_trait::async_trait;

/// Trait for outbound mail transports.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Send raw message bytes with the given envelope.
    async fn send(&self, from: &str, to: &[String], raw: &[u8]) -> NotificationResult<()>;

    /// Get the transport name for logging and metrics.
    fn name(&self) -> &'static str;

    /// Check if the transport can reach its relay.
    async fn health_check(&self) -> NotificationResult<bool>;
}
