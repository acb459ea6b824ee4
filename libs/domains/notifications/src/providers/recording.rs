//! In-process transport that records messages instead of sending them.
//!
//! Used for local development and tests. Failure modes can be scripted to
//! exercise the retry path.

use super::MailTransport;
use crate::error::{NotificationError, NotificationResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// A message captured by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub from: String,
    pub to: Vec<String>,
    pub raw: Vec<u8>,
}

impl SentMessage {
    /// Raw message as text, for assertions.
    pub fn body(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }
}

#[derive(Debug, Clone)]
enum Failure {
    None,
    Transient(String),
    Permanent(String),
    /// Fail transiently for the first N calls, then succeed.
    FirstN(u32),
}

/// Transport that captures sent messages.
#[derive(Clone)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<SentMessage>>>,
    calls: Arc<AtomicU32>,
    failure: Failure,
    delay: Option<Duration>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicU32::new(0)),
            failure: Failure::None,
            delay: None,
        }
    }

    /// Every send fails with a retryable error.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Failure::Transient(message.into()),
            ..Self::new()
        }
    }

    /// Every send is rejected outright.
    pub fn rejecting(message: impl Into<String>) -> Self {
        Self {
            failure: Failure::Permanent(message.into()),
            ..Self::new()
        }
    }

    /// The first `failures` sends fail transiently.
    pub fn flaky(failures: u32) -> Self {
        Self {
            failure: Failure::FirstN(failures),
            ..Self::new()
        }
    }

    /// Wait before answering each send.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn sent_messages(&self) -> Vec<SentMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    pub async fn was_sent_to(&self, address: &str) -> bool {
        self.sent
            .lock()
            .await
            .iter()
            .any(|m| m.to.iter().any(|to| to == address))
    }

    /// Number of send calls, successful or not.
    pub fn attempts(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, from: &str, to: &[String], raw: &[u8]) -> NotificationResult<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.failure {
            Failure::Transient(message) => {
                return Err(NotificationError::TransportTransient(message.clone()));
            }
            Failure::Permanent(message) => {
                return Err(NotificationError::TransportPermanent(message.clone()));
            }
            Failure::FirstN(n) if call <= *n => {
                return Err(NotificationError::TransportTransient(format!(
                    "scripted failure {} of {}",
                    call, n
                )));
            }
            _ => {}
        }

        debug!(to = ?to, call, "Recorded message");
        self.sent.lock().await.push(SentMessage {
            from: from.to_string(),
            to: to.to_vec(),
            raw: raw.to_vec(),
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }

    async fn health_check(&self) -> NotificationResult<bool> {
        Ok(!matches!(self.failure, Failure::Permanent(_)))
    }
}
