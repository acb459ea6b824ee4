//! Delivery metrics.
//!
//! Recorded through the `metrics` facade; without an installed recorder the
//! calls are no-ops.

use metrics::{counter, histogram};
use std::time::Duration;

/// Metrics helper labelled with the transport that sends the messages.
#[derive(Debug, Clone)]
pub struct DeliveryMetrics {
    transport: String,
}

impl DeliveryMetrics {
    pub fn new(transport: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
        }
    }

    /// Record jobs handed to the queue by a dispatch.
    pub fn jobs_enqueued(count: usize) {
        counter!("notifications_jobs_enqueued_total").increment(count as u64);
    }

    /// Record a delivered message and how long the send took.
    pub fn job_sent(&self, duration: Duration) {
        counter!(
            "notifications_jobs_sent_total",
            "transport" => self.transport.clone()
        )
        .increment(1);

        histogram!(
            "notifications_send_duration_seconds",
            "transport" => self.transport.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn job_retried(&self) {
        counter!(
            "notifications_jobs_retried_total",
            "transport" => self.transport.clone()
        )
        .increment(1);
    }

    /// Record a job that reached `failed`. `reason` is `permanent` or
    /// `exhausted`.
    pub fn job_failed(&self, reason: &'static str) {
        counter!(
            "notifications_jobs_failed_total",
            "transport" => self.transport.clone(),
            "reason" => reason
        )
        .increment(1);
    }
}
