//! Delivery worker pool.
//!
//! N workers share one [`DeliveryQueue`]. Each worker claims a job, makes one
//! delivery attempt and reports the outcome back to the queue, which owns
//! every state change.

use crate::config::{DispatchConfig, RetryPolicy};
use crate::metrics::DeliveryMetrics;
use crate::models::DeliveryJob;
use crate::processor::DeliveryProcessor;
use crate::queue::{DeliveryQueue, Transition};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Running set of delivery workers.
pub struct DeliveryWorkerPool {
    queue: Arc<DeliveryQueue>,
    shutdown: watch::Sender<bool>,
    workers: JoinSet<()>,
    worker_count: usize,
}

impl DeliveryWorkerPool {
    /// Spawn `config.worker_count` workers (at least one) on the current
    /// runtime.
    pub fn start(queue: Arc<DeliveryQueue>, processor: Arc<DeliveryProcessor>, config: &DispatchConfig) -> Self {
        let worker_count = config.worker_count.max(1);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let metrics = DeliveryMetrics::new(processor.transport_name());
        let mut workers = JoinSet::new();

        for worker_id in 0..worker_count {
            let worker = Worker {
                id: worker_id,
                queue: Arc::clone(&queue),
                processor: Arc::clone(&processor),
                retry: config.retry.clone(),
                metrics: metrics.clone(),
            };
            workers.spawn(worker.run(shutdown_rx.clone()));
        }

        info!(
            workers = worker_count,
            transport = processor.transport_name(),
            max_attempts = config.retry.max_attempts,
            "Delivery worker pool started"
        );

        Self {
            queue,
            shutdown,
            workers,
            worker_count,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Stop claiming, close the queue and wait for every worker. Sends in
    /// flight finish or hit the send timeout; unclaimed jobs stay queued.
    pub async fn shutdown(mut self) {
        info!("Shutting down delivery worker pool");
        let _ = self.shutdown.send(true);
        self.queue.close().await;

        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Delivery worker panicked");
            }
        }
        info!("Delivery worker pool stopped");
    }
}

struct Worker {
    id: usize,
    queue: Arc<DeliveryQueue>,
    processor: Arc<DeliveryProcessor>,
    retry: RetryPolicy,
    metrics: DeliveryMetrics,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = self.id, "Delivery worker started");

        while let Some(job) = self.queue.claim(&mut shutdown).await {
            self.process(job).await;
        }

        info!(worker_id = self.id, "Delivery worker stopped");
    }

    async fn process(&self, job: DeliveryJob) {
        let start = Instant::now();
        let transition = match self.processor.deliver(&job).await {
            Ok(()) => {
                self.metrics.job_sent(start.elapsed());
                Transition::Sent
            }
            Err(e) if e.is_retryable() && self.retry.allows_retry(job.attempts) => {
                let delay = self.retry.delay_for(job.attempts);
                warn!(
                    worker_id = self.id,
                    job_id = %job.id,
                    attempt = job.attempts,
                    max_attempts = self.retry.max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Delivery failed, will retry"
                );
                self.metrics.job_retried();
                Transition::Retry {
                    error: e.to_string(),
                    delay,
                }
            }
            Err(e) => {
                let reason = if e.is_retryable() { "exhausted" } else { "permanent" };
                error!(
                    worker_id = self.id,
                    job_id = %job.id,
                    attempt = job.attempts,
                    reason,
                    error = %e,
                    "Delivery failed"
                );
                self.metrics.job_failed(reason);
                Transition::Failed { error: e.to_string() }
            }
        };

        if let Err(e) = self.queue.transition(job.id, transition).await {
            error!(worker_id = self.id, job_id = %job.id, error = %e, "Failed to record delivery outcome");
        }
    }
}
