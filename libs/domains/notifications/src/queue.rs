//! Delivery queue.
//!
//! Owns every [`DeliveryJob`] and every campaign's [`CampaignTracker`]. All
//! state lives behind one lock, so claims and transitions are atomic with
//! respect to each other and to status reads:
//!
//! - only `Queued`/`Retrying` jobs are claimable, and a claim moves the job
//!   to `Sending` before the lock is released;
//! - transitions are accepted only from `Sending`;
//! - a retried job sits in a delay heap until its backoff elapses.

use crate::error::{NotificationError, NotificationResult};
use crate::models::{Campaign, CampaignStatus, DeliveryJob, JobState};
use crate::status::{Bucket, CampaignTracker};
use chrono::Utc;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Outcome of a delivery attempt, applied to a job in `Sending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Sent,
    /// Make the job claimable again after `delay`.
    Retry { error: String, delay: Duration },
    Failed { error: String },
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, DeliveryJob>,
    ready: VecDeque<Uuid>,
    delayed: BinaryHeap<Reverse<(Instant, Uuid)>>,
    campaigns: HashMap<Uuid, CampaignTracker>,
    closed: bool,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse((due, _))) = self.delayed.peek() {
            if *due > now {
                break;
            }
            if let Some(Reverse((_, id))) = self.delayed.pop() {
                self.ready.push_back(id);
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse((due, _))| *due)
    }

    fn pop_claimable(&mut self) -> Option<DeliveryJob> {
        while let Some(id) = self.ready.pop_front() {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if !job.state.is_claimable() {
                continue;
            }

            let from = Bucket::of(job.state, job.attempts);
            job.state = JobState::Sending;
            job.attempts += 1;
            job.updated_at = Utc::now();
            let to = Bucket::of(job.state, job.attempts);
            let claimed = job.clone();

            if let Some(tracker) = self.campaigns.get_mut(&claimed.campaign_id) {
                tracker.record_claim(from, to);
            }
            return Some(claimed);
        }
        None
    }
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

/// Backlog of delivery jobs shared by the worker pool.
#[derive(Default)]
pub struct DeliveryQueue {
    state: Mutex<QueueState>,
    /// Signalled when a job may have become claimable.
    available: Notify,
    /// Signalled when a campaign completes.
    settled: Notify,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a campaign and queue its jobs. `total` is fixed to
    /// `jobs.len()`.
    #[instrument(skip(self, campaign, jobs), fields(campaign_id = %campaign.id, jobs = jobs.len()))]
    pub async fn enqueue(&self, campaign: Campaign, jobs: Vec<DeliveryJob>) -> NotificationResult<CampaignStatus> {
        let count = jobs.len();
        let campaign_id = campaign.id;

        let status = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(NotificationError::Internal("Delivery queue is closed".to_string()));
            }

            let tracker = CampaignTracker::new(campaign, count, Utc::now());
            let status = tracker.snapshot();
            state.campaigns.insert(campaign_id, tracker);

            for mut job in jobs {
                job.campaign_id = campaign_id;
                job.state = JobState::Queued;
                job.attempts = 0;
                state.ready.push_back(job.id);
                state.jobs.insert(job.id, job);
            }
            status
        };

        for _ in 0..count {
            self.available.notify_one();
        }
        if count == 0 {
            self.settled.notify_waiters();
        }

        debug!("Queued campaign");
        Ok(status)
    }

    /// Wait for a claimable job.
    ///
    /// Returns `None` once shutdown is signalled, or once the queue is closed
    /// and has nothing ready.
    pub async fn claim(&self, shutdown: &mut watch::Receiver<bool>) -> Option<DeliveryJob> {
        loop {
            if *shutdown.borrow() {
                return None;
            }

            // Register interest before checking so a concurrent enqueue is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut state = self.state.lock().await;
                state.promote_due(Instant::now());
                if let Some(job) = state.pop_claimable() {
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
                state.next_due()
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until_due(next_due) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return None;
                    }
                }
            }
        }
    }

    /// Apply the outcome of an attempt. Returns the job's new state.
    pub async fn transition(&self, job_id: Uuid, transition: Transition) -> NotificationResult<JobState> {
        let now = Utc::now();

        let (new_state, completed, retrying) = {
            let mut state = self.state.lock().await;
            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or(NotificationError::MessageNotFound(job_id))?;

            if job.state != JobState::Sending {
                return Err(NotificationError::Internal(format!(
                    "Job {} is not in flight (state {})",
                    job_id, job.state
                )));
            }

            let from = Bucket::of(job.state, job.attempts);
            let mut retry_at = None;
            match transition {
                Transition::Sent => job.state = JobState::Sent,
                Transition::Retry { error, delay } => {
                    job.state = JobState::Retrying;
                    job.last_error = Some(error);
                    retry_at = Some(Instant::now() + delay);
                }
                Transition::Failed { error } => {
                    job.state = JobState::Failed;
                    job.last_error = Some(error);
                }
            }
            job.updated_at = now;

            let new_state = job.state;
            let to = Bucket::of(job.state, job.attempts);
            let campaign_id = job.campaign_id;

            if let Some(due) = retry_at {
                state.delayed.push(Reverse((due, job_id)));
            }

            let completed = state
                .campaigns
                .get_mut(&campaign_id)
                .is_some_and(|tracker| tracker.record_transition(from, to, now));

            (new_state, completed, retry_at.is_some())
        };

        if retrying {
            // A sleeping worker has to pick up the new deadline.
            self.available.notify_one();
        }
        if completed {
            self.settled.notify_waiters();
        }
        Ok(new_state)
    }

    pub async fn status(&self, campaign_id: Uuid) -> Option<CampaignStatus> {
        let state = self.state.lock().await;
        state.campaigns.get(&campaign_id).map(CampaignTracker::snapshot)
    }

    pub async fn campaign(&self, campaign_id: Uuid) -> Option<Campaign> {
        let state = self.state.lock().await;
        state.campaigns.get(&campaign_id).map(|t| t.campaign().clone())
    }

    pub async fn job(&self, job_id: Uuid) -> Option<DeliveryJob> {
        self.state.lock().await.jobs.get(&job_id).cloned()
    }

    /// Jobs that are not yet terminal.
    pub async fn pending(&self) -> usize {
        let state = self.state.lock().await;
        state.jobs.values().filter(|j| !j.state.is_terminal()).count()
    }

    /// Wait until the campaign completes or `timeout` elapses. Returns
    /// whether it completed.
    pub async fn wait_for_completion(&self, campaign_id: Uuid, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            match self.status(campaign_id).await {
                None => return false,
                Some(status) if status.completed_time.is_some() => return true,
                Some(_) => {}
            }

            if tokio::time::timeout_at(deadline, settled.as_mut()).await.is_err() {
                return false;
            }
        }
    }

    /// Drop campaigns that completed at least `older_than` ago, along with
    /// their jobs. Campaigns still in flight are never touched. Returns the
    /// number of campaigns removed.
    pub async fn evict_completed(&self, older_than: chrono::Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut state = self.state.lock().await;

        let expired: HashSet<Uuid> = state
            .campaigns
            .iter()
            .filter(|(_, tracker)| tracker.completed_time().is_some_and(|at| at <= cutoff))
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return 0;
        }

        state.campaigns.retain(|id, _| !expired.contains(id));
        state.jobs.retain(|_, job| !expired.contains(&job.campaign_id));

        debug!(evicted = expired.len(), "Evicted completed campaigns");
        expired.len()
    }

    /// Stop accepting campaigns and wake idle workers so they can exit.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.available.notify_waiters();
        info!("Delivery queue closed");
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageContent, Recipient, RenderedMessage, TargetSpec};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn campaign() -> Campaign {
        Campaign::new(
            "app",
            "deploy",
            TargetSpec::space("space-1"),
            None,
            &MessageContent::new("s").with_text("t"),
        )
    }

    fn jobs(campaign: &Campaign, n: usize) -> Vec<DeliveryJob> {
        (0..n)
            .map(|i| {
                DeliveryJob::new(
                    Uuid::now_v7(),
                    campaign.id,
                    "app",
                    Recipient::new(format!("user-{}", i), Some(format!("user-{}@example.com", i))),
                    None,
                    RenderedMessage {
                        subject: "s".into(),
                        text: Some("t".into()),
                        html: None,
                    },
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_claim_moves_job_to_sending() {
        let queue = DeliveryQueue::new();
        let campaign = campaign();
        let id = campaign.id;
        queue.enqueue(campaign.clone(), jobs(&campaign, 1)).await.unwrap();
        let (_tx, mut rx) = watch::channel(false);

        let job = queue.claim(&mut rx).await.unwrap();
        assert_eq!(job.state, JobState::Sending);
        assert_eq!(job.attempts, 1);

        let status = queue.status(id).await.unwrap();
        assert_eq!(status.status, crate::models::CampaignState::Sending);
        assert_eq!(status.queued_messages, 1);
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let queue = Arc::new(DeliveryQueue::new());
        let campaign = campaign();
        queue.enqueue(campaign.clone(), jobs(&campaign, 50)).await.unwrap();
        queue.close().await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let (_tx, mut rx) = watch::channel(false);
                let mut claimed = Vec::new();
                while let Some(job) = queue.claim(&mut rx).await {
                    claimed.push(job.id);
                    queue.transition(job.id, Transition::Sent).await.unwrap();
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "job {} claimed twice", id);
            }
        }
        assert_eq!(seen.len(), 50);
        assert_eq!(queue.status(campaign.id).await.unwrap().sent_messages, 50);
    }

    #[tokio::test]
    async fn test_transition_requires_sending() {
        let queue = DeliveryQueue::new();
        let campaign = campaign();
        let batch = jobs(&campaign, 1);
        let job_id = batch[0].id;
        queue.enqueue(campaign, batch).await.unwrap();

        // Still queued.
        assert!(queue.transition(job_id, Transition::Sent).await.is_err());

        let (_tx, mut rx) = watch::channel(false);
        queue.claim(&mut rx).await.unwrap();
        assert_eq!(queue.transition(job_id, Transition::Sent).await.unwrap(), JobState::Sent);

        // Terminal jobs are never re-transitioned.
        assert!(queue.transition(job_id, Transition::Sent).await.is_err());
        assert!(matches!(
            queue.transition(Uuid::now_v7(), Transition::Sent).await,
            Err(NotificationError::MessageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_waits_for_backoff() {
        let queue = DeliveryQueue::new();
        let campaign = campaign();
        let campaign_id = campaign.id;
        queue.enqueue(campaign.clone(), jobs(&campaign, 1)).await.unwrap();
        let (_tx, mut rx) = watch::channel(false);

        let job = queue.claim(&mut rx).await.unwrap();
        let state = queue
            .transition(
                job.id,
                Transition::Retry {
                    error: "relay down".into(),
                    delay: Duration::from_millis(100),
                },
            )
            .await
            .unwrap();
        assert_eq!(state, JobState::Retrying);

        let status = queue.status(campaign_id).await.unwrap();
        assert_eq!(status.retry_messages, 1);
        assert_eq!(status.queued_messages, 0);
        assert!(status.completed_time.is_none());

        let started = Instant::now();
        let again = queue.claim(&mut rx).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 2);
        assert_eq!(again.last_error.as_deref(), Some("relay down"));

        queue
            .transition(again.id, Transition::Failed { error: "still down".into() })
            .await
            .unwrap();
        let status = queue.status(campaign_id).await.unwrap();
        assert_eq!(status.failed_messages, 1);
        assert_eq!(status.retry_messages, 0);
        assert!(status.completed_time.is_some());
    }

    #[tokio::test]
    async fn test_claim_returns_none_on_shutdown() {
        let queue = Arc::new(DeliveryQueue::new());
        let (tx, mut rx) = watch::channel(false);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim(&mut rx).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiting_worker() {
        let queue = Arc::new(DeliveryQueue::new());
        let (_tx, mut rx) = watch::channel(false);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim(&mut rx).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let campaign = campaign();
        queue.enqueue(campaign.clone(), jobs(&campaign, 1)).await.unwrap();

        let job = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(job.is_some());
    }

    #[tokio::test]
    async fn test_evict_completed_keeps_in_flight_campaigns() {
        let queue = DeliveryQueue::new();
        let (_tx, mut rx) = watch::channel(false);

        let done = campaign();
        let done_jobs = jobs(&done, 1);
        let done_job = done_jobs[0].id;
        queue.enqueue(done.clone(), done_jobs).await.unwrap();
        let job = queue.claim(&mut rx).await.unwrap();
        queue.transition(job.id, Transition::Sent).await.unwrap();

        let open = campaign();
        let open_jobs = jobs(&open, 1);
        let open_job = open_jobs[0].id;
        queue.enqueue(open.clone(), open_jobs).await.unwrap();

        assert_eq!(queue.evict_completed(chrono::Duration::hours(1)).await, 0);
        assert!(queue.status(done.id).await.is_some());

        assert_eq!(queue.evict_completed(chrono::Duration::zero()).await, 1);
        assert!(queue.status(done.id).await.is_none());
        assert!(queue.job(done_job).await.is_none());
        assert!(queue.status(open.id).await.is_some());
        assert!(queue.job(open_job).await.is_some());

        // The surviving job is still claimable.
        let claimed = queue.claim(&mut rx).await.unwrap();
        assert_eq!(claimed.id, open_job);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_new_campaigns() {
        let queue = DeliveryQueue::new();
        queue.close().await;
        let campaign = campaign();
        assert!(queue.enqueue(campaign.clone(), jobs(&campaign, 1)).await.is_err());
        assert!(queue.is_closed().await);
    }

    #[tokio::test]
    async fn test_wait_for_completion() {
        let queue = Arc::new(DeliveryQueue::new());
        let campaign = campaign();
        let campaign_id = campaign.id;
        queue.enqueue(campaign.clone(), jobs(&campaign, 1)).await.unwrap();

        assert!(!queue.wait_for_completion(campaign_id, Duration::from_millis(20)).await);

        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let (_tx, mut rx) = watch::channel(false);
                let job = queue.claim(&mut rx).await.unwrap();
                queue.transition(job.id, Transition::Sent).await.unwrap();
            })
        };

        assert!(queue.wait_for_completion(campaign_id, Duration::from_secs(1)).await);
        worker.await.unwrap();
        assert_eq!(queue.pending().await, 0);
    }

    #[tokio::test]
    async fn test_empty_campaign_is_complete() {
        let queue = DeliveryQueue::new();
        let campaign = campaign();
        let status = queue.enqueue(campaign.clone(), Vec::new()).await.unwrap();
        assert_eq!(status.total_messages, 0);
        assert!(status.completed_time.is_some());
        assert!(queue.wait_for_completion(campaign.id, Duration::from_millis(10)).await);
    }
}
