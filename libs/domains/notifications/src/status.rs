//! Campaign status aggregation.
//!
//! A [`CampaignTracker`] keeps per-bucket counts for one campaign. It is only
//! ever mutated by the delivery queue while the queue lock is held, so a
//! reader never sees a job counted twice or mid-transition.

use crate::models::{Campaign, CampaignState, CampaignStatus, JobState};
use chrono::{DateTime, Utc};
use tracing::info;

/// Status bucket a job is counted in.
///
/// A job being sent for the first time still counts as queued; a job being
/// re-sent after a failure counts as retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Queued,
    Retrying,
    Sent,
    Failed,
}

impl Bucket {
    pub fn of(state: JobState, attempts: u32) -> Self {
        match state {
            JobState::Queued => Bucket::Queued,
            JobState::Sending if attempts <= 1 => Bucket::Queued,
            JobState::Sending | JobState::Retrying => Bucket::Retrying,
            JobState::Sent => Bucket::Sent,
            JobState::Failed => Bucket::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CampaignTracker {
    campaign: Campaign,
    total: usize,
    queued: usize,
    retrying: usize,
    sent: usize,
    failed: usize,
    started: bool,
    start_time: DateTime<Utc>,
    completed_time: Option<DateTime<Utc>>,
}

impl CampaignTracker {
    /// `total` is fixed here and never changes afterwards.
    pub fn new(campaign: Campaign, total: usize, start_time: DateTime<Utc>) -> Self {
        Self {
            campaign,
            total,
            queued: total,
            retrying: 0,
            sent: 0,
            failed: 0,
            started: false,
            start_time,
            // Nothing to wait for.
            completed_time: (total == 0).then_some(start_time),
        }
    }

    pub fn campaign(&self) -> &Campaign {
        &self.campaign
    }

    pub fn completed_time(&self) -> Option<DateTime<Utc>> {
        self.completed_time
    }

    pub fn is_complete(&self) -> bool {
        self.completed_time.is_some()
    }

    /// Record a claim. Claims move a job into `Sending`.
    pub fn record_claim(&mut self, from: Bucket, to: Bucket) {
        self.started = true;
        self.shift(from, to);
    }

    /// Record a job state change. Returns true when this change completed the
    /// campaign.
    pub fn record_transition(&mut self, from: Bucket, to: Bucket, now: DateTime<Utc>) -> bool {
        self.shift(from, to);

        if self.completed_time.is_none() && self.sent + self.failed == self.total {
            self.completed_time = Some(now);
            info!(
                campaign_id = %self.campaign.id,
                sent = self.sent,
                failed = self.failed,
                "Campaign completed"
            );
            return true;
        }
        false
    }

    fn shift(&mut self, from: Bucket, to: Bucket) {
        if from == to {
            return;
        }
        let from_count = self.count_mut(from);
        *from_count = from_count.saturating_sub(1);
        *self.count_mut(to) += 1;
    }

    fn count_mut(&mut self, bucket: Bucket) -> &mut usize {
        match bucket {
            Bucket::Queued => &mut self.queued,
            Bucket::Retrying => &mut self.retrying,
            Bucket::Sent => &mut self.sent,
            Bucket::Failed => &mut self.failed,
        }
    }

    pub fn snapshot(&self) -> CampaignStatus {
        let status = if self.completed_time.is_some() {
            CampaignState::Completed
        } else if self.started {
            CampaignState::Sending
        } else {
            CampaignState::Queued
        };

        CampaignStatus {
            id: self.campaign.id,
            status,
            total_messages: self.total,
            sent_messages: self.sent,
            retry_messages: self.retrying,
            failed_messages: self.failed,
            queued_messages: self.queued,
            start_time: self.start_time,
            completed_time: self.completed_time,
        }
    }
}
