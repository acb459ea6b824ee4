//! Data models for the notifications domain.

use crate::error::{NotificationError, NotificationResult};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Scope a caller must hold to send critical notification kinds.
pub const CRITICAL_SCOPE: &str = "critical_notifications.write";

static KIND_ID_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-z_\-.]+$").expect("kind id pattern is valid"));

// ============================================================================
// Targets and recipients
// ============================================================================

/// Who a notification is addressed to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetSpec {
    User { guid: String },
    Space { guid: String },
    /// `role` is kept as supplied; the resolver rejects unknown values and
    /// treats a blank one as unset.
    Organization { guid: String, role: Option<String> },
    Email { address: String },
    Everyone,
}

impl TargetSpec {
    pub fn user(guid: impl Into<String>) -> Self {
        TargetSpec::User { guid: guid.into() }
    }

    pub fn space(guid: impl Into<String>) -> Self {
        TargetSpec::Space { guid: guid.into() }
    }

    /// A blank `role` is the same as no role.
    pub fn organization(guid: impl Into<String>, role: Option<&str>) -> Self {
        TargetSpec::Organization {
            guid: guid.into(),
            role: role.filter(|r| !r.trim().is_empty()).map(str::to_string),
        }
    }

    pub fn email(address: impl Into<String>) -> Self {
        TargetSpec::Email {
            address: address.into(),
        }
    }

    /// Short name of the variant, used to pick a default template.
    pub fn kind_name(&self) -> &'static str {
        match self {
            TargetSpec::User { .. } => "user",
            TargetSpec::Space { .. } => "space",
            TargetSpec::Organization { .. } => "organization",
            TargetSpec::Email { .. } => "email",
            TargetSpec::Everyone => "everyone",
        }
    }

    /// Direct sends complete before the dispatch call returns.
    pub fn is_direct(&self) -> bool {
        matches!(self, TargetSpec::User { .. } | TargetSpec::Email { .. })
    }
}

impl std::fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetSpec::User { guid } => write!(f, "user:{}", guid),
            TargetSpec::Space { guid } => write!(f, "space:{}", guid),
            TargetSpec::Organization { guid, role: Some(role) } => {
                write!(f, "organization:{}[{}]", guid, role)
            }
            TargetSpec::Organization { guid, role: None } => write!(f, "organization:{}", guid),
            TargetSpec::Email { address } => write!(f, "email:{}", address),
            TargetSpec::Everyone => write!(f, "everyone"),
        }
    }
}

/// Organization roles a fan-out can be filtered by.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum OrgRole {
    OrgManager,
    OrgAuditor,
    BillingManager,
}

impl OrgRole {
    /// Parse a caller-supplied role literal. Matching is exact.
    pub fn parse(value: &str) -> NotificationResult<Self> {
        value
            .parse::<OrgRole>()
            .map_err(|_| NotificationError::InvalidRole)
    }
}

/// A concrete, addressable destination produced by resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    /// User guid, or the raw address for email targets.
    pub id: String,
    /// `None` when the directory has no address on file.
    pub email: Option<String>,
    /// Space name, empty when not applicable.
    pub space: String,
    /// Organization name, empty when not applicable.
    pub organization: String,
}

impl Recipient {
    pub fn new(id: impl Into<String>, email: Option<String>) -> Self {
        Self {
            id: id.into(),
            email,
            space: String::new(),
            organization: String::new(),
        }
    }

    pub fn with_space(mut self, space: impl Into<String>) -> Self {
        self.space = space.into();
        self
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = organization.into();
        self
    }

    pub fn is_deliverable(&self) -> bool {
        self.email.as_deref().is_some_and(|e| !e.is_empty())
    }
}

// ============================================================================
// Clients, kinds and preferences
// ============================================================================

/// A registered sender of notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Client {
    pub id: String,
    pub description: String,
}

impl Client {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }

    /// Description shown to recipients, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.description.is_empty() {
            &self.id
        } else {
            &self.description
        }
    }
}

/// A category of notification owned by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationKind {
    pub id: String,
    pub description: String,
    pub critical: bool,
    pub client_id: String,
}

impl NotificationKind {
    pub fn new(id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            critical: false,
            client_id: client_id.into(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Description shown to recipients, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.description.is_empty() {
            &self.id
        } else {
            &self.description
        }
    }
}

/// A user's subscription flags for one (client, kind) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Preference {
    pub client_id: String,
    pub kind_id: String,
    pub user_id: String,
    pub email: bool,
    pub global_unsubscribe: bool,
}

impl Preference {
    pub fn new(
        client_id: impl Into<String>,
        kind_id: impl Into<String>,
        user_id: impl Into<String>,
        email: bool,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            kind_id: kind_id.into(),
            user_id: user_id.into(),
            email,
            global_unsubscribe: false,
        }
    }
}

// ============================================================================
// Message content
// ============================================================================

/// Caller-supplied message fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageContent {
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub reply_to: Option<String>,
}

impl MessageContent {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn has_body(&self) -> bool {
        self.text.is_some() || self.html.is_some()
    }
}

/// Final per-recipient content produced by the renderer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
}

/// Raw notify request parameters, validated before resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyParams {
    #[serde(default)]
    pub kind_id: String,
    #[serde(default)]
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub reply_to: Option<String>,
    pub role: Option<String>,
}

impl NotifyParams {
    /// Collect every validation problem rather than stopping at the first.
    pub fn validate(&self) -> NotificationResult<()> {
        let mut errors = Vec::new();

        if self.kind_id.is_empty() {
            errors.push("\"kind_id\" is a required field".to_string());
        } else if !KIND_ID_FORMAT.is_match(&self.kind_id) {
            errors.push("\"kind_id\" is improperly formatted".to_string());
        }

        if self.text.is_none() && self.html.is_none() {
            errors.push(NotificationError::EmptyBody.to_string());
        }

        if let Some(role) = self.role() {
            if OrgRole::parse(role).is_err() {
                errors.push(NotificationError::InvalidRole.to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NotificationError::Validation(errors))
        }
    }

    /// The requested organization role, `None` when absent or blank.
    pub fn role(&self) -> Option<&str> {
        self.role.as_deref().filter(|r| !r.trim().is_empty())
    }

    pub fn message(&self) -> MessageContent {
        MessageContent {
            subject: self.subject.clone(),
            text: self.text.clone(),
            html: self.html.clone(),
            reply_to: self.reply_to.clone(),
        }
    }
}

/// Caller context that travels with a dispatch.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: Uuid,
    /// Bearer token forwarded to the directory and membership services.
    pub token: String,
    pub scopes: Vec<String>,
    pub received_at: DateTime<Utc>,
}

impl RequestMeta {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::now_v7(),
            token: token.into(),
            scopes: Vec::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    pub fn has_critical_scope(&self) -> bool {
        self.scopes.iter().any(|s| s == CRITICAL_SCOPE)
    }
}

// ============================================================================
// Delivery jobs and campaigns
// ============================================================================

/// Lifecycle of a delivery job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Queued,
    Sending,
    Retrying,
    Sent,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Sent | JobState::Failed)
    }

    pub fn is_claimable(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Retrying)
    }
}

/// One recipient's share of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    /// Also the notification id reported to the caller.
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub client_id: String,
    pub recipient: Recipient,
    pub reply_to: Option<String>,
    pub message: RenderedMessage,
    pub state: JobState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryJob {
    pub fn new(
        id: Uuid,
        campaign_id: Uuid,
        client_id: impl Into<String>,
        recipient: Recipient,
        reply_to: Option<String>,
        message: RenderedMessage,
    ) -> Self {
        Self {
            id,
            campaign_id,
            client_id: client_id.into(),
            recipient,
            reply_to,
            message,
            state: JobState::Queued,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// One notify request's unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    /// Client that sent the notification.
    pub sender_id: String,
    /// Notification kind.
    pub campaign_type_id: String,
    pub send_to: TargetSpec,
    pub template_id: Option<String>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(
        sender_id: impl Into<String>,
        campaign_type_id: impl Into<String>,
        send_to: TargetSpec,
        template_id: Option<String>,
        content: &MessageContent,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            sender_id: sender_id.into(),
            campaign_type_id: campaign_type_id.into(),
            send_to,
            template_id,
            subject: content.subject.clone(),
            text: content.text.clone(),
            html: content.html.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Aggregate campaign progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CampaignState {
    Queued,
    Sending,
    Completed,
}

/// Point-in-time view of a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignStatus {
    pub id: Uuid,
    pub status: CampaignState,
    pub total_messages: usize,
    pub sent_messages: usize,
    pub retry_messages: usize,
    pub failed_messages: usize,
    pub queued_messages: usize,
    pub start_time: DateTime<Utc>,
    pub completed_time: Option<DateTime<Utc>>,
}

/// Point-in-time view of a single notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStatus {
    pub notification_id: Uuid,
    pub campaign_id: Uuid,
    pub recipient: String,
    pub status: JobState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&DeliveryJob> for MessageStatus {
    fn from(job: &DeliveryJob) -> Self {
        Self {
            notification_id: job.id,
            campaign_id: job.campaign_id,
            recipient: job.recipient.id.clone(),
            status: job.state,
            attempts: job.attempts,
            last_error: job.last_error.clone(),
            updated_at: job.updated_at,
        }
    }
}

// ============================================================================
// Dispatch responses
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    Undeliverable,
}

/// Per-recipient entry in the dispatch response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub recipient: String,
    pub status: DeliveryStatus,
    pub notification_id: Uuid,
}

/// Result of an accepted dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub campaign_id: Uuid,
    pub responses: Vec<DispatchResponse>,
}
