//! Notification service.
//!
//! Entry point for notify requests. A dispatch resolves the target, gates and
//! renders each recipient, then hands the whole campaign to the delivery
//! queue in one step. Any resolution, gating or rendering error aborts the
//! request before a single job is queued.

use crate::config::DispatchConfig;
use crate::directory::{DirectoryClient, MembershipClient};
use crate::error::{NotificationError, NotificationResult};
use crate::metrics::DeliveryMetrics;
use crate::models::{
    Campaign, CampaignStatus, Client, DeliveryJob, DeliveryStatus, DispatchOutcome, DispatchResponse,
    MessageContent, MessageStatus, NotificationKind, NotifyParams, RequestMeta, TargetSpec,
};
use crate::preferences::{PreferenceGate, PreferenceStore, PreferenceUpdate, UserPreferences};
use crate::processor::DeliveryProcessor;
use crate::providers::MailTransport;
use crate::queue::DeliveryQueue;
use crate::resolver::RecipientResolver;
use crate::templates::{MessageContext, MessageRenderer, TemplateStore};
use crate::worker::DeliveryWorkerPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// External collaborators the service is wired with.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn DirectoryClient>,
    pub membership: Arc<dyn MembershipClient>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub templates: Arc<dyn TemplateStore>,
}

pub struct NotificationService {
    resolver: RecipientResolver,
    gate: PreferenceGate,
    renderer: MessageRenderer,
    preferences: Arc<dyn PreferenceStore>,
    queue: Arc<DeliveryQueue>,
    /// Registered kinds keyed by (client id, kind id).
    kinds: RwLock<HashMap<(String, String), NotificationKind>>,
    config: DispatchConfig,
}

impl NotificationService {
    pub fn new(collaborators: Collaborators, config: DispatchConfig) -> Self {
        Self {
            resolver: RecipientResolver::new(collaborators.directory, collaborators.membership),
            gate: PreferenceGate::new(
                Arc::clone(&collaborators.preferences),
                config.critical_bypasses_global_unsubscribe,
            ),
            renderer: MessageRenderer::new(collaborators.templates),
            preferences: collaborators.preferences,
            queue: Arc::new(DeliveryQueue::new()),
            kinds: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Queue handle for the worker pool.
    pub fn queue(&self) -> Arc<DeliveryQueue> {
        Arc::clone(&self.queue)
    }

    /// Start a worker pool that delivers this service's jobs through
    /// `transport`.
    pub fn start_workers(&self, transport: Arc<dyn MailTransport>) -> DeliveryWorkerPool {
        let processor = Arc::new(DeliveryProcessor::new(
            transport,
            self.config.sender.clone(),
            self.config.send_timeout,
        ));
        DeliveryWorkerPool::start(self.queue(), processor, &self.config)
    }

    /// Register (or replace) a kind so notify requests pick up its
    /// description and critical flag.
    pub async fn register_kind(&self, kind: NotificationKind) {
        let key = (kind.client_id.clone(), kind.id.clone());
        self.kinds.write().await.insert(key, kind);
    }

    async fn kind_for(&self, client_id: &str, kind_id: &str) -> NotificationKind {
        let kinds = self.kinds.read().await;
        kinds
            .get(&(client_id.to_string(), kind_id.to_string()))
            .cloned()
            .unwrap_or_else(|| NotificationKind::new(kind_id, client_id))
    }

    /// Validate raw request parameters and dispatch them.
    ///
    /// A role in `params` applies to an organization target that carries
    /// none of its own. Blank roles count as none.
    pub async fn notify(
        &self,
        target: TargetSpec,
        client: &Client,
        params: &NotifyParams,
        meta: &RequestMeta,
    ) -> NotificationResult<DispatchOutcome> {
        params.validate()?;

        let target = match target {
            TargetSpec::Organization { guid, role } => TargetSpec::Organization {
                guid,
                role: role
                    .filter(|r| !r.trim().is_empty())
                    .or_else(|| params.role().map(str::to_string)),
            },
            other => other,
        };

        let kind = self.kind_for(&client.id, &params.kind_id).await;
        self.dispatch(&target, &kind, client, &params.message(), meta).await
    }

    /// Fan a message out to every recipient of `target`.
    ///
    /// Recipients without an address are reported `undeliverable`.
    /// Recipients the preference gate rejects are still reported `queued`
    /// but get no job.
    #[instrument(
        skip(self, kind, client, content, meta),
        fields(target = %target, kind_id = %kind.id, client_id = %client.id, request_id = %meta.request_id)
    )]
    pub async fn dispatch(
        &self,
        target: &TargetSpec,
        kind: &NotificationKind,
        client: &Client,
        content: &MessageContent,
        meta: &RequestMeta,
    ) -> NotificationResult<DispatchOutcome> {
        if !content.has_body() {
            return Err(NotificationError::EmptyBody);
        }

        let recipients = self.resolver.resolve(target, &meta.token).await?;
        let template = self.renderer.template_for(&client.id, &kind.id, target).await?;
        let elevated = kind.critical && meta.has_critical_scope();

        let campaign = Campaign::new(&client.id, &kind.id, target.clone(), template.id.clone(), content);
        let campaign_id = campaign.id;

        let mut responses = Vec::with_capacity(recipients.len());
        let mut jobs = Vec::new();

        for recipient in recipients {
            let notification_id = Uuid::now_v7();

            if !recipient.is_deliverable() {
                debug!(recipient = %recipient.id, "Recipient has no email address");
                responses.push(DispatchResponse {
                    recipient: recipient.id,
                    status: DeliveryStatus::Undeliverable,
                    notification_id,
                });
                continue;
            }

            if self.gate.allow_with(&recipient, kind, &client.id, elevated).await? {
                let context =
                    MessageContext::new(content, &recipient, kind, client, &self.config.sender, notification_id);
                let message = self.renderer.render(&template, &context)?;
                jobs.push(DeliveryJob::new(
                    notification_id,
                    campaign_id,
                    &client.id,
                    recipient.clone(),
                    content.reply_to.clone(),
                    message,
                ));
            } else {
                debug!(recipient = %recipient.id, "Recipient unsubscribed, skipping delivery");
            }

            responses.push(DispatchResponse {
                recipient: recipient.id,
                status: DeliveryStatus::Queued,
                notification_id,
            });
        }

        let job_count = jobs.len();
        self.queue.enqueue(campaign, jobs).await?;
        DeliveryMetrics::jobs_enqueued(job_count);

        info!(
            campaign_id = %campaign_id,
            recipients = responses.len(),
            jobs = job_count,
            "Campaign queued"
        );

        if target.is_direct()
            && !self
                .queue
                .wait_for_completion(campaign_id, self.config.direct_send_wait)
                .await
        {
            warn!(campaign_id = %campaign_id, "Direct send still in progress after wait");
        }

        Ok(DispatchOutcome {
            campaign_id,
            responses,
        })
    }

    pub async fn status(&self, campaign_id: Uuid) -> NotificationResult<CampaignStatus> {
        self.queue
            .status(campaign_id)
            .await
            .ok_or(NotificationError::CampaignNotFound(campaign_id))
    }

    /// Campaign status as seen by `sender_id`. A campaign owned by another
    /// sender is reported as not found.
    pub async fn status_for(&self, sender_id: &str, campaign_id: Uuid) -> NotificationResult<CampaignStatus> {
        match self.queue.campaign(campaign_id).await {
            Some(campaign) if campaign.sender_id == sender_id => self.status(campaign_id).await,
            _ => Err(NotificationError::CampaignNotFound(campaign_id)),
        }
    }

    pub async fn message_status(&self, notification_id: Uuid) -> NotificationResult<MessageStatus> {
        self.queue
            .job(notification_id)
            .await
            .map(|job| MessageStatus::from(&job))
            .ok_or(NotificationError::MessageNotFound(notification_id))
    }

    /// Apply a PATCH-style preference change and return the result.
    #[instrument(skip(self, update))]
    pub async fn update_preferences(
        &self,
        user_id: &str,
        update: &PreferenceUpdate,
    ) -> NotificationResult<UserPreferences> {
        update.apply(user_id, self.preferences.as_ref()).await?;
        UserPreferences::load(user_id, self.preferences.as_ref()).await
    }

    pub async fn user_preferences(&self, user_id: &str) -> NotificationResult<UserPreferences> {
        UserPreferences::load(user_id, self.preferences.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{InMemoryDirectory, MockDirectoryClient, MockMembershipClient, UpstreamError};
    use crate::models::OrgRole;
    use crate::preferences::{InMemoryPreferenceStore, MockPreferenceStore};
    use crate::templates::{InMemoryTemplateStore, Template};
    use std::time::Duration;

    fn directory() -> Arc<InMemoryDirectory> {
        Arc::new(
            InMemoryDirectory::new()
                .with_organization("org-123", "acme")
                .with_space("space-001", "production", "org-123")
                .with_user("user-456", Some("user-456@example.com"))
                .with_user("user-789", None)
                .with_space_member("space-001", "user-456")
                .with_space_member("space-001", "user-789")
                .with_org_member("org-123", "user-456", &[OrgRole::OrgManager]),
        )
    }

    fn service_with(preferences: Arc<dyn PreferenceStore>, templates: Arc<dyn TemplateStore>) -> NotificationService {
        let directory = directory();
        NotificationService::new(
            Collaborators {
                directory: directory.clone(),
                membership: directory,
                preferences,
                templates,
            },
            DispatchConfig::new("no-reply@example.com").with_direct_send_wait(Duration::from_millis(10)),
        )
    }

    fn service() -> NotificationService {
        service_with(
            Arc::new(InMemoryPreferenceStore::new()),
            Arc::new(InMemoryTemplateStore::new()),
        )
    }

    fn content() -> MessageContent {
        MessageContent::new("Deploy finished").with_text("All green")
    }

    fn kind() -> NotificationKind {
        NotificationKind::new("deploy", "ci").with_description("Deploy Events")
    }

    fn client() -> Client {
        Client::new("ci", "CI Pipeline")
    }

    #[tokio::test]
    async fn test_dispatch_reports_each_recipient() {
        let service = service();
        let outcome = service
            .dispatch(&TargetSpec::space("space-001"), &kind(), &client(), &content(), &RequestMeta::new("t"))
            .await
            .unwrap();

        assert_eq!(outcome.responses.len(), 2);
        let deliverable = outcome.responses.iter().find(|r| r.recipient == "user-456").unwrap();
        assert_eq!(deliverable.status, DeliveryStatus::Queued);
        let undeliverable = outcome.responses.iter().find(|r| r.recipient == "user-789").unwrap();
        assert_eq!(undeliverable.status, DeliveryStatus::Undeliverable);

        let status = service.status(outcome.campaign_id).await.unwrap();
        assert_eq!(status.total_messages, 1);
        assert_eq!(status.queued_messages, 1);

        let message = service.message_status(deliverable.notification_id).await.unwrap();
        assert_eq!(message.recipient, "user-456");
        assert!(matches!(
            service.message_status(undeliverable.notification_id).await,
            Err(NotificationError::MessageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unsubscribed_recipient_is_queued_without_job() {
        let preferences = Arc::new(InMemoryPreferenceStore::new());
        let service = service_with(preferences.clone(), Arc::new(InMemoryTemplateStore::new()));
        service
            .update_preferences("user-456", &PreferenceUpdate::default().with_kind("ci", "deploy", false))
            .await
            .unwrap();

        let outcome = service
            .dispatch(&TargetSpec::user("user-456"), &kind(), &client(), &content(), &RequestMeta::new("t"))
            .await
            .unwrap();

        assert_eq!(outcome.responses[0].status, DeliveryStatus::Queued);
        let status = service.status(outcome.campaign_id).await.unwrap();
        assert_eq!(status.total_messages, 0);
        assert!(status.completed_time.is_some());
    }

    #[tokio::test]
    async fn test_critical_scope_bypasses_kind_preference() {
        let service = service();
        service
            .update_preferences("user-456", &PreferenceUpdate::default().with_kind("ci", "deploy", false))
            .await
            .unwrap();
        let critical = kind().critical();

        let plain = service
            .dispatch(&TargetSpec::user("user-456"), &critical, &client(), &content(), &RequestMeta::new("t"))
            .await
            .unwrap();
        assert_eq!(service.status(plain.campaign_id).await.unwrap().total_messages, 0);

        let meta = RequestMeta::new("t").with_scope(crate::models::CRITICAL_SCOPE);
        let elevated = service
            .dispatch(&TargetSpec::user("user-456"), &critical, &client(), &content(), &meta)
            .await
            .unwrap();
        assert_eq!(service.status(elevated.campaign_id).await.unwrap().total_messages, 1);
    }

    #[tokio::test]
    async fn test_empty_body_aborts_before_resolution() {
        let mut directory = MockDirectoryClient::new();
        directory.expect_lookup_user().never();
        let mut membership = MockMembershipClient::new();
        membership.expect_space().never();

        let service = NotificationService::new(
            Collaborators {
                directory: Arc::new(directory),
                membership: Arc::new(membership),
                preferences: Arc::new(InMemoryPreferenceStore::new()),
                templates: Arc::new(InMemoryTemplateStore::new()),
            },
            DispatchConfig::new("no-reply@example.com"),
        );

        let err = service
            .dispatch(
                &TargetSpec::user("user-456"),
                &kind(),
                &client(),
                &MessageContent::new("no body"),
                &RequestMeta::new("t"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::EmptyBody));
    }

    #[tokio::test]
    async fn test_resolution_failure_queues_nothing() {
        let directory = directory();
        directory.set_unavailable(true);
        let service = NotificationService::new(
            Collaborators {
                directory: directory.clone(),
                membership: directory,
                preferences: Arc::new(InMemoryPreferenceStore::new()),
                templates: Arc::new(InMemoryTemplateStore::new()),
            },
            DispatchConfig::new("no-reply@example.com"),
        );

        let err = service
            .dispatch(&TargetSpec::space("space-001"), &kind(), &client(), &content(), &RequestMeta::new("t"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "CloudController is unavailable");
        assert_eq!(service.queue().pending().await, 0);
    }

    #[tokio::test]
    async fn test_preference_store_failure_aborts_dispatch() {
        let mut preferences = MockPreferenceStore::new();
        preferences
            .expect_get()
            .returning(|_, _, _| Err(NotificationError::Internal("store offline".into())));

        let service = service_with(Arc::new(preferences), Arc::new(InMemoryTemplateStore::new()));
        let err = service
            .dispatch(&TargetSpec::space("space-001"), &kind(), &client(), &content(), &RequestMeta::new("t"))
            .await
            .unwrap_err();

        assert!(matches!(err, NotificationError::Internal(_)));
        assert_eq!(service.queue().pending().await, 0);
    }

    #[tokio::test]
    async fn test_notify_validates_and_applies_role() {
        let service = service();
        let params = NotifyParams {
            kind_id: "Bad Kind".into(),
            role: Some("Admin".into()),
            ..Default::default()
        };
        let err = service
            .notify(TargetSpec::organization("org-123", None), &client(), &params, &RequestMeta::new("t"))
            .await
            .unwrap_err();
        assert_eq!(err.errors().len(), 3);

        service.register_kind(kind()).await;
        let params = NotifyParams {
            kind_id: "deploy".into(),
            subject: "Deploy finished".into(),
            text: Some("All green".into()),
            role: Some("OrgManager".into()),
            ..Default::default()
        };
        let outcome = service
            .notify(TargetSpec::organization("org-123", None), &client(), &params, &RequestMeta::new("t"))
            .await
            .unwrap();
        assert_eq!(outcome.responses.len(), 1);
        assert_eq!(outcome.responses[0].recipient, "user-456");
    }

    #[tokio::test]
    async fn test_custom_template_is_recorded_on_campaign() {
        let templates = Arc::new(InMemoryTemplateStore::new());
        templates
            .assign_to_kind("ci", "deploy", Template::new("[{{.KindDescription}}] {{.Subject}}").with_id("tpl-1"))
            .await;
        let service = service_with(Arc::new(InMemoryPreferenceStore::new()), templates);

        let outcome = service
            .dispatch(&TargetSpec::email("ops@example.com"), &kind(), &client(), &content(), &RequestMeta::new("t"))
            .await
            .unwrap();

        let campaign = service.queue().campaign(outcome.campaign_id).await.unwrap();
        assert_eq!(campaign.template_id.as_deref(), Some("tpl-1"));

        let job = service.queue().job(outcome.responses[0].notification_id).await.unwrap();
        assert_eq!(job.message.subject, "[Deploy Events] Deploy finished");
    }

    #[tokio::test]
    async fn test_not_found_upstream_error_reaches_caller() {
        let mut directory = MockDirectoryClient::new();
        directory
            .expect_lookup_user()
            .returning(|guid, _| Err(UpstreamError::NotFound(format!("The user could not be found: {}", guid))));
        let membership = MockMembershipClient::new();

        let service = NotificationService::new(
            Collaborators {
                directory: Arc::new(directory),
                membership: Arc::new(membership),
                preferences: Arc::new(InMemoryPreferenceStore::new()),
                templates: Arc::new(InMemoryTemplateStore::new()),
            },
            DispatchConfig::new("no-reply@example.com"),
        );

        let err = service
            .dispatch(&TargetSpec::user("ghost"), &kind(), &client(), &content(), &RequestMeta::new("t"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "The user could not be found: ghost");
    }

    #[tokio::test]
    async fn test_unknown_campaign() {
        let service = service();
        assert!(matches!(
            service.status(Uuid::now_v7()).await,
            Err(NotificationError::CampaignNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_status_is_scoped_to_sender() {
        let service = service();
        let outcome = service
            .dispatch(&TargetSpec::space("space-001"), &kind(), &client(), &content(), &RequestMeta::new("t"))
            .await
            .unwrap();

        let status = service.status_for("ci", outcome.campaign_id).await.unwrap();
        assert_eq!(status.id, outcome.campaign_id);

        let err = service.status_for("other-app", outcome.campaign_id).await.unwrap_err();
        assert!(matches!(err, NotificationError::CampaignNotFound(id) if id == outcome.campaign_id));
        assert_eq!(
            err.to_string(),
            format!("Campaign with id \"{}\" could not be found", outcome.campaign_id)
        );

        assert!(service.status_for("ci", Uuid::now_v7()).await.is_err());
    }
}
