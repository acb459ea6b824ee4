//! Message templates and rendering.
//!
//! Templates use `{{.Name}}` substitution points. Rendering is a single pass:
//! substituted values are never re-scanned, so message content containing
//! `{{.Name}}` is emitted literally. Unknown names are left as written.

use crate::error::{NotificationError, NotificationResult};
use crate::models::{Client, MessageContent, NotificationKind, Recipient, RenderedMessage, TargetSpec};
use async_trait::async_trait;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*\.([A-Za-z][A-Za-z0-9]*)\s*\}\}").expect("placeholder pattern is valid")
});

/// A message template. Missing body slots pass the caller's body through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub id: Option<String>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
}

impl Template {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            id: None,
            subject: subject.into(),
            text: None,
            html: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    /// Built-in template for a target kind.
    pub fn default_for(target: &TargetSpec) -> Self {
        let reason = match target {
            TargetSpec::User { .. } | TargetSpec::Email { .. } => {
                "was sent to you directly by the \"{{.SourceDescription}}\" component"
            }
            TargetSpec::Space { .. } => {
                "was sent to you by the \"{{.SourceDescription}}\" component because you are a member of the \"{{.Space}}\" space in the \"{{.Organization}}\" organization"
            }
            TargetSpec::Organization { .. } => {
                "was sent to you by the \"{{.SourceDescription}}\" component because you are a member of the \"{{.Organization}}\" organization"
            }
            TargetSpec::Everyone => {
                "was sent to all users by the \"{{.SourceDescription}}\" component"
            }
        };
        let preamble = format!("The following \"{{{{.KindDescription}}}}\" notification {}:", reason);

        Template::new("CF Notification: {{.Subject}}")
            .with_id(format!("default-{}", target.kind_name()))
            .with_text(format!("{}\n\n{{{{.Text}}}}", preamble))
            .with_html(format!("<p>{}</p>{{{{.HTML}}}}", preamble))
    }
}

/// External template storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Template assigned to a kind, else to the client, else `None`.
    async fn find(&self, client_id: &str, kind_id: &str) -> NotificationResult<Option<Template>>;
}

/// In-memory template assignments.
#[derive(Clone, Default)]
pub struct InMemoryTemplateStore {
    // Key (client, kind); kind "" means client-wide.
    assignments: Arc<RwLock<HashMap<(String, String), Template>>>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn assign_to_client(&self, client_id: &str, template: Template) {
        self.assignments
            .write()
            .await
            .insert((client_id.to_string(), String::new()), template);
    }

    pub async fn assign_to_kind(&self, client_id: &str, kind_id: &str, template: Template) {
        self.assignments
            .write()
            .await
            .insert((client_id.to_string(), kind_id.to_string()), template);
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn find(&self, client_id: &str, kind_id: &str) -> NotificationResult<Option<Template>> {
        let assignments = self.assignments.read().await;
        let template = assignments
            .get(&(client_id.to_string(), kind_id.to_string()))
            .or_else(|| assignments.get(&(client_id.to_string(), String::new())))
            .cloned();
        Ok(template)
    }
}

/// Values available to a template for one recipient.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    values: HashMap<&'static str, String>,
    has_text: bool,
    has_html: bool,
}

impl MessageContext {
    pub fn new(
        content: &MessageContent,
        recipient: &Recipient,
        kind: &NotificationKind,
        client: &Client,
        sender: &str,
        message_id: Uuid,
    ) -> Self {
        let mut values = HashMap::new();
        values.insert("Subject", content.subject.clone());
        values.insert("Text", content.text.clone().unwrap_or_default());
        values.insert("HTML", content.html.clone().unwrap_or_default());
        values.insert("To", recipient.email.clone().unwrap_or_default());
        values.insert("From", sender.to_string());
        values.insert("ReplyTo", content.reply_to.clone().unwrap_or_default());
        values.insert("KindDescription", kind.display_name().to_string());
        values.insert("KindID", kind.id.clone());
        values.insert("SourceDescription", client.display_name().to_string());
        values.insert("ClientID", client.id.clone());
        values.insert("MessageID", message_id.to_string());
        values.insert("Space", recipient.space.clone());
        values.insert("Organization", recipient.organization.clone());

        Self {
            values,
            has_text: content.text.is_some(),
            has_html: content.html.is_some(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Picks templates and renders them into per-recipient messages.
#[derive(Clone)]
pub struct MessageRenderer {
    store: Arc<dyn TemplateStore>,
}

impl MessageRenderer {
    pub fn new(store: Arc<dyn TemplateStore>) -> Self {
        Self { store }
    }

    /// Custom template for the client/kind, or the built-in one for the target.
    pub async fn template_for(
        &self,
        client_id: &str,
        kind_id: &str,
        target: &TargetSpec,
    ) -> NotificationResult<Template> {
        match self.store.find(client_id, kind_id).await? {
            Some(template) => Ok(template),
            None => {
                debug!(client_id = %client_id, kind_id = %kind_id, "Using default template");
                Ok(Template::default_for(target))
            }
        }
    }

    pub fn render(&self, template: &Template, context: &MessageContext) -> NotificationResult<RenderedMessage> {
        if !context.has_text && !context.has_html {
            return Err(NotificationError::EmptyBody);
        }

        let text = context
            .has_text
            .then(|| substitute(template.text.as_deref().unwrap_or("{{.Text}}"), context));
        let html = context
            .has_html
            .then(|| substitute(template.html.as_deref().unwrap_or("{{.HTML}}"), context));

        Ok(RenderedMessage {
            subject: substitute(&template.subject, context),
            text,
            html,
        })
    }
}

fn substitute(source: &str, context: &MessageContext) -> String {
    PLACEHOLDER
        .replace_all(source, |caps: &Captures| match context.get(&caps[1]) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(content: &MessageContent) -> MessageContext {
        let recipient = Recipient::new("user-1", Some("user@example.com".into()))
            .with_space("dev")
            .with_organization("acme");
        let kind = NotificationKind::new("deploy", "app").with_description("Deploy Failure");
        let client = Client::new("app", "");
        MessageContext::new(content, &recipient, &kind, &client, "no-reply@example.com", Uuid::nil())
    }

    fn renderer() -> MessageRenderer {
        MessageRenderer::new(Arc::new(InMemoryTemplateStore::new()))
    }

    #[test]
    fn test_render_default_space_template() {
        let content = MessageContent::new("Build broke").with_text("see logs");
        let template = Template::default_for(&TargetSpec::space("space-1"));

        let rendered = renderer().render(&template, &context(&content)).unwrap();
        assert_eq!(rendered.subject, "CF Notification: Build broke");
        assert_eq!(
            rendered.text.as_deref(),
            Some(
                "The following \"Deploy Failure\" notification was sent to you by the \"app\" component because you are a member of the \"dev\" space in the \"acme\" organization:\n\nsee logs"
            )
        );
        assert!(rendered.html.is_none());
    }

    #[test]
    fn test_render_html_only() {
        let content = MessageContent::new("s").with_html("<b>hi</b>");
        let template = Template::default_for(&TargetSpec::user("u"));

        let rendered = renderer().render(&template, &context(&content)).unwrap();
        assert!(rendered.text.is_none());
        assert!(rendered.html.unwrap().ends_with("<b>hi</b>"));
    }

    #[test]
    fn test_render_requires_a_body() {
        let content = MessageContent::new("s");
        let template = Template::default_for(&TargetSpec::user("u"));

        let err = renderer().render(&template, &context(&content)).unwrap_err();
        assert!(matches!(err, NotificationError::EmptyBody));
    }

    #[test]
    fn test_substitution_is_single_pass() {
        let content = MessageContent::new("{{.Text}}").with_text("{{.Subject}} {{.ClientID}}");
        let template = Template::new("{{.Subject}}").with_text("{{.Text}}");

        let rendered = renderer().render(&template, &context(&content)).unwrap();
        assert_eq!(rendered.subject, "{{.Text}}");
        assert_eq!(rendered.text.as_deref(), Some("{{.Subject}} {{.ClientID}}"));
    }

    #[test]
    fn test_unknown_placeholders_stay_literal() {
        let content = MessageContent::new("s").with_text("body");
        let template = Template::new("{{.Nope}} {{ .Subject }}").with_text("{{.Text}} {{Text}} {{.Endpoint}}");

        let rendered = renderer().render(&template, &context(&content)).unwrap();
        assert_eq!(rendered.subject, "{{.Nope}} s");
        assert_eq!(rendered.text.as_deref(), Some("body {{Text}} {{.Endpoint}}"));
    }

    #[test]
    fn test_missing_template_slot_passes_body_through() {
        let content = MessageContent::new("s").with_text("plain").with_html("<p>rich</p>");
        let template = Template::new("{{.Subject}}").with_text("[{{.To}}] {{.Text}}");

        let rendered = renderer().render(&template, &context(&content)).unwrap();
        assert_eq!(rendered.text.as_deref(), Some("[user@example.com] plain"));
        assert_eq!(rendered.html.as_deref(), Some("<p>rich</p>"));
    }

    #[tokio::test]
    async fn test_template_lookup_order() {
        let store = InMemoryTemplateStore::new();
        store.assign_to_client("app", Template::new("client").with_id("t-client")).await;
        store.assign_to_kind("app", "deploy", Template::new("kind").with_id("t-kind")).await;
        let renderer = MessageRenderer::new(Arc::new(store));
        let target = TargetSpec::user("u");

        let kind = renderer.template_for("app", "deploy", &target).await.unwrap();
        assert_eq!(kind.id.as_deref(), Some("t-kind"));

        let client = renderer.template_for("app", "other", &target).await.unwrap();
        assert_eq!(client.id.as_deref(), Some("t-client"));

        let fallback = renderer.template_for("other", "deploy", &target).await.unwrap();
        assert_eq!(fallback.id.as_deref(), Some("default-user"));
    }

    #[tokio::test]
    async fn test_template_store_errors_propagate() {
        let mut store = MockTemplateStore::new();
        store
            .expect_find()
            .returning(|_, _| Err(NotificationError::TemplateError("store offline".into())));
        let renderer = MessageRenderer::new(Arc::new(store));

        let err = renderer
            .template_for("app", "deploy", &TargetSpec::Everyone)
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::TemplateError(_)));
    }
}
