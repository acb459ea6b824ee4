//! Notifications Domain
//!
//! Dispatches email notifications to users, spaces, organizations and raw
//! addresses, and tracks their delivery.
//!
//! # Features
//!
//! - Recipient resolution against external directory and membership services
//! - Per-user subscription preferences with global unsubscribe
//! - Template rendering with built-in defaults per target kind
//! - Asynchronous delivery with retry on transient transport failures
//! - Live campaign and per-message status
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   API Handler   │  ← notify / status / preferences
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │ NotificationSvc │  ← resolve → gate → render
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │  DeliveryQueue  │  ← jobs + campaign counters, one lock
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │  Worker Pool    │  ← claim, send, retry with backoff
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │  MailTransport  │  ← SMTP, recording
//! └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use domain_notifications::{
//!     Collaborators, DispatchConfig, NotificationService, TargetSpec,
//!     providers::{SmtpConfig, SmtpMailTransport},
//! };
//!
//! let service = NotificationService::new(collaborators, DispatchConfig::from_env()?);
//! let transport = SmtpMailTransport::new(&SmtpConfig::from_env()?)?;
//! let workers = service.start_workers(Arc::new(transport));
//!
//! let outcome = service
//!     .notify(TargetSpec::space("space-001"), &client, &params, &meta)
//!     .await?;
//! let status = service.status(outcome.campaign_id).await?;
//!
//! workers.shutdown().await;
//! ```

pub mod config;
pub mod directory;
pub mod error;
pub mod metrics;
pub mod models;
pub mod preferences;
pub mod processor;
pub mod providers;
pub mod queue;
pub mod resolver;
pub mod service;
pub mod status;
pub mod templates;
pub mod worker;

// Re-export commonly used types
pub use config::{BackoffStrategy, DispatchConfig, RetryPolicy};
pub use directory::{DirectoryClient, InMemoryDirectory, MembershipClient, UpstreamError};
pub use error::{NotificationError, NotificationResult};
pub use models::{
    Campaign, CampaignState, CampaignStatus, Client, DeliveryJob, DeliveryStatus, DispatchOutcome,
    DispatchResponse, JobState, MessageContent, MessageStatus, NotificationKind, NotifyParams, OrgRole,
    Preference, Recipient, RequestMeta, TargetSpec, CRITICAL_SCOPE,
};
pub use preferences::{InMemoryPreferenceStore, PreferenceGate, PreferenceStore, PreferenceUpdate, UserPreferences};
pub use processor::DeliveryProcessor;
pub use providers::{MailTransport, RecordingTransport, SmtpConfig, SmtpMailTransport};
pub use queue::DeliveryQueue;
pub use resolver::RecipientResolver;
pub use service::{Collaborators, NotificationService};
pub use templates::{InMemoryTemplateStore, MessageRenderer, Template, TemplateStore};
pub use worker::DeliveryWorkerPool;
