//! Error types for the notifications domain.

use crate::directory::UpstreamError;
use core_config::ConfigError;
use thiserror::Error;
use uuid::Uuid;

/// Result type for notification operations.
pub type NotificationResult<T> = Result<T, NotificationError>;

/// Errors that can occur in the notifications domain.
///
/// Resolution and rendering errors abort a dispatch before anything is
/// queued. Transport errors are scoped to a single delivery job.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// Target user, space or organization does not exist.
    #[error("{0}")]
    RecipientNotFound(String),

    /// Organization role filter is not one of the supported roles.
    #[error("\"role\" must be \"OrgManager\", \"OrgAuditor\", \"BillingManager\" or unset")]
    InvalidRole,

    /// Directory or membership service is unreachable.
    #[error("{0} is unavailable")]
    ServiceUnavailable(String),

    /// Neither a text nor an HTML body was supplied.
    #[error("\"text\" or \"html\" fields must be supplied")]
    EmptyBody,

    /// Mail transport failed in a way that may succeed on retry.
    #[error("Transient transport failure: {0}")]
    TransportTransient(String),

    /// Mail transport rejected the message; retrying cannot help.
    #[error("Permanent transport failure: {0}")]
    TransportPermanent(String),

    /// Request parameters failed validation.
    #[error("{}", .0.join(", "))]
    Validation(Vec<String>),

    /// Unclassified upstream failure, passed through unchanged.
    #[error("{0}")]
    Upstream(String),

    /// Campaign id is unknown, or belongs to another sender.
    #[error("Campaign with id \"{0}\" could not be found")]
    CampaignNotFound(Uuid),

    /// Notification id is unknown.
    #[error("Message not found: {0}")]
    MessageNotFound(Uuid),

    /// Template rendering error.
    #[error("Template rendering error: {0}")]
    TemplateError(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl NotificationError {
    /// Whether a delivery attempt that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NotificationError::TransportTransient(_))
    }

    /// User-facing error messages, one entry per problem.
    pub fn errors(&self) -> Vec<String> {
        match self {
            NotificationError::Validation(errors) => errors.clone(),
            other => vec![other.to_string()],
        }
    }
}

impl From<ConfigError> for NotificationError {
    fn from(err: ConfigError) -> Self {
        NotificationError::ConfigError(err.to_string())
    }
}

impl From<UpstreamError> for NotificationError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::NotFound(description) => NotificationError::RecipientNotFound(description),
            UpstreamError::Unavailable(service) => NotificationError::ServiceUnavailable(service),
            UpstreamError::Other(description) => NotificationError::Upstream(description),
        }
    }
}

impl From<lettre::address::AddressError> for NotificationError {
    fn from(err: lettre::address::AddressError) -> Self {
        NotificationError::TransportPermanent(format!("Invalid address: {}", err))
    }
}

impl From<lettre::error::Error> for NotificationError {
    fn from(err: lettre::error::Error) -> Self {
        NotificationError::TransportPermanent(format!("Failed to build message: {}", err))
    }
}
