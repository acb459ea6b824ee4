//! SMTP mail transport using lettre.

use super::MailTransport;
use crate::error::{NotificationError, NotificationResult};
use async_trait::async_trait;
use core_config::{env_flag, env_optional, env_parse, env_required, ConfigError, FromEnv};
use lettre::{
    address::Envelope,
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
        Error as SmtpError,
    },
    Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
};
use std::time::Duration;
use tracing::{debug, error, info};

/// SMTP relay configuration.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// Credentials are only sent when both username and password are set.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Require STARTTLS.
    pub use_tls: bool,
    /// Verify the relay's certificate when TLS is used.
    pub verify_ssl: bool,
    pub timeout: Duration,
}

impl SmtpConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            use_tls: true,
            verify_ssl: true,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_verify_ssl(mut self, verify_ssl: bool) -> Self {
        self.verify_ssl = verify_ssl;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl FromEnv for SmtpConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let port_raw = env_required("SMTP_PORT")?;
        let port = port_raw.trim().parse::<u16>().map_err(|e| ConfigError::ParseError {
            key: "SMTP_PORT".to_string(),
            details: e.to_string(),
        })?;

        Ok(Self {
            host: env_required("SMTP_HOST")?,
            port,
            username: env_optional("SMTP_USER"),
            password: env_optional("SMTP_PASS"),
            use_tls: env_flag("SMTP_TLS", true),
            verify_ssl: env_flag("VERIFY_SSL", true),
            timeout: Duration::from_secs(env_parse("SMTP_TIMEOUT_SECS", 30)?),
        })
    }
}

/// Mail transport that relays through an SMTP server.
pub struct SmtpMailTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
}

impl SmtpMailTransport {
    pub fn new(config: &SmtpConfig) -> NotificationResult<Self> {
        Ok(Self {
            transport: Self::build_transport(config)?,
            host: config.host.clone(),
        })
    }

    fn build_transport(config: &SmtpConfig) -> NotificationResult<AsyncSmtpTransport<Tokio1Executor>> {
        let mut builder = if config.use_tls {
            let tls = TlsParameters::builder(config.host.clone())
                .dangerous_accept_invalid_certs(!config.verify_ssl)
                .build()
                .map_err(|e| NotificationError::ConfigError(format!("Invalid TLS settings: {}", e)))?;

            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| NotificationError::ConfigError(format!("Failed to create SMTP relay: {}", e)))?
                .tls(Tls::Required(tls))
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };

        builder = builder.port(config.port).timeout(Some(config.timeout));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(builder.build())
    }

    fn envelope(from: &str, to: &[String]) -> NotificationResult<Envelope> {
        let from: Address = from.parse()?;
        let to = to
            .iter()
            .map(|address| address.parse::<Address>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Envelope::new(Some(from), to)?)
    }
}

/// 5xx replies are permanent. Connection problems, 4xx replies and timeouts
/// may clear up on their own.
fn classify(err: SmtpError) -> NotificationError {
    if err.is_permanent() {
        NotificationError::TransportPermanent(err.to_string())
    } else {
        NotificationError::TransportTransient(err.to_string())
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn send(&self, from: &str, to: &[String], raw: &[u8]) -> NotificationResult<()> {
        debug!(host = %self.host, recipients = to.len(), bytes = raw.len(), "Sending message via SMTP");

        let envelope = Self::envelope(from, to)?;
        let response = self.transport.send_raw(&envelope, raw).await.map_err(|e| {
            error!(host = %self.host, error = %e, "SMTP send failed");
            classify(e)
        })?;

        info!(
            host = %self.host,
            code = %response.code(),
            "Message accepted by SMTP relay"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn health_check(&self) -> NotificationResult<bool> {
        self.transport.test_connection().await.map_err(classify)
    }
}
