//! Recipient resolution.
//!
//! Turns a [`TargetSpec`] into concrete recipients using the directory and
//! membership services. Upstream failures are classified here:
//! not-found becomes [`NotificationError::RecipientNotFound`], outages become
//! [`NotificationError::ServiceUnavailable`], anything else passes through.

use crate::directory::{DirectoryClient, MembershipClient, UpstreamError};
use crate::error::{NotificationError, NotificationResult};
use crate::models::{OrgRole, Recipient, TargetSpec};
use futures::future::try_join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Not-found with an upstream description when one was given, else `fallback`.
fn classify(err: UpstreamError, fallback: impl FnOnce() -> String) -> NotificationError {
    match err {
        UpstreamError::NotFound(description) if description.is_empty() => {
            NotificationError::RecipientNotFound(fallback())
        }
        other => other.into(),
    }
}

#[derive(Clone)]
pub struct RecipientResolver {
    directory: Arc<dyn DirectoryClient>,
    membership: Arc<dyn MembershipClient>,
}

impl RecipientResolver {
    pub fn new(directory: Arc<dyn DirectoryClient>, membership: Arc<dyn MembershipClient>) -> Self {
        Self {
            directory,
            membership,
        }
    }

    /// Resolve a target into recipients, in directory order. A recipient id
    /// appears at most once; the first occurrence wins.
    ///
    /// Fails atomically: a hard error means no recipients at all.
    #[instrument(skip(self, token), fields(target = %target))]
    pub async fn resolve(&self, target: &TargetSpec, token: &str) -> NotificationResult<Vec<Recipient>> {
        let recipients = match target {
            TargetSpec::User { guid } => self.resolve_user(guid, token).await?,
            TargetSpec::Space { guid } => self.resolve_space(guid, token).await?,
            TargetSpec::Organization { guid, role } => {
                self.resolve_organization(guid, role.as_deref(), token).await?
            }
            TargetSpec::Email { address } => Self::resolve_email(address),
            TargetSpec::Everyone => self.resolve_everyone(token).await?,
        };

        let mut seen = HashSet::new();
        let recipients: Vec<Recipient> = recipients
            .into_iter()
            .filter(|r| seen.insert(r.id.clone()))
            .collect();

        debug!(count = recipients.len(), "Resolved recipients");
        Ok(recipients)
    }

    async fn resolve_user(&self, guid: &str, token: &str) -> NotificationResult<Vec<Recipient>> {
        let user = self
            .directory
            .lookup_user(guid, token)
            .await
            .map_err(|e| classify(e, || format!("The user could not be found: {}", guid)))?;

        Ok(vec![Recipient::new(user.guid, user.email)])
    }

    async fn resolve_space(&self, guid: &str, token: &str) -> NotificationResult<Vec<Recipient>> {
        let not_found = || format!("The app space could not be found: {}", guid);

        let space = self
            .membership
            .space(guid, token)
            .await
            .map_err(|e| classify(e, not_found))?;

        // An orphaned space is a resolution failure, not a partial success.
        let organization = self
            .membership
            .organization_of_space(guid, token)
            .await
            .map_err(|e| {
                classify(e, || {
                    format!("The organization could not be found: {}", space.organization_guid)
                })
            })?;

        let members = self
            .membership
            .members_of_space(guid, token)
            .await
            .map_err(|e| classify(e, not_found))?;

        let recipients = self.lookup_members(&members, token).await?;
        Ok(recipients
            .into_iter()
            .map(|r| r.with_space(&space.name).with_organization(&organization.name))
            .collect())
    }

    async fn resolve_organization(
        &self,
        guid: &str,
        role: Option<&str>,
        token: &str,
    ) -> NotificationResult<Vec<Recipient>> {
        let role = role
            .filter(|r| !r.trim().is_empty())
            .map(OrgRole::parse)
            .transpose()?;
        let not_found = || format!("The organization could not be found: {}", guid);

        let organization = self
            .membership
            .organization(guid, token)
            .await
            .map_err(|e| classify(e, not_found))?;

        let members = self
            .membership
            .members_of_organization(guid, role, token)
            .await
            .map_err(|e| classify(e, not_found))?;

        let recipients = self.lookup_members(&members, token).await?;
        Ok(recipients
            .into_iter()
            .map(|r| r.with_organization(&organization.name))
            .collect())
    }

    fn resolve_email(address: &str) -> Vec<Recipient> {
        vec![Recipient::new(address, Some(address.to_string()))]
    }

    async fn resolve_everyone(&self, token: &str) -> NotificationResult<Vec<Recipient>> {
        let users = self.directory.all_users(token).await?;
        Ok(users
            .into_iter()
            .map(|user| Recipient::new(user.guid, user.email))
            .collect())
    }

    /// Look up each member concurrently. Members the directory no longer
    /// knows are skipped; any other failure aborts the whole lookup.
    async fn lookup_members(&self, members: &[String], token: &str) -> NotificationResult<Vec<Recipient>> {
        let mut seen = HashSet::new();
        let unique = members.iter().filter(|guid| seen.insert(guid.as_str()));

        let lookups = unique.map(|guid| async move {
            match self.directory.lookup_user(guid, token).await {
                Ok(user) => Ok(Some(Recipient::new(user.guid, user.email))),
                Err(UpstreamError::NotFound(_)) => {
                    warn!(user_id = %guid, "Member missing from directory, skipping");
                    Ok(None)
                }
                Err(e) => Err(NotificationError::from(e)),
            }
        });

        Ok(try_join_all(lookups).await?.into_iter().flatten().collect())
    }
}
