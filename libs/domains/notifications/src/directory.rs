//! Directory and membership service boundaries.
//!
//! Both services are external. The traits here are the only contract the
//! resolver relies on; `InMemoryDirectory` implements both for local
//! development and tests.

use crate::models::OrgRole;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

/// Failure reported by an upstream directory or membership service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// The requested entity does not exist. Carries the upstream description.
    #[error("{0}")]
    NotFound(String),

    /// The service could not be reached. Carries the service name.
    #[error("{0} is unavailable")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// A user as known to the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryUser {
    pub guid: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceInfo {
    pub guid: String,
    pub name: String,
    pub organization_guid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizationInfo {
    pub guid: String,
    pub name: String,
}

/// Resolves user identifiers to addresses.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    async fn lookup_user(&self, guid: &str, token: &str) -> UpstreamResult<DirectoryUser>;

    /// Every known user, ordered by guid.
    async fn all_users(&self, token: &str) -> UpstreamResult<Vec<DirectoryUser>>;
}

/// Resolves spaces and organizations to their members.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MembershipClient: Send + Sync {
    async fn space(&self, guid: &str, token: &str) -> UpstreamResult<SpaceInfo>;

    async fn organization(&self, guid: &str, token: &str) -> UpstreamResult<OrganizationInfo>;

    async fn members_of_space(&self, guid: &str, token: &str) -> UpstreamResult<Vec<String>>;

    /// `role == None` means every member of the organization.
    async fn members_of_organization(
        &self,
        guid: &str,
        role: Option<OrgRole>,
        token: &str,
    ) -> UpstreamResult<Vec<String>>;

    async fn organization_of_space(
        &self,
        guid: &str,
        token: &str,
    ) -> UpstreamResult<OrganizationInfo>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Debug, Default)]
struct DirectoryData {
    users: BTreeMap<String, Option<String>>,
    spaces: HashMap<String, SpaceInfo>,
    space_members: HashMap<String, Vec<String>>,
    organizations: HashMap<String, OrganizationInfo>,
    org_members: HashMap<String, Vec<(String, HashSet<OrgRole>)>>,
}

/// Directory and membership data held in process.
#[derive(Debug)]
pub struct InMemoryDirectory {
    service_name: String,
    data: RwLock<DirectoryData>,
    unavailable: AtomicBool,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            service_name: "CloudController".to_string(),
            data: RwLock::new(DirectoryData::default()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn with_user(mut self, guid: &str, email: Option<&str>) -> Self {
        self.data
            .get_mut()
            .users
            .insert(guid.to_string(), email.map(str::to_string));
        self
    }

    pub fn with_organization(mut self, guid: &str, name: &str) -> Self {
        self.data.get_mut().organizations.insert(
            guid.to_string(),
            OrganizationInfo {
                guid: guid.to_string(),
                name: name.to_string(),
            },
        );
        self
    }

    /// The owning organization does not have to exist.
    pub fn with_space(mut self, guid: &str, name: &str, organization_guid: &str) -> Self {
        self.data.get_mut().spaces.insert(
            guid.to_string(),
            SpaceInfo {
                guid: guid.to_string(),
                name: name.to_string(),
                organization_guid: organization_guid.to_string(),
            },
        );
        self
    }

    pub fn with_space_member(mut self, space_guid: &str, user_guid: &str) -> Self {
        self.data
            .get_mut()
            .space_members
            .entry(space_guid.to_string())
            .or_default()
            .push(user_guid.to_string());
        self
    }

    pub fn with_org_member(mut self, org_guid: &str, user_guid: &str, roles: &[OrgRole]) -> Self {
        self.data
            .get_mut()
            .org_members
            .entry(org_guid.to_string())
            .or_default()
            .push((user_guid.to_string(), roles.iter().copied().collect()));
        self
    }

    /// Simulate an outage of the upstream service.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> UpstreamResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(UpstreamError::Unavailable(self.service_name.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DirectoryClient for InMemoryDirectory {
    async fn lookup_user(&self, guid: &str, _token: &str) -> UpstreamResult<DirectoryUser> {
        self.check_available()?;
        let data = self.data.read().await;
        data.users
            .get(guid)
            .map(|email| DirectoryUser {
                guid: guid.to_string(),
                email: email.clone(),
            })
            .ok_or_else(|| {
                UpstreamError::NotFound(format!("The user could not be found: {}", guid))
            })
    }

    async fn all_users(&self, _token: &str) -> UpstreamResult<Vec<DirectoryUser>> {
        self.check_available()?;
        let data = self.data.read().await;
        Ok(data
            .users
            .iter()
            .map(|(guid, email)| DirectoryUser {
                guid: guid.clone(),
                email: email.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl MembershipClient for InMemoryDirectory {
    async fn space(&self, guid: &str, _token: &str) -> UpstreamResult<SpaceInfo> {
        self.check_available()?;
        let data = self.data.read().await;
        data.spaces.get(guid).cloned().ok_or_else(|| {
            UpstreamError::NotFound(format!("The app space could not be found: {}", guid))
        })
    }

    async fn organization(&self, guid: &str, _token: &str) -> UpstreamResult<OrganizationInfo> {
        self.check_available()?;
        let data = self.data.read().await;
        data.organizations.get(guid).cloned().ok_or_else(|| {
            UpstreamError::NotFound(format!("The organization could not be found: {}", guid))
        })
    }

    async fn members_of_space(&self, guid: &str, _token: &str) -> UpstreamResult<Vec<String>> {
        self.check_available()?;
        let data = self.data.read().await;
        if !data.spaces.contains_key(guid) {
            return Err(UpstreamError::NotFound(format!(
                "The app space could not be found: {}",
                guid
            )));
        }
        Ok(data.space_members.get(guid).cloned().unwrap_or_default())
    }

    async fn members_of_organization(
        &self,
        guid: &str,
        role: Option<OrgRole>,
        _token: &str,
    ) -> UpstreamResult<Vec<String>> {
        self.check_available()?;
        let data = self.data.read().await;
        if !data.organizations.contains_key(guid) {
            return Err(UpstreamError::NotFound(format!(
                "The organization could not be found: {}",
                guid
            )));
        }
        Ok(data
            .org_members
            .get(guid)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, roles)| role.is_none_or(|r| roles.contains(&r)))
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn organization_of_space(
        &self,
        guid: &str,
        token: &str,
    ) -> UpstreamResult<OrganizationInfo> {
        let space = MembershipClient::space(self, guid, token).await?;
        self.organization(&space.organization_guid, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> InMemoryDirectory {
        InMemoryDirectory::new()
            .with_user("user-1", Some("one@example.com"))
            .with_user("user-2", None)
            .with_organization("org-1", "acme")
            .with_space("space-1", "dev", "org-1")
            .with_space_member("space-1", "user-1")
            .with_org_member("org-1", "user-1", &[OrgRole::OrgManager])
            .with_org_member("org-1", "user-2", &[])
    }

    #[tokio::test]
    async fn test_lookup_user() {
        let dir = directory();
        let user = dir.lookup_user("user-1", "t").await.unwrap();
        assert_eq!(user.email.as_deref(), Some("one@example.com"));

        let err = dir.lookup_user("nobody", "t").await.unwrap_err();
        assert_eq!(
            err,
            UpstreamError::NotFound("The user could not be found: nobody".into())
        );
    }

    #[tokio::test]
    async fn test_org_members_filtered_by_role() {
        let dir = directory();
        let all = dir.members_of_organization("org-1", None, "t").await.unwrap();
        assert_eq!(all, vec!["user-1".to_string(), "user-2".to_string()]);

        let managers = dir
            .members_of_organization("org-1", Some(OrgRole::OrgManager), "t")
            .await
            .unwrap();
        assert_eq!(managers, vec!["user-1".to_string()]);

        let billing = dir
            .members_of_organization("org-1", Some(OrgRole::BillingManager), "t")
            .await
            .unwrap();
        assert!(billing.is_empty());
    }

    #[tokio::test]
    async fn test_organization_of_space() {
        let dir = directory().with_space("orphan", "lost", "org-gone");
        let org = dir.organization_of_space("space-1", "t").await.unwrap();
        assert_eq!(org.name, "acme");

        let err = dir.organization_of_space("orphan", "t").await.unwrap_err();
        assert!(matches!(err, UpstreamError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unavailable_service() {
        let dir = directory();
        dir.set_unavailable(true);
        let err = dir.all_users("t").await.unwrap_err();
        assert_eq!(err, UpstreamError::Unavailable("CloudController".into()));
        assert_eq!(err.to_string(), "CloudController is unavailable");

        dir.set_unavailable(false);
        assert_eq!(dir.all_users("t").await.unwrap().len(), 2);
    }
}
