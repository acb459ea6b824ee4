//! Subscription preferences and the gate that enforces them.

use crate::error::NotificationResult;
use crate::models::{NotificationKind, Preference, Recipient};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

/// Storage for per-kind email flags and the per-user global unsubscribe.
///
/// The global flag is stored apart from the per-kind rows so that clearing it
/// restores whatever kind flags were recorded before. `get` fills
/// `Preference::global_unsubscribe` from it; `upsert` writes only the
/// per-kind flag.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get(
        &self,
        client_id: &str,
        kind_id: &str,
        user_id: &str,
    ) -> NotificationResult<Option<Preference>>;

    async fn upsert(&self, preference: Preference) -> NotificationResult<()>;

    async fn global_unsubscribe(&self, user_id: &str) -> NotificationResult<bool>;

    async fn set_global_unsubscribe(&self, user_id: &str, unsubscribed: bool)
        -> NotificationResult<()>;

    async fn list_for_user(&self, user_id: &str) -> NotificationResult<Vec<Preference>>;
}

type PreferenceKey = (String, String, String);

/// In-memory preference store.
#[derive(Clone, Default)]
pub struct InMemoryPreferenceStore {
    rows: Arc<RwLock<HashMap<PreferenceKey, bool>>>,
    unsubscribed: Arc<RwLock<HashSet<String>>>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceStore for InMemoryPreferenceStore {
    async fn get(
        &self,
        client_id: &str,
        kind_id: &str,
        user_id: &str,
    ) -> NotificationResult<Option<Preference>> {
        let key = (client_id.to_string(), kind_id.to_string(), user_id.to_string());
        let Some(email) = self.rows.read().await.get(&key).copied() else {
            return Ok(None);
        };

        let mut preference = Preference::new(client_id, kind_id, user_id, email);
        preference.global_unsubscribe = self.unsubscribed.read().await.contains(user_id);
        Ok(Some(preference))
    }

    async fn upsert(&self, preference: Preference) -> NotificationResult<()> {
        let key = (preference.client_id, preference.kind_id, preference.user_id);
        self.rows.write().await.insert(key, preference.email);
        Ok(())
    }

    async fn global_unsubscribe(&self, user_id: &str) -> NotificationResult<bool> {
        Ok(self.unsubscribed.read().await.contains(user_id))
    }

    async fn set_global_unsubscribe(
        &self,
        user_id: &str,
        unsubscribed: bool,
    ) -> NotificationResult<()> {
        let mut set = self.unsubscribed.write().await;
        if unsubscribed {
            set.insert(user_id.to_string());
        } else {
            set.remove(user_id);
        }
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> NotificationResult<Vec<Preference>> {
        let global = self.unsubscribed.read().await.contains(user_id);
        let rows = self.rows.read().await;
        let mut preferences: Vec<Preference> = rows
            .iter()
            .filter(|((_, _, user), _)| user == user_id)
            .map(|((client, kind, user), email)| Preference {
                client_id: client.clone(),
                kind_id: kind.clone(),
                user_id: user.clone(),
                email: *email,
                global_unsubscribe: global,
            })
            .collect();
        preferences.sort_by(|a, b| (&a.client_id, &a.kind_id).cmp(&(&b.client_id, &b.kind_id)));
        Ok(preferences)
    }
}

// ============================================================================
// Gate
// ============================================================================

/// Decides whether a resolved recipient should receive a notification.
///
/// Preferences are read at gate time; nothing is cached between requests.
#[derive(Clone)]
pub struct PreferenceGate {
    store: Arc<dyn PreferenceStore>,
    critical_bypasses_global_unsubscribe: bool,
}

impl PreferenceGate {
    pub fn new(store: Arc<dyn PreferenceStore>, critical_bypasses_global_unsubscribe: bool) -> Self {
        Self {
            store,
            critical_bypasses_global_unsubscribe,
        }
    }

    /// Gate an ordinary send.
    pub async fn allow(
        &self,
        recipient: &Recipient,
        kind: &NotificationKind,
        client_id: &str,
    ) -> NotificationResult<bool> {
        self.allow_with(recipient, kind, client_id, false).await
    }

    /// Gate a send whose caller may hold the elevated critical scope.
    ///
    /// An elevated send of a critical kind ignores the per-kind flag. Global
    /// unsubscribe still applies unless the bypass is configured.
    #[instrument(skip(self, recipient, kind), fields(recipient = %recipient.id, kind_id = %kind.id))]
    pub async fn allow_with(
        &self,
        recipient: &Recipient,
        kind: &NotificationKind,
        client_id: &str,
        elevated: bool,
    ) -> NotificationResult<bool> {
        let bypass = elevated && kind.critical;

        let preference = self.store.get(client_id, &kind.id, &recipient.id).await?;
        let globally_unsubscribed = match &preference {
            Some(p) if p.global_unsubscribe => true,
            _ => self.store.global_unsubscribe(&recipient.id).await?,
        };

        if globally_unsubscribed && !(bypass && self.critical_bypasses_global_unsubscribe) {
            debug!("Recipient is globally unsubscribed");
            return Ok(false);
        }

        if bypass {
            return Ok(true);
        }

        // No row means subscribed.
        let allowed = preference.is_none_or(|p| p.email);
        if !allowed {
            debug!("Recipient unsubscribed from kind");
        }
        Ok(allowed)
    }
}

// ============================================================================
// Preference updates
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindPreferenceUpdate {
    pub email: Option<bool>,
}

/// PATCH-style preference change. Omitted fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreferenceUpdate {
    pub global_unsubscribe: Option<bool>,
    #[serde(default)]
    pub clients: HashMap<String, HashMap<String, KindPreferenceUpdate>>,
}

impl PreferenceUpdate {
    pub fn global(unsubscribed: bool) -> Self {
        Self {
            global_unsubscribe: Some(unsubscribed),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, client_id: &str, kind_id: &str, email: bool) -> Self {
        self.clients
            .entry(client_id.to_string())
            .or_default()
            .insert(kind_id.to_string(), KindPreferenceUpdate { email: Some(email) });
        self
    }

    pub async fn apply(&self, user_id: &str, store: &dyn PreferenceStore) -> NotificationResult<()> {
        for (client_id, kinds) in &self.clients {
            for (kind_id, update) in kinds {
                if let Some(email) = update.email {
                    store
                        .upsert(Preference::new(client_id, kind_id, user_id, email))
                        .await?;
                }
            }
        }

        if let Some(unsubscribed) = self.global_unsubscribe {
            store.set_global_unsubscribe(user_id, unsubscribed).await?;
        }

        info!(user_id = %user_id, "Updated preferences");
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindPreference {
    pub email: bool,
}

/// A user's recorded preferences, grouped by client then kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserPreferences {
    pub global_unsubscribe: bool,
    pub clients: BTreeMap<String, BTreeMap<String, KindPreference>>,
}

impl UserPreferences {
    pub async fn load(user_id: &str, store: &dyn PreferenceStore) -> NotificationResult<Self> {
        let mut view = UserPreferences {
            global_unsubscribe: store.global_unsubscribe(user_id).await?,
            clients: BTreeMap::new(),
        };

        for preference in store.list_for_user(user_id).await? {
            view.clients
                .entry(preference.client_id)
                .or_default()
                .insert(preference.kind_id, KindPreference { email: preference.email });
        }
        Ok(view)
    }
}
