//! Process-local storage, for development and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use tokio::sync::RwLock;

use crate::banned_words::{BannedWord, BannedWordInput, BannedWordStore};
use crate::error::DatabaseError;
use crate::identity::{Identity, IdentityStore, VisitorId};
use crate::settings::{SettingKey, SettingsStore};
use crate::slugs::SlugStore;

#[derive(Default)]
struct BannedWordTable {
    next_id: i64,
    rows: BTreeMap<i64, BannedWord>,
}

#[derive(Default)]
pub struct MemoryStore {
    identities: RwLock<HashMap<String, Identity>>,
    settings: RwLock<HashMap<String, String>>,
    texts: RwLock<BTreeMap<String, String>>,
    banned_words: RwLock<BannedWordTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            settings: RwLock::new(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    /// Stores a record as-is, e.g. one carrying a legacy id or old activity.
    pub async fn insert(&self, identity: Identity) {
        self.identities
            .write()
            .await
            .insert(identity.id.storage_key(), identity);
    }

    pub async fn identity_count(&self) -> usize {
        self.identities.read().await.len()
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn find(&self, id: &VisitorId) -> Result<Option<Identity>, DatabaseError> {
        Ok(self.identities.read().await.get(&id.storage_key()).cloned())
    }

    async fn create(
        &self,
        enrolled: bool,
        ip: Option<IpAddr>,
        cookie_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Identity, DatabaseError> {
        let identity = Identity::new(enrolled, ip, cookie_expiry, now);
        let mut identities = self.identities.write().await;
        let key = identity.id.storage_key();
        if identities.contains_key(&key) {
            return Err(DatabaseError::Duplicate);
        }
        identities.insert(key, identity.clone());
        Ok(identity)
    }

    async fn count_active_enrolled(&self, since: DateTime<Utc>) -> Result<i64, DatabaseError> {
        let count = self
            .identities
            .read()
            .await
            .values()
            .filter(|identity| identity.enrolled && identity.last_active_at >= since)
            .count();
        Ok(count as i64)
    }

    async fn record_question_use(
        &self,
        id: &VisitorId,
        day_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut identities = self.identities.write().await;
        let Some(identity) = identities.get_mut(&id.storage_key()) else {
            return Ok(false);
        };
        identity.questions_used_today = if identity.last_active_at >= day_start {
            identity.questions_used_today + 1
        } else {
            1
        };
        identity.last_active_at = now;
        Ok(true)
    }

    async fn mark_enrolled(&self, id: &VisitorId) -> Result<bool, DatabaseError> {
        match self.identities.write().await.get_mut(&id.storage_key()) {
            Some(identity) => {
                identity.enrolled = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn load(&self, names: &[&'static str]) -> Result<Vec<(String, String)>, DatabaseError> {
        Ok(self
            .settings
            .read()
            .await
            .iter()
            .filter(|(name, _)| names.iter().any(|n| *n == name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect())
    }

    async fn replace_all(&self, values: &[(SettingKey, String)]) -> Result<(), DatabaseError> {
        // Single write guard: readers never observe a half-replaced set.
        let mut settings = self.settings.write().await;
        let recognised = SettingKey::names();
        settings.retain(|name, _| !recognised.iter().any(|n| *n == name.as_str()));
        for (key, value) in values {
            settings.insert(key.as_str().to_string(), value.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl SlugStore for MemoryStore {
    async fn load_overrides(&self) -> Result<Vec<(String, String)>, DatabaseError> {
        Ok(self
            .texts
            .read()
            .await
            .iter()
            .map(|(slug, text)| (slug.clone(), text.clone()))
            .collect())
    }

    async fn upsert_override(&self, slug: &str, text: &str) -> Result<(), DatabaseError> {
        self.texts.write().await.insert(slug.to_string(), text.to_string());
        Ok(())
    }

    async fn delete_override(&self, slug: &str) -> Result<bool, DatabaseError> {
        Ok(self.texts.write().await.remove(slug).is_some())
    }
}

#[async_trait]
impl BannedWordStore for MemoryStore {
    async fn list(&self) -> Result<Vec<BannedWord>, DatabaseError> {
        Ok(self.banned_words.read().await.rows.values().cloned().collect())
    }

    async fn get(&self, id: i64) -> Result<Option<BannedWord>, DatabaseError> {
        Ok(self.banned_words.read().await.rows.get(&id).cloned())
    }

    async fn insert(&self, input: &BannedWordInput) -> Result<BannedWord, DatabaseError> {
        let mut table = self.banned_words.write().await;
        table.next_id += 1;
        let word = BannedWord {
            id: table.next_id,
            pattern: input.pattern.clone(),
            description: input.description.clone(),
            reply_message: input.reply_message.clone(),
        };
        table.rows.insert(word.id, word.clone());
        Ok(word)
    }

    async fn update(&self, id: i64, input: &BannedWordInput) -> Result<Option<BannedWord>, DatabaseError> {
        let mut table = self.banned_words.write().await;
        Ok(table.rows.get_mut(&id).map(|word| {
            word.pattern = input.pattern.clone();
            word.description = input.description.clone();
            word.reply_message = input.reply_message.clone();
            word.clone()
        }))
    }

    async fn delete(&self, id: i64) -> Result<bool, DatabaseError> {
        Ok(self.banned_words.write().await.rows.remove(&id).is_some())
    }
}
