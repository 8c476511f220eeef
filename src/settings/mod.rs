//! General chatbot settings administered from the wiki.
//!
//! Values live in the `chatbot_settings` table as `(name, value)` text pairs.
//! They are read once and cached; the cache optionally expires so that saves
//! made by another process propagate without a restart.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::error::{AppError, DatabaseError};

pub const DEFAULT_SAMPLING_RATE: u32 = 0;
pub const DEFAULT_ACTIVE_USERS_LIMIT_DAYS: i64 = 30;
pub const DEFAULT_QUESTIONS_DAILY_LIMIT: i64 = 100;
pub const DEFAULT_COOKIE_EXPIRY_DAYS: i64 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SettingKey {
    NewUsersChatbotRate,
    ActiveUsersLimit,
    ActiveUsersLimitDays,
    QuestionsDailyLimit,
    QuestionCharacterLimit,
    FeedbackCharacterLimit,
    CookieExpiryDays,
    UuidRequestLimit,
    UsageHelpUrl,
    TermsOfServiceUrl,
}

impl SettingKey {
    /// The recognised keys. Nothing outside this list is read or written.
    pub const ALL: [SettingKey; 10] = [
        SettingKey::NewUsersChatbotRate,
        SettingKey::ActiveUsersLimit,
        SettingKey::ActiveUsersLimitDays,
        SettingKey::QuestionsDailyLimit,
        SettingKey::QuestionCharacterLimit,
        SettingKey::FeedbackCharacterLimit,
        SettingKey::CookieExpiryDays,
        SettingKey::UuidRequestLimit,
        SettingKey::UsageHelpUrl,
        SettingKey::TermsOfServiceUrl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::NewUsersChatbotRate => "new_users_chatbot_rate",
            SettingKey::ActiveUsersLimit => "active_users_limit",
            SettingKey::ActiveUsersLimitDays => "active_users_limit_days",
            SettingKey::QuestionsDailyLimit => "questions_daily_limit",
            SettingKey::QuestionCharacterLimit => "question_character_limit",
            SettingKey::FeedbackCharacterLimit => "feedback_character_limit",
            SettingKey::CookieExpiryDays => "cookie_expiry_days",
            SettingKey::UuidRequestLimit => "uuid_request_limit",
            SettingKey::UsageHelpUrl => "usage_help_url",
            SettingKey::TermsOfServiceUrl => "terms_of_service_url",
        }
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(SettingKey::as_str).collect()
    }
}

impl FromStr for SettingKey {
    type Err = AppError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        SettingKey::ALL
            .into_iter()
            .find(|key| key.as_str() == name)
            .ok_or_else(|| AppError::ValidationError(format!("unknown setting: {}", name)))
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A snapshot of the general settings. Absent keys resolve to documented
/// defaults; that is a normal outcome, not an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneralSettings {
    values: HashMap<SettingKey, String>,
}

impl GeneralSettings {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut values = HashMap::new();
        for (name, value) in pairs {
            match name.as_ref().parse::<SettingKey>() {
                Ok(key) => {
                    values.insert(key, value.into());
                }
                Err(_) => debug!(name = name.as_ref(), "ignoring unrecognised setting"),
            }
        }
        Self { values }
    }

    /// Raw value; empty strings count as unset.
    pub fn raw(&self, key: SettingKey) -> Option<&str> {
        self.values
            .get(&key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T: FromStr>(&self, key: SettingKey) -> Option<T> {
        let raw = self.raw(key)?;
        match raw.parse::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(setting = %key, value = raw, "unparseable setting, using default");
                None
            }
        }
    }

    /// Percent of new visitors enrolled, clamped to 0..=100.
    pub fn sampling_rate(&self) -> u32 {
        self.parsed::<u32>(SettingKey::NewUsersChatbotRate)
            .unwrap_or(DEFAULT_SAMPLING_RATE)
            .min(100)
    }

    /// Ceiling on active enrolled visitors; `None` means unbounded.
    pub fn active_users_limit(&self) -> Option<i64> {
        self.parsed(SettingKey::ActiveUsersLimit)
    }

    pub fn active_users_limit_days(&self) -> i64 {
        self.parsed(SettingKey::ActiveUsersLimitDays)
            .unwrap_or(DEFAULT_ACTIVE_USERS_LIMIT_DAYS)
    }

    pub fn questions_daily_limit(&self) -> i64 {
        self.parsed(SettingKey::QuestionsDailyLimit)
            .unwrap_or(DEFAULT_QUESTIONS_DAILY_LIMIT)
    }

    pub fn cookie_expiry_days(&self) -> i64 {
        self.parsed(SettingKey::CookieExpiryDays)
            .unwrap_or(DEFAULT_COOKIE_EXPIRY_DAYS)
    }

    pub fn question_character_limit(&self) -> Option<usize> {
        self.parsed(SettingKey::QuestionCharacterLimit)
    }

    pub fn feedback_character_limit(&self) -> Option<usize> {
        self.parsed(SettingKey::FeedbackCharacterLimit)
    }

    /// New identities a single address may be issued per hour.
    pub fn uuid_request_limit(&self) -> Option<u32> {
        self.parsed(SettingKey::UuidRequestLimit)
    }

    pub fn usage_help_url(&self) -> Option<&str> {
        self.raw(SettingKey::UsageHelpUrl)
    }

    pub fn terms_of_service_url(&self) -> Option<&str> {
        self.raw(SettingKey::TermsOfServiceUrl)
    }

    pub fn to_map(&self) -> BTreeMap<&'static str, String> {
        self.values
            .iter()
            .map(|(key, value)| (key.as_str(), value.clone()))
            .collect()
    }
}

/// Backing table for [`GeneralSettings`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// All stored pairs whose name is in `names`.
    async fn load(&self, names: &[&'static str]) -> Result<Vec<(String, String)>, DatabaseError>;

    /// Deletes every recognised key and inserts `values`, in one transaction.
    async fn replace_all(&self, values: &[(SettingKey, String)]) -> Result<(), DatabaseError>;
}

struct CachedSettings {
    settings: Arc<GeneralSettings>,
    loaded_at: Instant,
}

/// Read-through cache over a [`SettingsStore`]. Construct one per process
/// and share it; every consumer sees the same snapshot.
pub struct SettingsProvider {
    store: Arc<dyn SettingsStore>,
    ttl: Option<Duration>,
    cache: RwLock<Option<CachedSettings>>,
}

impl SettingsProvider {
    pub fn new(store: Arc<dyn SettingsStore>, ttl: Option<Duration>) -> Self {
        Self {
            store,
            ttl,
            cache: RwLock::new(None),
        }
    }

    fn is_fresh(&self, cached: &CachedSettings) -> bool {
        self.ttl.map_or(true, |ttl| cached.loaded_at.elapsed() < ttl)
    }

    pub async fn get(&self) -> Result<Arc<GeneralSettings>, DatabaseError> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            if self.is_fresh(cached) {
                return Ok(cached.settings.clone());
            }
        }

        let mut cache = self.cache.write().await;
        // Another request may have refreshed while we waited for the lock.
        if let Some(cached) = cache.as_ref() {
            if self.is_fresh(cached) {
                return Ok(cached.settings.clone());
            }
        }

        let pairs = self.store.load(&SettingKey::names()).await?;
        let settings = Arc::new(GeneralSettings::from_pairs(pairs));
        debug!(count = settings.values.len(), "loaded general settings");
        *cache = Some(CachedSettings {
            settings: settings.clone(),
            loaded_at: Instant::now(),
        });
        Ok(settings)
    }

    /// Replaces the whole recognised key set. Unknown keys reject the save
    /// before anything is written.
    #[instrument(skip(self, values))]
    pub async fn save(&self, values: HashMap<String, String>) -> Result<Arc<GeneralSettings>, AppError> {
        let mut rows = values
            .into_iter()
            .map(|(name, value)| -> Result<(SettingKey, String), AppError> {
                Ok((name.parse()?, value))
            })
            .collect::<Result<Vec<_>, _>>()?;
        rows.sort_by_key(|(key, _)| *key);

        if let Err(e) = self.store.replace_all(&rows).await {
            // Unknown what the store holds now; read it again next time.
            self.invalidate().await;
            return Err(e.into());
        }

        let settings = Arc::new(GeneralSettings::from_pairs(
            rows.iter().map(|(key, value)| (key.as_str(), value.clone())),
        ));
        *self.cache.write().await = Some(CachedSettings {
            settings: settings.clone(),
            loaded_at: Instant::now(),
        });
        info!(count = rows.len(), "general settings saved");
        Ok(settings)
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}
