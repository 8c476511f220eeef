//! Interface texts ("slugs") shown by the chatbot widget.
//!
//! Every slug has a built-in default. Admins may override any of them; the
//! overrides live in `chatbot_texts` and are merged over the defaults when
//! the widget asks for its configuration.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::error::{AppError, DatabaseError};
use crate::settings::GeneralSettings;

/// Placeholder replaced with the configured limit in the two limit slugs.
pub const LIMIT_PLACEHOLDER: &str = "$1";

pub const BANNED_WORD_FOUND: &str = "banned_word_found";

pub const DEFAULT_SLUGS: [(&str, Option<&str>); 26] = [
    ("chat_icon", Some("כל שאלה")),
    ("chat_tip_link", Some("טיפים לניסוח שאלה טובה")),
    ("close_chat_icon", Some("סגירה")),
    ("dislike_follow_up_question", Some("תודה! נשמח לדעת למה")),
    ("dislike_followup_q_first", Some("המידע לא נכון")),
    ("dislike_followup_q_second", Some("התשובה לא קשורה לשאלה")),
    ("dislike_followup_q_third", Some("התשובה לא ברורה")),
    ("dislike_free_text", Some("רוצה לפרט? זה יעזור לנו להשתפר")),
    ("like_follow_up_question", Some("תודה!")),
    ("like_free_text", Some("רוצה לפרט?")),
    ("feedback_free_text_disclaimer", Some("אין לשתף פרטים מזהים או מידע רגיש")),
    ("new_question_button", Some("שאלה חדשה")),
    ("new_question_filed", Some("שאלה חדשה")),
    ("question_disclaimer", Some("אין לשתף פרטים מזהים או מידע רגיש")),
    ("question_field", Some("מה רצית לדעת")),
    ("ranking_request", Some("האם התשובה עזרה לך?")),
    ("returning_links_title", Some("כדאי לבדוק את התשובה גם כאן =>")),
    ("tc_link", Some("תנאי שימוש")),
    (
        "welcome_message_first",
        Some("שלום! הצ'אט של 'כל זכות' יכול למצוא לך תשובות מתוך 'כל זכות' מהר ובקלות בעזרת בינה מלאכותית. אפשר לשאול כל שאלה על זכויות בשפה חופשית. כדאי לציין מאפיינים רלוונטיים כמו גיל ומצב משפחתי."),
    ),
    (
        "welcome_message_second",
        Some("חשוב * אין למסור מידע מזהה או רגיש כמו שם, כתובת או מידע רפואי. המידע נאסף לצורך שיפור השירות. * הצ'אט יכול לטעות. כל זכות אינה אחראית לנכונות התשובות וממליצה לבדוק את המידע גם בעמוד המתאים באתר. בתקופת ההרצה הצ'אט יופיע רק לחלק מהגולשים."),
    ),
    ("welcome_message_third", None),
    ("feedback_character_limit", Some("מקסימום $1 תווים")),
    ("questions_daily_limit", Some("לא ניתן לשאול שאלות נוספות היום")),
    ("question_character_limit", Some("מקסימום $1 תווים")),
    (BANNED_WORD_FOUND, Some("אנא נסחו מחדש את השאלה")),
    ("general_error", Some("אירעה שגיאה במערכת. אנא נסו שנית מאוחר יותר.")),
];

/// The default for `name`, or `None` when `name` is not a slug at all.
pub fn default_text(name: &str) -> Option<Option<&'static str>> {
    DEFAULT_SLUGS
        .iter()
        .find(|(slug, _)| *slug == name)
        .map(|(_, text)| *text)
}

fn known_slug(name: &str) -> Result<Option<&'static str>, AppError> {
    default_text(name).ok_or_else(|| AppError::NotFound(format!("unknown slug {}", name)))
}

/// Admin view of one slug.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlugEntry {
    pub slug: &'static str,
    pub default: Option<&'static str>,
    pub text: Option<String>,
    pub overridden: bool,
}

/// Defaults with the stored overrides applied.
#[derive(Debug, Clone, Default)]
pub struct SlugTexts {
    overrides: HashMap<&'static str, String>,
}

impl SlugTexts {
    /// Overrides for names that are not slugs are dropped.
    pub fn from_overrides<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut overrides = HashMap::new();
        for (name, text) in pairs {
            match DEFAULT_SLUGS.iter().find(|(slug, _)| *slug == name.as_ref()) {
                Some((slug, _)) => {
                    overrides.insert(*slug, text.into());
                }
                None => debug!(name = name.as_ref(), "ignoring override for unknown slug"),
            }
        }
        Self { overrides }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.overrides.get(name) {
            Some(text) => Some(text.as_str()),
            None => default_text(name).flatten(),
        }
    }

    pub fn entries(&self) -> Vec<SlugEntry> {
        DEFAULT_SLUGS
            .iter()
            .map(|(slug, default)| SlugEntry {
                slug: *slug,
                default: *default,
                text: self.text(slug).map(str::to_string),
                overridden: self.overrides.contains_key(slug),
            })
            .collect()
    }

    /// Texts as the widget receives them, with the character limits filled in.
    /// An unset limit leaves an empty gap.
    pub fn render(&self, settings: &GeneralSettings) -> BTreeMap<&'static str, Option<String>> {
        DEFAULT_SLUGS
            .iter()
            .map(|(slug, _)| {
                let limit = match *slug {
                    "question_character_limit" => Some(settings.question_character_limit()),
                    "feedback_character_limit" => Some(settings.feedback_character_limit()),
                    _ => None,
                };
                let text = self.text(slug).map(|text| match limit {
                    Some(limit) => text.replace(
                        LIMIT_PLACEHOLDER,
                        &limit.map(|n| n.to_string()).unwrap_or_default(),
                    ),
                    None => text.to_string(),
                });
                (*slug, text)
            })
            .collect()
    }
}

/// Storage for slug overrides.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SlugStore: Send + Sync {
    async fn load_overrides(&self) -> Result<Vec<(String, String)>, DatabaseError>;

    async fn upsert_override(&self, slug: &str, text: &str) -> Result<(), DatabaseError>;

    /// Whether an override existed.
    async fn delete_override(&self, slug: &str) -> Result<bool, DatabaseError>;
}

struct CachedTexts {
    texts: Arc<SlugTexts>,
    loaded_at: Instant,
}

/// Read-through cache over a [`SlugStore`], shared like the settings cache.
pub struct SlugProvider {
    store: Arc<dyn SlugStore>,
    ttl: Option<Duration>,
    cache: RwLock<Option<CachedTexts>>,
}

impl SlugProvider {
    pub fn new(store: Arc<dyn SlugStore>, ttl: Option<Duration>) -> Self {
        Self {
            store,
            ttl,
            cache: RwLock::new(None),
        }
    }

    fn is_fresh(&self, cached: &CachedTexts) -> bool {
        self.ttl.map_or(true, |ttl| cached.loaded_at.elapsed() < ttl)
    }

    pub async fn get(&self) -> Result<Arc<SlugTexts>, DatabaseError> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            if self.is_fresh(cached) {
                return Ok(cached.texts.clone());
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.as_ref() {
            if self.is_fresh(cached) {
                return Ok(cached.texts.clone());
            }
        }

        let texts = Arc::new(SlugTexts::from_overrides(self.store.load_overrides().await?));
        *cache = Some(CachedTexts {
            texts: texts.clone(),
            loaded_at: Instant::now(),
        });
        Ok(texts)
    }

    /// Overrides one slug. A text identical to the default is refused; reset
    /// the slug instead.
    #[instrument(skip(self, text))]
    pub async fn save(&self, slug: &str, text: &str) -> Result<(), AppError> {
        let default = known_slug(slug)?;
        if default == Some(text) {
            return Err(AppError::ValidationError(format!(
                "text for {} is the same as the default",
                slug
            )));
        }

        let result = self.store.upsert_override(slug, text).await;
        self.invalidate().await;
        result?;
        info!(slug, "slug override saved");
        Ok(())
    }

    /// Drops the override so the default applies again.
    #[instrument(skip(self))]
    pub async fn reset(&self, slug: &str) -> Result<bool, AppError> {
        known_slug(slug)?;
        let result = self.store.delete_override(slug).await;
        self.invalidate().await;
        let removed = result?;
        info!(slug, removed, "slug reset to default");
        Ok(removed)
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}
