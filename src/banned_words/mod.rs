//! Words and patterns a visitor's question must not contain.
//!
//! A pattern wrapped in slashes (`/bene?fits?/`) is a regular expression
//! without modifiers. Anything else is matched as a case-insensitive
//! substring.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::error::{AppError, DatabaseError};

const DELIMITER: char = '/';

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BannedWord {
    pub id: i64,
    pub pattern: String,
    pub description: Option<String>,
    pub reply_message: Option<String>,
}

/// Fields an admin submits when creating or editing an entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BannedWordInput {
    pub pattern: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub reply_message: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Matcher {
    Literal(String),
    Pattern(Regex),
}

impl Matcher {
    pub fn compile(pattern: &str) -> Result<Self, AppError> {
        if pattern.trim().is_empty() {
            return Err(AppError::ValidationError("pattern must not be empty".into()));
        }
        if !pattern.starts_with(DELIMITER) {
            return Ok(Matcher::Literal(pattern.to_lowercase()));
        }

        let parts: Vec<&str> = pattern.split(DELIMITER).collect();
        match parts.as_slice() {
            ["", body, ""] if !body.is_empty() => Regex::new(body)
                .map(Matcher::Pattern)
                .map_err(|e| AppError::ValidationError(format!("invalid pattern: {}", e))),
            _ => Err(AppError::ValidationError(
                "a regular expression must be written as /pattern/ without modifiers".into(),
            )),
        }
    }

    pub fn is_match(&self, text: &str) -> bool {
        match self {
            Matcher::Literal(word) => text.to_lowercase().contains(word.as_str()),
            Matcher::Pattern(regex) => regex.is_match(text),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BannedWordStore: Send + Sync {
    async fn list(&self) -> Result<Vec<BannedWord>, DatabaseError>;

    async fn get(&self, id: i64) -> Result<Option<BannedWord>, DatabaseError>;

    async fn insert(&self, input: &BannedWordInput) -> Result<BannedWord, DatabaseError>;

    /// `None` when no entry has `id`.
    async fn update(&self, id: i64, input: &BannedWordInput) -> Result<Option<BannedWord>, DatabaseError>;

    async fn delete(&self, id: i64) -> Result<bool, DatabaseError>;
}

type CompiledList = Arc<Vec<(BannedWord, Matcher)>>;

/// Admin operations plus the cached, compiled list questions are checked
/// against.
pub struct BannedWordFilter {
    store: Arc<dyn BannedWordStore>,
    compiled: RwLock<Option<CompiledList>>,
}

impl BannedWordFilter {
    pub fn new(store: Arc<dyn BannedWordStore>) -> Self {
        Self {
            store,
            compiled: RwLock::new(None),
        }
    }

    pub async fn list(&self) -> Result<Vec<BannedWord>, AppError> {
        Ok(self.store.list().await?)
    }

    pub async fn get(&self, id: i64) -> Result<BannedWord, AppError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no banned word {}", id)))
    }

    #[instrument(skip(self, input), fields(pattern = %input.pattern))]
    pub async fn create(&self, input: BannedWordInput) -> Result<BannedWord, AppError> {
        Matcher::compile(&input.pattern)?;
        let word = self.store.insert(&input).await?;
        self.invalidate().await;
        info!(id = word.id, "banned word added");
        Ok(word)
    }

    #[instrument(skip(self, input), fields(pattern = %input.pattern))]
    pub async fn update(&self, id: i64, input: BannedWordInput) -> Result<BannedWord, AppError> {
        Matcher::compile(&input.pattern)?;
        let word = self
            .store
            .update(id, &input)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no banned word {}", id)))?;
        self.invalidate().await;
        info!(id, "banned word updated");
        Ok(word)
    }

    pub async fn delete(&self, id: i64) -> Result<(), AppError> {
        if !self.store.delete(id).await? {
            return Err(AppError::NotFound(format!("no banned word {}", id)));
        }
        self.invalidate().await;
        info!(id, "banned word deleted");
        Ok(())
    }

    async fn compiled(&self) -> Result<CompiledList, DatabaseError> {
        if let Some(list) = self.compiled.read().await.as_ref() {
            return Ok(list.clone());
        }

        let mut compiled = self.compiled.write().await;
        if let Some(list) = compiled.as_ref() {
            return Ok(list.clone());
        }

        let list: CompiledList = Arc::new(
            self.store
                .list()
                .await?
                .into_iter()
                .filter_map(|word| match Matcher::compile(&word.pattern) {
                    Ok(matcher) => Some((word, matcher)),
                    Err(e) => {
                        warn!(id = word.id, error = %e, "skipping unusable banned word");
                        None
                    }
                })
                .collect(),
        );
        *compiled = Some(list.clone());
        Ok(list)
    }

    /// First entry whose pattern occurs in `text`.
    pub async fn find_match(&self, text: &str) -> Result<Option<BannedWord>, DatabaseError> {
        Ok(self
            .compiled()
            .await?
            .iter()
            .find(|(_, matcher)| matcher.is_match(text))
            .map(|(word, _)| word.clone()))
    }

    pub async fn invalidate(&self) {
        *self.compiled.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(id: i64, pattern: &str) -> BannedWord {
        BannedWord {
            id,
            pattern: pattern.to_string(),
            description: None,
            reply_message: None,
        }
    }

    fn input(pattern: &str) -> BannedWordInput {
        BannedWordInput {
            pattern: pattern.to_string(),
            description: Some("test".to_string()),
            reply_message: None,
        }
    }

    #[test]
    fn test_literal_is_case_insensitive_substring() {
        let matcher = Matcher::compile("Casino").unwrap();
        assert!(matcher.is_match("best casinos near me"));
        assert!(!matcher.is_match("unemployment benefits"));
    }

    #[test]
    fn test_regex_pattern() {
        let matcher = Matcher::compile(r"/\d{9}/").unwrap();
        assert!(matches!(matcher, Matcher::Pattern(_)));
        assert!(matcher.is_match("my id is 123456789"));
        assert!(!matcher.is_match("my id is 1234"));
    }

    #[test]
    fn test_rejects_bad_patterns() {
        for pattern in ["", "   ", "/", "//", "/abc", "/abc/i", "/a/b/", "/(unclosed/"] {
            assert!(
                matches!(Matcher::compile(pattern), Err(AppError::ValidationError(_))),
                "{:?} should be rejected",
                pattern
            );
        }
    }

    #[tokio::test]
    async fn test_invalid_pattern_never_stored() {
        let mut store = MockBannedWordStore::new();
        store.expect_insert().never();
        let filter = BannedWordFilter::new(Arc::new(store));

        let err = filter.create(input("/[a-z/")).await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_create_refreshes_compiled_list() {
        let mut store = MockBannedWordStore::new();
        let mut loads = 0;
        store.expect_list().times(2).returning(move || {
            loads += 1;
            if loads == 1 {
                Ok(vec![])
            } else {
                Ok(vec![word(1, "casino")])
            }
        });
        store
            .expect_insert()
            .times(1)
            .returning(|input| Ok(word(1, &input.pattern)));
        let filter = BannedWordFilter::new(Arc::new(store));

        assert!(filter.find_match("casino bonus").await.unwrap().is_none());
        filter.create(input("casino")).await.unwrap();
        let found = filter.find_match("casino bonus").await.unwrap().unwrap();
        assert_eq!(found.id, 1);
    }

    #[tokio::test]
    async fn test_stored_garbage_is_skipped() {
        let mut store = MockBannedWordStore::new();
        store
            .expect_list()
            .times(1)
            .returning(|| Ok(vec![word(1, "/(broken/"), word(2, "/lott[eo]ry/")]));
        let filter = BannedWordFilter::new(Arc::new(store));

        let found = filter.find_match("lottery tickets").await.unwrap().unwrap();
        assert_eq!(found.id, 2);
        // Cached after the first read
        assert!(filter.find_match("(broken").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_entries_not_found() {
        let mut store = MockBannedWordStore::new();
        store.expect_update().returning(|_, _| Ok(None));
        store.expect_delete().returning(|_| Ok(false));
        store.expect_get().returning(|_| Ok(None));
        let filter = BannedWordFilter::new(Arc::new(store));

        assert!(matches!(filter.update(9, input("x")).await, Err(AppError::NotFound(_))));
        assert!(matches!(filter.delete(9).await, Err(AppError::NotFound(_))));
        assert!(matches!(filter.get(9).await, Err(AppError::NotFound(_))));
    }
}
