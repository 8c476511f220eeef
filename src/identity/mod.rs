//! Visitor identity: the opaque identifier handed to the browser and the
//! record persisted against it.
//!
//! Identifiers come in two shapes. New visitors get a v4 UUID, which the
//! client may echo back either hyphenated or as compact hex. Visitors from
//! before the UUID switch carry a short free-form token that must keep
//! resolving to its row. Both are normalised here, once, at the store boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{AppError, DatabaseError};

const MAX_ID_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VisitorId {
    Uuid(Uuid),
    /// Pre-UUID token, stored and compared verbatim.
    Legacy(String),
}

impl VisitorId {
    pub fn generate() -> Self {
        VisitorId::Uuid(Uuid::new_v4())
    }

    /// Key under which the record is stored: compact lowercase hex for UUIDs,
    /// the raw token for legacy ids.
    pub fn storage_key(&self) -> String {
        match self {
            VisitorId::Uuid(uuid) => uuid.simple().to_string(),
            VisitorId::Legacy(token) => token.clone(),
        }
    }

    /// Rebuilds an id from a stored key. Never fails: anything that is not a
    /// compact UUID is a legacy token.
    pub fn from_storage_key(key: &str) -> Self {
        parse_uuid(key)
            .map(VisitorId::Uuid)
            .unwrap_or_else(|| VisitorId::Legacy(key.to_string()))
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, VisitorId::Legacy(_))
    }
}

/// Accepts only the hyphenated (36) and compact (32) hex forms. Braced and
/// URN spellings are treated as legacy tokens.
fn parse_uuid(raw: &str) -> Option<Uuid> {
    match raw.len() {
        32 | 36 => Uuid::try_parse(raw).ok(),
        _ => None,
    }
}

impl FromStr for VisitorId {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        // Legacy tokens are stored verbatim, so only blankness looks past whitespace.
        if raw.trim().is_empty() {
            return Err(AppError::ValidationError("uuid must not be empty".into()));
        }
        if raw.len() > MAX_ID_LEN || raw.chars().any(char::is_control) {
            return Err(AppError::ValidationError("malformed uuid".into()));
        }
        Ok(parse_uuid(raw)
            .map(VisitorId::Uuid)
            .unwrap_or_else(|| VisitorId::Legacy(raw.to_string())))
    }
}

impl fmt::Display for VisitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VisitorId::Uuid(uuid) => write!(f, "{}", uuid.hyphenated()),
            VisitorId::Legacy(token) => f.write_str(token),
        }
    }
}

impl Serialize for VisitorId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One anonymous visitor's enrollment and quota state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: VisitorId,
    #[serde(skip)]
    pub ip: Option<IpAddr>,
    pub enrolled: bool,
    pub cookie_expiry: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Questions consumed on `last_active_at`'s calendar day.
    pub questions_used_today: i64,
}

impl Identity {
    pub fn new(
        enrolled: bool,
        ip: Option<IpAddr>,
        cookie_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: VisitorId::generate(),
            ip,
            enrolled,
            cookie_expiry,
            last_active_at: now,
            questions_used_today: 0,
        }
    }
}

/// Persistence for visitor identities.
///
/// Every operation may race with a concurrent request for the same visitor;
/// implementations must not hold locks across calls.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find(&self, id: &VisitorId) -> Result<Option<Identity>, DatabaseError>;

    /// Inserts a fresh identity with a newly generated UUID.
    async fn create(
        &self,
        enrolled: bool,
        ip: Option<IpAddr>,
        cookie_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Identity, DatabaseError>;

    /// Enrolled identities active at or after `since`.
    async fn count_active_enrolled(&self, since: DateTime<Utc>) -> Result<i64, DatabaseError>;

    /// Debits one question. The counter restarts at 1 when the stored
    /// activity predates `day_start`. Returns `false` when no row matched.
    async fn record_question_use(
        &self,
        id: &VisitorId,
        day_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Flips `enrolled` to true. Returns `false` when no row matched.
    async fn mark_enrolled(&self, id: &VisitorId) -> Result<bool, DatabaseError>;
}
