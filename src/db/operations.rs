use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::banned_words::{BannedWord, BannedWordInput, BannedWordStore};
use crate::db::models::{ip_to_bytes, BannedWordRow, IdentityRow, SettingRow, TextRow};
use crate::error::DatabaseError;
use crate::identity::{Identity, IdentityStore, VisitorId};
use crate::settings::{SettingKey, SettingsStore};
use crate::slugs::SlugStore;

/// Postgres-backed storage for every store trait.
#[derive(Clone)]
pub struct DbOperations {
    pool: Arc<PgPool>,
}

impl DbOperations {
    pub async fn new_with_options(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        Ok(Self { pool: Arc::new(pool) })
    }

    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        sqlx::migrate!("./migrations")
            .run(self.pool.as_ref())
            .await
            .map_err(|e| DatabaseError::MigrationError(e.to_string()))
    }

    pub fn get_pool_status(&self) -> DbPoolStatus {
        let size = self.pool.size();
        let idle = self.pool.num_idle() as u32;

        DbPoolStatus {
            total_connections: size,
            active_connections: size.saturating_sub(idle),
            idle_connections: idle,
        }
    }

    pub async fn begin_transaction(&self) -> Result<Transaction<'_, Postgres>, DatabaseError> {
        Ok(self.pool.as_ref().begin().await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl IdentityStore for DbOperations {
    async fn find(&self, id: &VisitorId) -> Result<Option<Identity>, DatabaseError> {
        let row = sqlx::query_as::<_, IdentityRow>(
            r#"
            SELECT id, ip_address, enrolled, cookie_expiry, last_active, questions_last_active_day
            FROM chatbot_users
            WHERE id = $1
            "#,
        )
        .bind(id.storage_key())
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(row.map(Identity::from))
    }

    #[instrument(skip(self))]
    async fn create(
        &self,
        enrolled: bool,
        ip: Option<IpAddr>,
        cookie_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Identity, DatabaseError> {
        let identity = Identity::new(enrolled, ip, cookie_expiry, now);

        let row = sqlx::query_as::<_, IdentityRow>(
            r#"
            INSERT INTO chatbot_users (id, ip_address, enrolled, cookie_expiry, last_active, questions_last_active_day)
            VALUES ($1, $2, $3, $4, $5, 0)
            RETURNING id, ip_address, enrolled, cookie_expiry, last_active, questions_last_active_day
            "#,
        )
        .bind(identity.id.storage_key())
        .bind(identity.ip.map(ip_to_bytes))
        .bind(identity.enrolled)
        .bind(identity.cookie_expiry)
        .bind(identity.last_active_at)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(row.into())
    }

    async fn count_active_enrolled(&self, since: DateTime<Utc>) -> Result<i64, DatabaseError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chatbot_users WHERE enrolled AND last_active >= $1",
        )
        .bind(since)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(count)
    }

    /// Single conditional UPDATE, so concurrent debits for the same visitor
    /// cannot lose increments.
    async fn record_question_use(
        &self,
        id: &VisitorId,
        day_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE chatbot_users
            SET questions_last_active_day = CASE
                    WHEN last_active >= $2 THEN questions_last_active_day + 1
                    ELSE 1
                END,
                last_active = $3
            WHERE id = $1
            "#,
        )
        .bind(id.storage_key())
        .bind(day_start)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_enrolled(&self, id: &VisitorId) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE chatbot_users SET enrolled = TRUE WHERE id = $1")
            .bind(id.storage_key())
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SettingsStore for DbOperations {
    async fn load(&self, names: &[&'static str]) -> Result<Vec<(String, String)>, DatabaseError> {
        let rows = sqlx::query_as::<_, SettingRow>(
            "SELECT name, value FROM chatbot_settings WHERE name = ANY($1)",
        )
        .bind(names.to_vec())
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows.into_iter().map(|row| (row.name, row.value)).collect())
    }

    #[instrument(skip(self, values), fields(count = values.len()))]
    async fn replace_all(&self, values: &[(SettingKey, String)]) -> Result<(), DatabaseError> {
        let mut transaction = self.begin_transaction().await?;

        sqlx::query("DELETE FROM chatbot_settings WHERE name = ANY($1)")
            .bind(SettingKey::names())
            .execute(&mut *transaction)
            .await?;

        for (key, value) in values {
            sqlx::query("INSERT INTO chatbot_settings (name, value) VALUES ($1, $2)")
                .bind(key.as_str())
                .bind(value.as_str())
                .execute(&mut *transaction)
                .await?;
        }

        // Dropping the transaction on an early return rolls it back.
        transaction.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl SlugStore for DbOperations {
    async fn load_overrides(&self) -> Result<Vec<(String, String)>, DatabaseError> {
        let rows = sqlx::query_as::<_, TextRow>("SELECT slug, text FROM chatbot_texts ORDER BY slug")
            .fetch_all(self.pool.as_ref())
            .await?;

        Ok(rows.into_iter().map(|row| (row.slug, row.text)).collect())
    }

    async fn upsert_override(&self, slug: &str, text: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO chatbot_texts (slug, text)
            VALUES ($1, $2)
            ON CONFLICT (slug) DO UPDATE SET text = EXCLUDED.text
            "#,
        )
        .bind(slug)
        .bind(text)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn delete_override(&self, slug: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM chatbot_texts WHERE slug = $1")
            .bind(slug)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl BannedWordStore for DbOperations {
    async fn list(&self) -> Result<Vec<BannedWord>, DatabaseError> {
        let rows = sqlx::query_as::<_, BannedWordRow>(
            "SELECT id, pattern, description, reply_message FROM chatbot_banned_words ORDER BY id",
        )
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows.into_iter().map(BannedWord::from).collect())
    }

    async fn get(&self, id: i64) -> Result<Option<BannedWord>, DatabaseError> {
        let row = sqlx::query_as::<_, BannedWordRow>(
            "SELECT id, pattern, description, reply_message FROM chatbot_banned_words WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(row.map(BannedWord::from))
    }

    async fn insert(&self, input: &BannedWordInput) -> Result<BannedWord, DatabaseError> {
        let row = sqlx::query_as::<_, BannedWordRow>(
            r#"
            INSERT INTO chatbot_banned_words (pattern, description, reply_message)
            VALUES ($1, $2, $3)
            RETURNING id, pattern, description, reply_message
            "#,
        )
        .bind(&input.pattern)
        .bind(&input.description)
        .bind(&input.reply_message)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(row.into())
    }

    async fn update(&self, id: i64, input: &BannedWordInput) -> Result<Option<BannedWord>, DatabaseError> {
        let row = sqlx::query_as::<_, BannedWordRow>(
            r#"
            UPDATE chatbot_banned_words
            SET pattern = $2, description = $3, reply_message = $4
            WHERE id = $1
            RETURNING id, pattern, description, reply_message
            "#,
        )
        .bind(id)
        .bind(&input.pattern)
        .bind(&input.description)
        .bind(&input.reply_message)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(row.map(BannedWord::from))
    }

    async fn delete(&self, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM chatbot_banned_words WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DbPoolStatus {
    pub total_connections: u32,
    pub active_connections: u32,
    pub idle_connections: u32,
}
