pub mod api;
pub mod auth;
pub mod banned_words;
pub mod config;
pub mod db;
pub mod eligibility;
pub mod error;
pub mod identity;
pub mod proxy;
pub mod settings;
pub mod slugs;

use actix_web::{web, HttpResponse};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

pub use auth::AuthService;
pub use db::{DbOperations, MemoryStore};
use eligibility::{
    BypassAuthority, Clock, EligibilitySampler, IdentityRequestLimiter, OsRandom, QuotaEnforcer,
    RandomSource, SystemClock,
};
use banned_words::{BannedWordFilter, BannedWordStore};
use identity::IdentityStore;
use proxy::RagClient;
use settings::{SettingsProvider, SettingsStore};
use slugs::{SlugProvider, SlugStore};

const DB_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Health check endpoint handler
/// Returns a JSON response with server status, timestamp and pool usage
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "database": state.db.as_ref().map(DbOperations::get_pool_status),
    }))
}

/// The store behind each component. One backend usually serves them all.
#[derive(Clone)]
pub struct Storage {
    pub identities: Arc<dyn IdentityStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub slugs: Arc<dyn SlugStore>,
    pub banned_words: Arc<dyn BannedWordStore>,
}

impl Storage {
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: IdentityStore + SettingsStore + SlugStore + BannedWordStore + 'static,
    {
        Self {
            identities: store.clone(),
            settings: store.clone(),
            slugs: store.clone(),
            banned_words: store,
        }
    }
}

/// Application state shared across all workers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub identities: Arc<dyn IdentityStore>,
    pub settings: Arc<SettingsProvider>,
    pub slugs: Arc<SlugProvider>,
    pub banned_words: Arc<BannedWordFilter>,
    pub sampler: Arc<EligibilitySampler>,
    pub quota: Arc<QuotaEnforcer>,
    pub bypass: Arc<BypassAuthority>,
    pub auth: Arc<AuthService>,
    pub rag: Arc<RagClient>,
    pub limiter: Arc<IdentityRequestLimiter>,
    pub clock: Arc<dyn Clock>,
    db: Option<DbOperations>,
}

impl AppState {
    pub async fn new(config: Settings) -> Result<Self> {
        if config.database.in_memory {
            warn!("using in-memory storage, nothing survives a restart");
            return Self::from_parts(
                config,
                Storage::shared(Arc::new(MemoryStore::new())),
                Arc::new(SystemClock),
                Arc::new(OsRandom),
                None,
            );
        }

        let db = DbOperations::new_with_options(
            &config.database.url,
            config.database.max_connections,
            DB_ACQUIRE_TIMEOUT,
        )
        .await?;
        if config.database.run_migrations {
            db.run_migrations().await?;
            info!("database migrations applied");
        }

        Self::from_parts(
            config,
            Storage::shared(Arc::new(db.clone())),
            Arc::new(SystemClock),
            Arc::new(OsRandom),
            Some(db),
        )
    }

    /// Wires the components around the given storage, clock and random source.
    pub fn from_parts(
        config: Settings,
        storage: Storage,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
        db: Option<DbOperations>,
    ) -> Result<Self> {
        let timezone = config.timezone()?;
        let ttl = config.chatbot.settings_cache_ttl_secs.map(Duration::from_secs);
        let identities = storage.identities;
        let settings = Arc::new(SettingsProvider::new(storage.settings, ttl));
        let slugs = SlugProvider::new(storage.slugs, ttl);
        let banned_words = BannedWordFilter::new(storage.banned_words);

        let sampler = EligibilitySampler::new(
            identities.clone(),
            settings.clone(),
            clock.clone(),
            random,
        );
        let quota = QuotaEnforcer::new(identities.clone(), settings.clone(), clock.clone(), timezone);
        let bypass = BypassAuthority::new(config.chatbot.bypass_token.clone());
        if !bypass.is_enabled() {
            info!("bypass token not configured, bypass disabled");
        }
        let auth = AuthService::new(config.chatbot.jwt_secret.clone());
        let rag = RagClient::new(
            &config.chatbot.rag_api_url,
            Duration::from_secs(config.chatbot.rag_timeout_secs),
        )?;

        Ok(Self {
            config: Arc::new(config),
            identities,
            settings,
            slugs: Arc::new(slugs),
            banned_words: Arc::new(banned_words),
            sampler: Arc::new(sampler),
            quota: Arc::new(quota),
            bypass: Arc::new(bypass),
            auth: Arc::new(auth),
            rag: Arc::new(rag),
            limiter: Arc::new(IdentityRequestLimiter::hourly()),
            clock,
            db,
        })
    }

    pub async fn shutdown(&self) -> Result<()> {
        if let Some(db) = &self.db {
            db.close().await;
        }
        Ok(())
    }
}
