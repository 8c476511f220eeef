use chrono::Duration;
use rand::rngs::{OsRng, StdRng};
use rand::{Rng, SeedableRng};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument, warn};

use crate::eligibility::Clock;
use crate::error::DatabaseError;
use crate::identity::{Identity, IdentityStore};
use crate::settings::SettingsProvider;

/// Uniform draws in `1..=100` for the enrollment lottery.
#[cfg_attr(test, mockall::automock)]
pub trait RandomSource: Send + Sync {
    fn draw_percent(&self) -> u32;
}

/// Draws from a generator seeded by the OS CSPRNG. If the OS source is
/// unavailable it falls back to a time-seeded generator rather than failing
/// the request.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn draw_percent(&self) -> u32 {
        match StdRng::from_rng(OsRng) {
            Ok(mut rng) => rng.gen_range(1..=100),
            Err(e) => {
                warn!(error = %e, "OS random source unavailable, using time-seeded fallback");
                let seed = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or_default();
                StdRng::seed_from_u64(seed).gen_range(1..=100)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    /// Lost the lottery, or the sampling rate is zero.
    NotSampled,
    /// The active-user ceiling is already reached.
    CapacityReached,
    /// The identity row could not be written.
    CreateFailed,
}

/// Result of first contact. A decline creates no record, so the client
/// should stop asking rather than retry later.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplingOutcome {
    Enrolled(Identity),
    Declined(DeclineReason),
}

/// Decides whether a first-time visitor is enrolled into the chatbot.
pub struct EligibilitySampler {
    identities: Arc<dyn IdentityStore>,
    settings: Arc<SettingsProvider>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
}

impl EligibilitySampler {
    pub fn new(
        identities: Arc<dyn IdentityStore>,
        settings: Arc<SettingsProvider>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            identities,
            settings,
            clock,
            random,
        }
    }

    /// Runs the lottery, then the capacity check, then creates the identity.
    /// `bypass` skips both checks.
    ///
    /// The lottery runs first so excluded visitors never pay for the count.
    #[instrument(skip(self))]
    pub async fn decide(
        &self,
        ip: Option<IpAddr>,
        bypass: bool,
    ) -> Result<SamplingOutcome, DatabaseError> {
        let settings = self.settings.get().await?;
        let now = self.clock.now();

        if !bypass {
            let rate = settings.sampling_rate();
            if rate == 0 {
                return Ok(SamplingOutcome::Declined(DeclineReason::NotSampled));
            }
            let draw = self.random.draw_percent();
            if draw > rate {
                debug!(draw, rate, "visitor not sampled");
                return Ok(SamplingOutcome::Declined(DeclineReason::NotSampled));
            }

            if let Some(ceiling) = settings.active_users_limit() {
                let since = now - Duration::days(settings.active_users_limit_days());
                let active = self.identities.count_active_enrolled(since).await?;
                if active >= ceiling {
                    info!(active, ceiling, "active user ceiling reached, declining visitor");
                    return Ok(SamplingOutcome::Declined(DeclineReason::CapacityReached));
                }
            }
        }

        let cookie_expiry = now + Duration::days(settings.cookie_expiry_days());
        match self.identities.create(true, ip, cookie_expiry, now).await {
            Ok(identity) => {
                info!(id = %identity.id, bypass, "enrolled new visitor");
                Ok(SamplingOutcome::Enrolled(identity))
            }
            Err(e) => {
                warn!(error = %e, "failed to create identity, treating visitor as declined");
                Ok(SamplingOutcome::Declined(DeclineReason::CreateFailed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::eligibility::ManualClock;
    use crate::identity::MockIdentityStore;
    use chrono::Utc;

    struct FixedDraw(u32);

    impl RandomSource for FixedDraw {
        fn draw_percent(&self) -> u32 {
            self.0
        }
    }

    fn sampler_with(
        store: Arc<MemoryStore>,
        random: Arc<dyn RandomSource>,
    ) -> EligibilitySampler {
        let settings = Arc::new(SettingsProvider::new(store.clone(), None));
        EligibilitySampler::new(store, settings, Arc::new(ManualClock::new(Utc::now())), random)
    }

    #[tokio::test]
    async fn test_zero_rate_declines_without_drawing() {
        let store = Arc::new(MemoryStore::with_settings([("new_users_chatbot_rate", "0")]));
        let mut random = MockRandomSource::new();
        random.expect_draw_percent().never();
        let sampler = sampler_with(store.clone(), Arc::new(random));

        let outcome = sampler.decide(None, false).await.unwrap();
        assert_eq!(outcome, SamplingOutcome::Declined(DeclineReason::NotSampled));
        assert_eq!(store.identity_count().await, 0);
    }

    #[tokio::test]
    async fn test_draw_threshold_is_inclusive() {
        let store = Arc::new(MemoryStore::with_settings([("new_users_chatbot_rate", "30")]));

        let sampler = sampler_with(store.clone(), Arc::new(FixedDraw(30)));
        assert!(matches!(sampler.decide(None, false).await.unwrap(), SamplingOutcome::Enrolled(_)));

        let sampler = sampler_with(store.clone(), Arc::new(FixedDraw(31)));
        assert_eq!(
            sampler.decide(None, false).await.unwrap(),
            SamplingOutcome::Declined(DeclineReason::NotSampled)
        );
        assert_eq!(store.identity_count().await, 1);
    }

    #[tokio::test]
    async fn test_enrolled_identity_fields() {
        let store = Arc::new(MemoryStore::with_settings([
            ("new_users_chatbot_rate", "100"),
            ("cookie_expiry_days", "10"),
        ]));
        let sampler = sampler_with(store.clone(), Arc::new(FixedDraw(1)));
        let ip: IpAddr = "203.0.113.9".parse().unwrap();

        let SamplingOutcome::Enrolled(identity) = sampler.decide(Some(ip), false).await.unwrap() else {
            panic!("expected enrollment");
        };
        assert!(identity.enrolled);
        assert_eq!(identity.ip, Some(ip));
        assert_eq!(identity.questions_used_today, 0);
        assert_eq!(identity.cookie_expiry - identity.last_active_at, Duration::days(10));
    }

    #[tokio::test]
    async fn test_capacity_ceiling() {
        let store = Arc::new(MemoryStore::with_settings([
            ("new_users_chatbot_rate", "100"),
            ("active_users_limit", "5"),
            ("active_users_limit_days", "30"),
        ]));
        let sampler = sampler_with(store.clone(), Arc::new(FixedDraw(1)));

        for _ in 0..5 {
            assert!(matches!(sampler.decide(None, false).await.unwrap(), SamplingOutcome::Enrolled(_)));
        }
        assert_eq!(
            sampler.decide(None, false).await.unwrap(),
            SamplingOutcome::Declined(DeclineReason::CapacityReached)
        );
        assert_eq!(store.identity_count().await, 5);
    }

    #[tokio::test]
    async fn test_inactive_visitors_free_capacity() {
        let store = Arc::new(MemoryStore::with_settings([
            ("new_users_chatbot_rate", "100"),
            ("active_users_limit", "1"),
            ("active_users_limit_days", "30"),
        ]));
        let now = Utc::now();
        store
            .insert(Identity::new(true, None, now, now - Duration::days(31)))
            .await;
        let sampler = sampler_with(store, Arc::new(FixedDraw(1)));

        assert!(matches!(sampler.decide(None, false).await.unwrap(), SamplingOutcome::Enrolled(_)));
    }

    #[tokio::test]
    async fn test_bypass_ignores_rate_and_ceiling() {
        let store = Arc::new(MemoryStore::with_settings([
            ("new_users_chatbot_rate", "0"),
            ("active_users_limit", "0"),
        ]));
        let mut random = MockRandomSource::new();
        random.expect_draw_percent().never();
        let sampler = sampler_with(store, Arc::new(random));

        let outcome = sampler.decide(None, true).await.unwrap();
        assert!(matches!(outcome, SamplingOutcome::Enrolled(ref i) if i.enrolled));
    }

    #[tokio::test]
    async fn test_create_failure_declines() {
        let settings_store = Arc::new(MemoryStore::with_settings([("new_users_chatbot_rate", "100")]));
        let mut identities = MockIdentityStore::new();
        identities
            .expect_create()
            .times(1)
            .returning(|_, _, _, _| Err(DatabaseError::Duplicate));

        let sampler = EligibilitySampler::new(
            Arc::new(identities),
            Arc::new(SettingsProvider::new(settings_store, None)),
            Arc::new(ManualClock::new(Utc::now())),
            Arc::new(FixedDraw(1)),
        );

        assert_eq!(
            sampler.decide(None, false).await.unwrap(),
            SamplingOutcome::Declined(DeclineReason::CreateFailed)
        );
    }

    #[tokio::test]
    async fn test_count_failure_propagates() {
        let settings_store = Arc::new(MemoryStore::with_settings([
            ("new_users_chatbot_rate", "100"),
            ("active_users_limit", "10"),
        ]));
        let mut identities = MockIdentityStore::new();
        identities
            .expect_count_active_enrolled()
            .returning(|_| Err(DatabaseError::ConnectionError("refused".into())));
        identities.expect_create().never();

        let sampler = EligibilitySampler::new(
            Arc::new(identities),
            Arc::new(SettingsProvider::new(settings_store, None)),
            Arc::new(ManualClock::new(Utc::now())),
            Arc::new(FixedDraw(1)),
        );

        assert!(sampler.decide(None, false).await.is_err());
    }

    #[tokio::test]
    async fn test_sampling_rate_is_respected_statistically() {
        let store = Arc::new(MemoryStore::with_settings([("new_users_chatbot_rate", "30")]));
        let sampler = sampler_with(store.clone(), Arc::new(OsRandom));

        const RUNS: usize = 100_000;
        let mut enrolled = 0usize;
        for _ in 0..RUNS {
            if let SamplingOutcome::Enrolled(_) = sampler.decide(None, false).await.unwrap() {
                enrolled += 1;
            }
        }

        let fraction = enrolled as f64 / RUNS as f64;
        assert!((fraction - 0.30).abs() < 0.02, "enrolled fraction was {}", fraction);
        assert_eq!(store.identity_count().await, enrolled);
    }

    #[test]
    fn test_os_random_stays_in_range() {
        for _ in 0..1_000 {
            let draw = OsRandom.draw_percent();
            assert!((1..=100).contains(&draw));
        }
    }
}
