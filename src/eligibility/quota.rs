use chrono_tz::Tz;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::eligibility::{clock, Clock};
use crate::error::{AppError, DatabaseError};
use crate::identity::{Identity, IdentityStore, VisitorId};
use crate::settings::{GeneralSettings, SettingsProvider};

/// Reported for callers holding the no-limits right. It means "one more is
/// permitted", re-evaluated on every call; it is not an unlimited marker.
pub const UNLIMITED_REMAINING: i64 = 1;

/// Daily question accounting for enrolled visitors.
///
/// "Today" is the calendar day in one fixed reference timezone, shared by
/// every visitor.
pub struct QuotaEnforcer {
    identities: Arc<dyn IdentityStore>,
    settings: Arc<SettingsProvider>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
}

impl QuotaEnforcer {
    pub fn new(
        identities: Arc<dyn IdentityStore>,
        settings: Arc<SettingsProvider>,
        clock: Arc<dyn Clock>,
        timezone: Tz,
    ) -> Self {
        Self {
            identities,
            settings,
            clock,
            timezone,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Questions left today for an already-loaded identity. May be zero or
    /// negative; callers treat anything `<= 0` as exhausted.
    pub fn remaining_for(&self, identity: &Identity, settings: &GeneralSettings, unlimited: bool) -> i64 {
        if unlimited {
            return UNLIMITED_REMAINING;
        }
        let daily_limit = settings.questions_daily_limit();
        let now = self.clock.now();
        if !clock::same_calendar_day(identity.last_active_at, now, self.timezone) {
            return daily_limit;
        }
        daily_limit - identity.questions_used_today
    }

    pub async fn questions_remaining(&self, id: &VisitorId, unlimited: bool) -> Result<i64, AppError> {
        if unlimited {
            return Ok(UNLIMITED_REMAINING);
        }
        let identity = self
            .identities
            .find(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no identity for {}", id)))?;
        let settings = self.settings.get().await?;
        Ok(self.remaining_for(&identity, &settings, false))
    }

    /// Debits one question. Call once per accepted question, after the
    /// remaining-quota check. An unknown id is ignored: the record may not
    /// be visible yet to this request.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn consume_question(&self, id: &VisitorId) -> Result<(), DatabaseError> {
        let now = self.clock.now();
        let day_start = clock::day_start(now, self.timezone);
        let updated = self
            .identities
            .record_question_use(id, day_start, now)
            .await?;
        if !updated {
            debug!("no identity to debit, ignoring");
        }
        Ok(())
    }
}
