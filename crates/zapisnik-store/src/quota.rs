//! Rolling weekly quota per (user, feature)
//!
//! Built entirely on the [`RecordStore`] contract: the window start and
//! counter live in `{feature}_time` / `{feature}_counter` fields, so the
//! quota survives restarts with whatever backend is in use.
//!
//! Check and commit are split on purpose. The caller checks, performs the
//! metered action, and commits only once it verifiably succeeded - a
//! failed transcription must not burn quota. The price is that two
//! back-to-back requests from the same user can both see `Allowed` before
//! either commits. Fine for one chat session at a time; not a fence
//! under true concurrency.

use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use crate::{FieldValue, RecordStore, StoreError, UserId};

/// Length of the rolling window in seconds.
pub const WEEK_SECONDS: i64 = 7 * 24 * 60 * 60;

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// Under the limit; `used` is the count before this request.
    Allowed { used: i64 },
    /// Limit reached; the window resets at this unix timestamp.
    Denied { resets_at: i64 },
}

/// Weekly usage counter on top of a [`RecordStore`].
#[derive(Clone)]
pub struct QuotaTracker {
    store: Arc<dyn RecordStore>,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Evaluate the current window against `limit`, resetting an expired
    /// window first. Does not consume anything; call [`commit`] after the
    /// metered action succeeds.
    ///
    /// [`commit`]: QuotaTracker::commit
    pub fn check(&self, user: UserId, feature: &str, limit: i64) -> Result<QuotaDecision, StoreError> {
        self.check_at(user, feature, limit, Utc::now().timestamp())
    }

    pub fn check_at(
        &self,
        user: UserId,
        feature: &str,
        limit: i64,
        now: i64,
    ) -> Result<QuotaDecision, StoreError> {
        let time_field = format!("{feature}_time");
        let counter_field = format!("{feature}_counter");

        let start = self
            .store
            .get_field(user, &time_field)?
            .and_then(|v| v.as_i64());

        let start = match start {
            Some(s) if now - s < WEEK_SECONDS => s,
            _ => {
                // new user or expired window: reset atomically to (now, 0)
                // before evaluating this request
                self.store.set_field(user, &time_field, FieldValue::Integer(now))?;
                self.store
                    .set_field(user, &counter_field, FieldValue::Integer(0))?;
                debug!(user = user.0, feature, "quota window reset");
                now
            }
        };

        let used = self
            .store
            .get_field(user, &counter_field)?
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        if used < limit {
            Ok(QuotaDecision::Allowed { used })
        } else {
            Ok(QuotaDecision::Denied {
                resets_at: start + WEEK_SECONDS,
            })
        }
    }

    /// Count one use. Only call after the metered action succeeded.
    pub fn commit(&self, user: UserId, feature: &str) -> Result<(), StoreError> {
        self.commit_at(user, feature, Utc::now().timestamp())
    }

    pub fn commit_at(&self, user: UserId, feature: &str, now: i64) -> Result<(), StoreError> {
        let time_field = format!("{feature}_time");
        let counter_field = format!("{feature}_counter");

        // Guard against a commit landing without a prior check ever having
        // opened a window (e.g. fields wiped between check and commit).
        if self.store.get_field(user, &time_field)?.is_none() {
            self.store.set_field(user, &time_field, FieldValue::Integer(now))?;
        }

        let used = self
            .store
            .get_field(user, &counter_field)?
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        self.store
            .set_field(user, &counter_field, FieldValue::Integer(used + 1))?;
        debug!(user = user.0, feature, used = used + 1, "quota committed");
        Ok(())
    }
}
