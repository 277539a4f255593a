//! Per-channel throughput limiting.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use thiserror::Error;

use crate::channel::RateLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RateLimitExceeded {
    #[error("daily request cap reached")]
    Daily,
    #[error("monthly request cap reached")]
    Monthly,
}

#[derive(Debug)]
struct LimiterState {
    next_slot: Option<Instant>,
    day: Option<NaiveDate>,
    day_count: u64,
    month: Option<(i32, u32)>,
    month_count: u64,
}

/// Paces requests to `max_requests_per_second` and enforces daily/monthly caps.
///
/// `acquire` reserves a slot and returns how long the caller must wait before
/// issuing the request. Cap exhaustion is reported as an error: the channel is
/// treated as unreachable and work stays queued.
#[derive(Debug)]
pub struct RateLimiter {
    limits: RateLimits,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(LimiterState {
                next_slot: None,
                day: None,
                day_count: 0,
                month: None,
                month_count: 0,
            }),
        }
    }

    fn min_interval(&self) -> Option<Duration> {
        self.limits
            .max_requests_per_second
            .filter(|rps| *rps > 0.0)
            .map(|rps| Duration::from_secs_f64(1.0 / rps))
    }

    fn roll_windows(state: &mut LimiterState, now: DateTime<Utc>) {
        let today = now.date_naive();
        if state.day != Some(today) {
            state.day = Some(today);
            state.day_count = 0;
        }
        let month = (now.year(), now.month());
        if state.month != Some(month) {
            state.month = Some(month);
            state.month_count = 0;
        }
    }

    fn check_caps(&self, state: &LimiterState) -> Result<(), RateLimitExceeded> {
        if self.limits.daily_limit.is_some_and(|cap| state.day_count >= cap) {
            return Err(RateLimitExceeded::Daily);
        }
        if self.limits.monthly_limit.is_some_and(|cap| state.month_count >= cap) {
            return Err(RateLimitExceeded::Monthly);
        }
        Ok(())
    }

    /// Whether a daily/monthly cap currently blocks the channel.
    pub fn is_exhausted(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Self::roll_windows(&mut state, now);
        self.check_caps(&state).is_err()
    }

    /// Reserve one request slot. Returns the delay to wait before sending.
    pub fn acquire(&self, now: DateTime<Utc>, mono: Instant) -> Result<Duration, RateLimitExceeded> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Self::roll_windows(&mut state, now);
        self.check_caps(&state)?;

        state.day_count += 1;
        state.month_count += 1;

        let Some(interval) = self.min_interval() else {
            return Ok(Duration::ZERO);
        };

        let slot = match state.next_slot {
            Some(next) if next > mono => next,
            _ => mono,
        };
        state.next_slot = Some(slot + interval);
        Ok(slot.saturating_duration_since(mono))
    }

    /// Requests counted in the current day window.
    pub fn used_today(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .day_count
    }
}
