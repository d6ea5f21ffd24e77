use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::FireWindow;
use crate::error::{Result, SchedulerError};

/// Longest accepted interval (about 100 years).
const MAX_INTERVAL_MS: u64 = 100 * 366 * 24 * 60 * 60 * 1000;

/// Fires at `start + n × interval` for n = 0, 1, 2, ...
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleSchedule {
    pub interval_ms: u64,
    /// Repeats after the first firing; `None` repeats forever.
    #[serde(default)]
    pub repeat_count: Option<u32>,
}

impl SimpleSchedule {
    /// Repeat forever.
    pub fn every(interval: std::time::Duration) -> Self {
        Self {
            interval_ms: interval.as_millis().try_into().unwrap_or(u64::MAX),
            repeat_count: None,
        }
    }

    /// Fire once, then `repeat_count` more times.
    pub fn repeat(interval: std::time::Duration, repeat_count: u32) -> Self {
        Self {
            repeat_count: Some(repeat_count),
            ..Self::every(interval)
        }
    }

    /// Fire exactly once, at the trigger's start time.
    pub fn once() -> Self {
        Self {
            interval_ms: 0,
            repeat_count: Some(0),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.repeat_count != Some(0) && self.interval_ms == 0 {
            return Err(SchedulerError::InvalidSchedule(
                "repeat interval must be greater than zero".to_string(),
            ));
        }
        if self.interval_ms > MAX_INTERVAL_MS {
            return Err(SchedulerError::InvalidSchedule(format!(
                "repeat interval of {}ms is too large",
                self.interval_ms
            )));
        }
        Ok(())
    }

    fn interval(&self) -> i64 {
        // validate() bounds the interval well inside i64.
        self.interval_ms as i64
    }

    fn nth(&self, start: DateTime<Utc>, n: i64) -> Option<DateTime<Utc>> {
        let offset = n.checked_mul(self.interval())?;
        start.checked_add_signed(Duration::milliseconds(offset))
    }

    pub(crate) fn fire_time_after(
        &self,
        after: DateTime<Utc>,
        window: &FireWindow,
    ) -> Option<DateTime<Utc>> {
        if after < window.start {
            return Some(window.start);
        }
        if self.repeat_count == Some(0) || self.interval_ms == 0 {
            return None;
        }
        let elapsed = (after - window.start).num_milliseconds();
        let n = elapsed / self.interval() + 1;
        if let Some(limit) = self.repeat_count {
            if n > i64::from(limit) {
                return None;
            }
        }
        self.nth(window.start, n)
    }

    pub(crate) fn fire_time_before(
        &self,
        bound: DateTime<Utc>,
        window: &FireWindow,
    ) -> Option<DateTime<Utc>> {
        if self.repeat_count == Some(0) || self.interval_ms == 0 {
            return Some(window.start);
        }
        let elapsed = (bound - window.start).num_milliseconds();
        let mut n = elapsed / self.interval();
        if let Some(limit) = self.repeat_count {
            n = n.min(i64::from(limit));
        }
        self.nth(window.start, n)
    }

    pub(crate) fn final_fire_time(&self, window: &FireWindow) -> Option<DateTime<Utc>> {
        match (self.repeat_count, window.end) {
            (None, None) => None,
            (Some(limit), None) => self.nth(window.start, i64::from(limit)),
            (_, Some(end)) if end < window.start => None,
            (_, Some(end)) => self.fire_time_before(end, window),
        }
    }

    pub(crate) fn may_fire_again(&self, times_triggered: u32) -> bool {
        self.repeat_count
            .map_or(true, |limit| times_triggered <= limit)
    }

    /// Whole intervals between two fire times; the number of firings a
    /// trigger sitting at `from` has missed by `to`.
    pub(crate) fn fires_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> u32 {
        if to <= from || self.interval_ms == 0 {
            return 0;
        }
        let n = (to - from).num_milliseconds() / self.interval();
        u32::try_from(n).unwrap_or(u32::MAX)
    }
}
