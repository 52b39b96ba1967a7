use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Months, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::limits::{MAX_VALID_TIMESTAMP, MIN_VALID_TIMESTAMP};
use crate::model::Ms;

const SECOND: i64 = 1_000;
const MINUTE: i64 = 60 * SECOND;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;

/// Calendar-aware duration. Years and months follow the calendar (clamping
/// to the last day of shorter months), everything else is fixed length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    pub years: i32,
    pub months: i32,
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
}

impl Period {
    pub const ZERO: Period = Period {
        years: 0,
        months: 0,
        days: 0,
        hours: 0,
        minutes: 0,
        seconds: 0,
    };

    pub fn years(n: i32) -> Self {
        Self { years: n, ..Self::ZERO }
    }

    pub fn months(n: i32) -> Self {
        Self { months: n, ..Self::ZERO }
    }

    pub fn weeks(n: i64) -> Self {
        Self::days(7 * n)
    }

    pub fn days(n: i64) -> Self {
        Self { days: n, ..Self::ZERO }
    }

    pub fn hours(n: i64) -> Self {
        Self { hours: n, ..Self::ZERO }
    }

    pub fn minutes(n: i64) -> Self {
        Self { minutes: n, ..Self::ZERO }
    }

    pub fn seconds(n: i64) -> Self {
        Self { seconds: n, ..Self::ZERO }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.years < 0
            || self.months < 0
            || self.days < 0
            || self.hours < 0
            || self.minutes < 0
            || self.seconds < 0
    }

    fn total_months(&self) -> i64 {
        i64::from(self.years) * 12 + i64::from(self.months)
    }

    /// The day/hour/minute/second part in milliseconds.
    fn fixed_ms(&self) -> Option<i64> {
        self.days
            .checked_mul(DAY)?
            .checked_add(self.hours.checked_mul(HOUR)?)?
            .checked_add(self.minutes.checked_mul(MINUTE)?)?
            .checked_add(self.seconds.checked_mul(SECOND)?)
    }

    /// Length in milliseconds, only defined for positive periods without a calendar part.
    pub fn fixed_length(&self) -> Option<Ms> {
        if self.total_months() != 0 {
            return None;
        }
        self.fixed_ms().filter(|ms| *ms > 0)
    }

    pub fn to_std_duration(&self) -> Option<std::time::Duration> {
        let ms = u64::try_from(self.fixed_length()?).ok()?;
        Some(std::time::Duration::from_millis(ms))
    }

    pub fn add_to(&self, t: Ms) -> Result<Ms, ValidationError> {
        let out_of_range = || ValidationError::TimestampOutOfRange(t);
        let dt = DateTime::<Utc>::from_timestamp_millis(t).ok_or_else(out_of_range)?;

        let months = self.total_months();
        let magnitude = Months::new(u32::try_from(months.unsigned_abs()).map_err(|_| out_of_range())?);
        let dt = if months >= 0 {
            dt.checked_add_months(magnitude)
        } else {
            dt.checked_sub_months(magnitude)
        }
        .ok_or_else(out_of_range)?;

        let fixed = self
            .fixed_ms()
            .and_then(TimeDelta::try_milliseconds)
            .ok_or_else(out_of_range)?;
        let shifted = dt
            .checked_add_signed(fixed)
            .ok_or_else(out_of_range)?
            .timestamp_millis();

        if !(MIN_VALID_TIMESTAMP..=MAX_VALID_TIMESTAMP).contains(&shifted) {
            return Err(ValidationError::TimestampOutOfRange(shifted));
        }
        Ok(shifted)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str("PT0S");
        }
        f.write_str("P")?;
        for (n, unit) in [(i64::from(self.years), 'Y'), (i64::from(self.months), 'M'), (self.days, 'D')] {
            if n != 0 {
                write!(f, "{n}{unit}")?;
            }
        }
        if self.hours != 0 || self.minutes != 0 || self.seconds != 0 {
            f.write_str("T")?;
            for (n, unit) in [(self.hours, 'H'), (self.minutes, 'M'), (self.seconds, 'S')] {
                if n != 0 {
                    write!(f, "{n}{unit}")?;
                }
            }
        }
        Ok(())
    }
}

/// ISO-8601 period: `PnYnMnWnDTnHnMnS`. Weeks fold into days.
impl FromStr for Period {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidPeriod(s.to_string());
        let upper = s.trim().to_ascii_uppercase();
        let body = upper.strip_prefix('P').ok_or_else(invalid)?;
        if body.is_empty() || body.ends_with('T') {
            return Err(invalid());
        }

        let mut period = Period::ZERO;
        let mut in_time = false;
        let mut digits = String::new();
        for c in body.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            if c == 'T' {
                if in_time || !digits.is_empty() {
                    return Err(invalid());
                }
                in_time = true;
                continue;
            }
            let n: i64 = digits.parse().map_err(|_| invalid())?;
            digits.clear();
            match (in_time, c) {
                (false, 'Y') => period.years = i32::try_from(n).map_err(|_| invalid())?,
                (false, 'M') => period.months = i32::try_from(n).map_err(|_| invalid())?,
                (false, 'W') => period.days += n.checked_mul(7).ok_or_else(invalid)?,
                (false, 'D') => period.days += n,
                (true, 'H') => period.hours = n,
                (true, 'M') => period.minutes = n,
                (true, 'S') => period.seconds = n,
                _ => return Err(invalid()),
            }
        }
        if !digits.is_empty() {
            return Err(invalid());
        }
        Ok(period)
    }
}
