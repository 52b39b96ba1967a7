mod period;

pub use period::Period;

use chrono::{DateTime, Datelike, Months, NaiveDate, TimeDelta, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::limits::{MAX_ENUMERATED_COUNT, MAX_ENUMERATION_STEPS, MAX_VALID_TIMESTAMP};
use crate::model::{Ms, Span};

// ── Rules ────────────────────────────────────────────────

/// What an enable/disable rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleTarget {
    /// Exact-instant match.
    Instant(Ms),
    /// Closed interval `[from, to]`.
    Interval { from: Ms, to: Ms },
}

impl RuleTarget {
    pub fn matches(&self, t: Ms) -> bool {
        match *self {
            RuleTarget::Instant(at) => at == t,
            RuleTarget::Interval { from, to } => from <= t && t <= to,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match *self {
            RuleTarget::Interval { from, to } if from > to => {
                Err(ValidationError::InvertedInterval { start: from, end: to })
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecurrenceRule {
    /// Out-of-pattern occurrence.
    Extra(Ms),
    Enable(RuleTarget),
    Disable(RuleTarget),
}

/// "The n-th weekday of each month", `order` in `1..=4`, or `-1` for the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyDay {
    pub order: i8,
    pub weekday: Weekday,
}

// ── Periodic specification ───────────────────────────────

/// A start instant repeated every `period` until `end`, corrected by `rules`.
///
/// Equality compares the enumerated schedules: two specs with different rule
/// lists that produce the same occurrences are equal. Specs without an end
/// cannot be fully enumerated and fall back to structural comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicTimeSpec {
    pub start: Option<Ms>,
    pub period: Period,
    pub end: Option<Ms>,
    pub monthly_day: Option<MonthlyDay>,
    pub rules: Vec<RecurrenceRule>,
}

impl PeriodicTimeSpec {
    pub fn new(start: Ms, period: Period) -> Self {
        Self {
            start: Some(start),
            period,
            end: None,
            monthly_day: None,
            rules: Vec::new(),
        }
    }

    /// The empty spec. Enumerates to nothing.
    pub fn empty() -> Self {
        Self {
            start: None,
            period: Period::ZERO,
            end: None,
            monthly_day: None,
            rules: Vec::new(),
        }
    }

    pub fn until(mut self, end: Ms) -> Self {
        self.end = Some(end);
        self
    }

    pub fn monthly_on(mut self, order: i8, weekday: Weekday) -> Self {
        self.monthly_day = Some(MonthlyDay { order, weekday });
        self
    }

    pub fn with_rule(mut self, rule: RecurrenceRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// A zero period without a monthly rule yields the start instant only.
    fn is_single(&self) -> bool {
        self.period.is_zero() && self.monthly_day.is_none()
    }

    /// Enumerable without a window.
    pub fn is_finite(&self) -> bool {
        self.end.is_some() || self.is_single()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let (Some(start), Some(end)) = (self.start, self.end)
            && start > end
        {
            return Err(ValidationError::InvertedInterval { start, end });
        }
        if self.period.is_negative() {
            return Err(ValidationError::InvalidPeriod(self.period.to_string()));
        }
        if self.is_single() && self.end.is_some() {
            return Err(ValidationError::ZeroPeriod);
        }
        if let Some(day) = self.monthly_day
            && !matches!(day.order, 1..=4 | -1)
        {
            return Err(ValidationError::InvalidMonthlyDay(day.order));
        }
        for rule in &self.rules {
            if let RecurrenceRule::Enable(target) | RecurrenceRule::Disable(target) = rule {
                target.validate()?;
            }
        }
        Ok(())
    }

    /// Enabled state of a single instant: the last enable/disable rule that
    /// covers it decides, declaration order being the only tie-break.
    pub fn is_enabled(&self, t: Ms) -> bool {
        self.rules
            .iter()
            .rev()
            .find_map(|rule| match rule {
                RecurrenceRule::Enable(target) if target.matches(t) => Some(true),
                RecurrenceRule::Disable(target) if target.matches(t) => Some(false),
                _ => None,
            })
            .unwrap_or(true)
    }

    /// Latest series instant not after `target`, reached by arithmetic when
    /// the period has a fixed length. Calendar periods start from `start`.
    fn skip_to(&self, start: Ms, target: Ms) -> Ms {
        let target = target.min(MAX_VALID_TIMESTAMP);
        match (self.monthly_day, self.period.fixed_length()) {
            (None, Some(len)) if target > start => target
                .checked_sub(start)
                .map_or(start, |gap| start + gap / len * len),
            _ => start,
        }
    }

    /// Next occurrence after `current` in period arithmetic.
    fn step(&self, current: Ms) -> Result<Ms, ValidationError> {
        match self.monthly_day {
            Some(day) => next_monthly(current, day),
            None => self.period.add_to(current),
        }
    }

    /// Ordered, enabled occurrences inside `[window_from, window_to]`.
    ///
    /// Walks the period series from `start` (bounded by `end`, or by
    /// `window_to` when there is no end), adds every `Extra` that falls in the
    /// window, then drops occurrences whose last matching rule disables them.
    /// Fixed-length series jump straight to `window_from`; only occurrences
    /// inside the window count towards the cap.
    pub fn enumerate(
        &self,
        window_from: Option<Ms>,
        window_to: Option<Ms>,
    ) -> Result<Vec<Ms>, ValidationError> {
        self.validate()?;
        if let (Some(from), Some(to)) = (window_from, window_to)
            && from > to
        {
            return Err(ValidationError::InvertedInterval { start: from, end: to });
        }
        let Some(start) = self.start else {
            return Ok(Vec::new());
        };
        let in_window = |t: Ms| {
            window_from.is_none_or(|from| t >= from) && window_to.is_none_or(|to| t <= to)
        };

        let mut occurrences = Vec::new();
        if self.is_single() {
            if in_window(start) {
                occurrences.push(start);
            }
        } else {
            if self.end.is_none() && window_to.is_none() {
                return Err(ValidationError::UnboundedEnumeration);
            }
            let mut current = window_from.map_or(start, |from| self.skip_to(start, from));
            loop {
                if self.end.is_some_and(|end| current > end)
                    || window_to.is_some_and(|to| current > to)
                {
                    break;
                }
                if in_window(current) {
                    occurrences.push(current);
                    if occurrences.len() > MAX_ENUMERATED_COUNT {
                        return Err(ValidationError::TooManyOccurrences(MAX_ENUMERATED_COUNT));
                    }
                }
                let next = self.step(current)?;
                if next <= current {
                    break;
                }
                current = next;
            }
        }

        for rule in &self.rules {
            if let RecurrenceRule::Extra(t) = *rule
                && in_window(t)
            {
                occurrences.push(t);
            }
        }
        if occurrences.len() > MAX_ENUMERATED_COUNT {
            return Err(ValidationError::TooManyOccurrences(MAX_ENUMERATED_COUNT));
        }

        occurrences.retain(|&t| self.is_enabled(t));
        occurrences.sort_unstable();
        occurrences.dedup();
        Ok(occurrences)
    }

    /// First enabled occurrence at or after `reference`. Fails with
    /// `StepLimitExceeded` when more than `MAX_ENUMERATION_STEPS` disabled
    /// occurrences follow `reference`.
    pub fn earliest_occurrence_after(&self, reference: Ms) -> Result<Option<Ms>, ValidationError> {
        self.validate()?;
        let Some(start) = self.start else {
            return Ok(None);
        };

        let extra = self
            .rules
            .iter()
            .filter_map(|rule| match *rule {
                RecurrenceRule::Extra(t) if t >= reference && self.is_enabled(t) => Some(t),
                _ => None,
            })
            .min();

        let mut generated = None;
        if self.is_single() {
            if start >= reference && self.is_enabled(start) {
                generated = Some(start);
            }
        } else {
            let mut current = self.skip_to(start, reference);
            let mut skipped = 0usize;
            loop {
                if self.end.is_some_and(|end| current > end) {
                    break;
                }
                // Nothing generated from here on can beat an earlier extra.
                if extra.is_some_and(|t| current >= t) {
                    break;
                }
                if current >= reference {
                    if self.is_enabled(current) {
                        generated = Some(current);
                        break;
                    }
                    skipped += 1;
                    if skipped > MAX_ENUMERATION_STEPS {
                        return Err(ValidationError::StepLimitExceeded(MAX_ENUMERATION_STEPS));
                    }
                }
                let next = self.step(current)?;
                if next <= current {
                    break;
                }
                current = next;
            }
        }

        Ok(match (generated, extra) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    /// Whether both specs produce the same occurrences.
    pub fn same_schedule(&self, other: &PeriodicTimeSpec) -> bool {
        if self.is_finite()
            && other.is_finite()
            && let (Ok(a), Ok(b)) = (self.enumerate(None, None), other.enumerate(None, None))
        {
            return a == b;
        }
        self.start == other.start
            && self.period == other.period
            && self.end == other.end
            && self.monthly_day == other.monthly_day
            && self.rules == other.rules
    }
}

impl PartialEq for PeriodicTimeSpec {
    fn eq(&self, other: &Self) -> bool {
        self.same_schedule(other)
    }
}

/// The `day.order`-th `day.weekday` of the month after `current`, same time of day.
fn next_monthly(current: Ms, day: MonthlyDay) -> Result<Ms, ValidationError> {
    let out_of_range = || ValidationError::TimestampOutOfRange(current);
    let dt = DateTime::<Utc>::from_timestamp_millis(current).ok_or_else(out_of_range)?;
    let first_of_month = NaiveDate::from_ymd_opt(dt.year(), dt.month(), 1)
        .and_then(|d| d.checked_add_months(Months::new(1)))
        .ok_or_else(out_of_range)?;
    let last_of_month = first_of_month
        .checked_add_months(Months::new(1))
        .and_then(|d| d.pred_opt())
        .ok_or_else(out_of_range)?;

    let date = if day.order == -1 {
        let back = (last_of_month.weekday().num_days_from_monday() + 7
            - day.weekday.num_days_from_monday())
            % 7;
        last_of_month - TimeDelta::days(i64::from(back))
    } else {
        let ahead = (day.weekday.num_days_from_monday() + 7
            - first_of_month.weekday().num_days_from_monday())
            % 7;
        let mut date = first_of_month + TimeDelta::days(i64::from(ahead));
        for _ in 1..day.order {
            let later = date + TimeDelta::days(7);
            if later <= last_of_month {
                date = later;
            }
        }
        date
    };

    Ok(date.and_time(dt.time()).and_utc().timestamp_millis())
}

// ── Time specification sum type ──────────────────────────

/// When something starts: a fixed instant, an offset from a reference, or a
/// recurring schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimeSpec {
    Absolute(Ms),
    Relative(Period),
    Periodic(PeriodicTimeSpec),
}

impl TimeSpec {
    pub fn earliest_occurrence_after(&self, reference: Ms) -> Result<Option<Ms>, ValidationError> {
        match self {
            TimeSpec::Absolute(t) => Ok((*t >= reference).then_some(*t)),
            TimeSpec::Relative(period) => period.add_to(reference).map(Some),
            TimeSpec::Periodic(spec) => spec.earliest_occurrence_after(reference),
        }
    }

    /// Occurrence starts inside the closed `window`. Relative specs resolve against `anchor`.
    pub fn occurrences(&self, anchor: Ms, window: Span) -> Result<Vec<Ms>, ValidationError> {
        let single = |t: Ms| {
            if window.start <= t && t <= window.end {
                vec![t]
            } else {
                Vec::new()
            }
        };
        match self {
            TimeSpec::Absolute(t) => Ok(single(*t)),
            TimeSpec::Relative(period) => Ok(single(period.add_to(anchor)?)),
            TimeSpec::Periodic(spec) => spec.enumerate(Some(window.start), Some(window.end)),
        }
    }
}
