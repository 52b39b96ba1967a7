use std::path::PathBuf;
use std::time::Duration;

use crate::error::ValidationError;
use crate::recurrence::Period;

/// Identity of the local deployment. Handed to the coordinator at
/// construction and stamped on every notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainContext {
    pub name: String,
}

impl DomainContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Immutable settings of the scheduling coordinator.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between cycle starts.
    pub worker_period: Duration,
    /// Size of the rolling look-ahead window.
    pub lookahead: Period,
    /// Longest slot a room request may ask for.
    pub room_max_duration: Period,
    pub domain: DomainContext,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_period: Duration::from_secs(30),
            lookahead: Period::days(31),
            room_max_duration: Period::days(1),
            domain: DomainContext::new("local"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub data_dir: PathBuf,
    /// Journal appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Result<Self, ValidationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ValidationError> {
        let defaults = SchedulerConfig::default();

        let worker_period = match lookup("ALLOTTER_WORKER_PERIOD") {
            Some(raw) => raw
                .parse::<Period>()?
                .to_std_duration()
                .ok_or(ValidationError::InvalidPeriod(raw))?,
            None => defaults.worker_period,
        };
        let lookahead = parse_period(lookup("ALLOTTER_LOOKAHEAD"), defaults.lookahead)?;
        let room_max_duration = parse_period(lookup("ALLOTTER_ROOM_MAX_DURATION"), defaults.room_max_duration)?;
        let domain = lookup("ALLOTTER_DOMAIN")
            .map(DomainContext::new)
            .unwrap_or(defaults.domain);

        let data_dir = lookup("ALLOTTER_DATA_DIR").unwrap_or_else(|| "./data".into());
        let compact_threshold = match lookup("ALLOTTER_COMPACT_THRESHOLD") {
            Some(raw) => parse_number("ALLOTTER_COMPACT_THRESHOLD", raw)?,
            None => 1000,
        };
        let metrics_port = lookup("ALLOTTER_METRICS_PORT")
            .map(|raw| parse_number("ALLOTTER_METRICS_PORT", raw))
            .transpose()?;

        Ok(Self {
            scheduler: SchedulerConfig {
                worker_period,
                lookahead,
                room_max_duration,
                domain,
            },
            data_dir: PathBuf::from(data_dir),
            compact_threshold,
            metrics_port,
        })
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, raw: String) -> Result<T, ValidationError> {
    raw.trim()
        .parse()
        .map_err(|_| ValidationError::InvalidSetting { name, value: raw })
}

fn parse_period(raw: Option<String>, default: Period) -> Result<Period, ValidationError> {
    let Some(raw) = raw else { return Ok(default) };
    let period: Period = raw.parse()?;
    if period.is_zero() || period.is_negative() {
        return Err(ValidationError::InvalidPeriod(raw));
    }
    Ok(period)
}
