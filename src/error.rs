use thiserror::Error;
use ulid::Ulid;

use crate::model::{Ms, Span, Technology};
use crate::recurrence::Period;

/// Malformed input rejected where it is constructed or enumerated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("interval start {start} is after end {end}")]
    InvertedInterval { start: Ms, end: Ms },
    #[error("zero period with a bounded end would repeat the same instant forever")]
    ZeroPeriod,
    #[error("recurrence without an end needs a window end to be enumerated")]
    UnboundedEnumeration,
    #[error("enumeration exceeded {0} occurrences")]
    TooManyOccurrences(usize),
    #[error("no enabled occurrence within {0} period steps")]
    StepLimitExceeded(usize),
    #[error("invalid period: {0}")]
    InvalidPeriod(String),
    #[error("invalid value for {name}: {value:?}")]
    InvalidSetting { name: &'static str, value: String },
    #[error("invalid value pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("monthly day order must be 1..=4 or -1, got {0}")]
    InvalidMonthlyDay(i8),
    #[error("timestamp out of range: {0}")]
    TimestampOutOfRange(Ms),
    #[error("slot [{}, {}) is longer than the allowed {max}", slot.start, slot.end)]
    DurationExceeded { slot: Span, max: Period },
}

/// Request-scoped allocation failure. The request is marked failed, the cycle goes on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("value {0:?} does not belong to the value-space")]
    InvalidValue(String),
    #[error("value {0:?} is already allocated")]
    ValueAlreadyAllocated(String),
    #[error("no available value left in value-space {0}")]
    NoAvailableValue(Ulid),
    #[error("no room provider can supply {requested} licenses")]
    RoomNotAvailable { requested: u32 },
    #[error("resource not found: {0}")]
    ResourceNotFound(Ulid),
    #[error("resource {resource} has no {capability} capability")]
    CapabilityMissing {
        resource: Ulid,
        capability: &'static str,
    },
    #[error("resource {0} is not available for the requested slot")]
    ResourceNotAvailable(Ulid),
    #[error("value provider {0} only serves aliases of its own resource")]
    ValueProviderRestricted(Ulid),
    #[error("no alias provider for technology {0}")]
    NoAliasProvider(Technology),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("resource already registered: {0}")]
    AlreadyExists(Ulid),
    #[error("resource not registered: {0}")]
    NotFound(Ulid),
    #[error("resource {resource} has an invalid capability: {source}")]
    InvalidCapability {
        resource: Ulid,
        source: ValidationError,
    },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("journal I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Everything that can stop a request or a whole cycle.
#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("consistency violated: {0}")]
    Consistency(String),
    #[error("cycle panicked: {0}")]
    Panicked(String),
}

impl SchedulingError {
    /// True when only the request being processed is affected.
    pub fn is_request_scoped(&self) -> bool {
        matches!(
            self,
            SchedulingError::Allocation(_) | SchedulingError::Validation(_)
        )
    }
}
