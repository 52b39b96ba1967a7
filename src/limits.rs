use crate::model::Ms;

/// Occurrences a single enumeration may produce inside its window.
pub const MAX_ENUMERATED_COUNT: usize = 1000;

/// Disabled occurrences an earliest-occurrence search walks past before giving up.
pub const MAX_ENUMERATION_STEPS: usize = 100_000;

/// 0001-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP: Ms = -62_135_596_800_000;

/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP: Ms = 253_402_300_799_999;

/// Look-ahead windows start on a whole hour so consecutive cycles see the same window.
pub const LOOKAHEAD_GRANULARITY: Ms = 3_600_000;

/// An existing child request matches an occurrence if their starts are at most this far apart.
pub const CHILD_MATCH_TOLERANCE: Ms = 24 * 3_600_000;

/// Widest `{digit:N}` component a value pattern may declare.
pub const MAX_DIGIT_WIDTH: u32 = 10;
