use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::ValidationError;
use crate::recurrence::{Period, TimeSpec};

/// Unix milliseconds, UTC. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)` with `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start <= end, "Span start must not be after end");
        Self { start, end }
    }

    pub fn try_new(start: Ms, end: Ms) -> Result<Self, ValidationError> {
        if start > end {
            return Err(ValidationError::InvertedInterval { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Closed-interval intersection test. Unlike `overlaps`, empty spans and
    /// shared endpoints count.
    pub fn touches(&self, other: &Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Smallest span covering both.
    pub fn hull(&self, other: &Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Technology {
    H323,
    Sip,
    AdobeConnect,
    SkypeForBusiness,
    Rtmp,
    WebRtc,
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Technology::H323 => "H.323",
            Technology::Sip => "SIP",
            Technology::AdobeConnect => "Adobe Connect",
            Technology::SkypeForBusiness => "Skype for Business",
            Technology::Rtmp => "RTMP",
            Technology::WebRtc => "WebRTC",
        };
        f.write_str(name)
    }
}

// ── Resources ────────────────────────────────────────────

/// Which alias providers may draw from a value-space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueScope {
    /// Any alias provider and direct value requests.
    Shared,
    /// Only alias providers declared on the same resource.
    Restricted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capability {
    RoomProviding {
        license_count: u32,
    },
    AliasProviding {
        technology: Technology,
        /// Resource whose `ValueProviding` capability backs the aliases.
        value_provider: Ulid,
    },
    ValueProviding {
        patterns: Vec<String>,
        allow_any_requested_value: bool,
        scope: ValueScope,
    },
}

impl Capability {
    pub fn label(&self) -> &'static str {
        match self {
            Capability::RoomProviding { .. } => "room-providing",
            Capability::AliasProviding { .. } => "alias-providing",
            Capability::ValueProviding { .. } => "value-providing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: String,
    pub technologies: BTreeSet<Technology>,
    /// Administratively switched off when false.
    pub allocatable: bool,
    /// How far past the reference instant the resource may be booked.
    pub maximum_future: Option<Period>,
    pub capabilities: Vec<Capability>,
}

impl Resource {
    pub fn new(id: Ulid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            technologies: BTreeSet::new(),
            allocatable: true,
            maximum_future: None,
            capabilities: Vec::new(),
        }
    }

    pub fn with_technology(mut self, technology: Technology) -> Self {
        self.technologies.insert(technology);
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Operational availability for `slot`, independent of any booking.
    pub fn available_for(&self, slot: &Span, reference: Ms) -> bool {
        if !self.allocatable {
            return false;
        }
        match &self.maximum_future {
            None => true,
            Some(period) => period
                .add_to(reference)
                .is_ok_and(|limit| slot.end <= limit),
        }
    }
}

// ── Reservations ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationKind {
    Value {
        value: String,
    },
    Alias {
        value_reservation: Ulid,
        alias_value: String,
    },
    Room {
        license_count: u32,
    },
}

/// Index key for reservations that compete with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReservationScope {
    ValueSpace(Ulid),
    Alias(Ulid),
    Room(Ulid),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub request_id: Option<Ulid>,
    pub resource_id: Ulid,
    pub slot: Span,
    pub kind: ReservationKind,
}

impl Reservation {
    pub fn scope(&self) -> ReservationScope {
        match self.kind {
            ReservationKind::Value { .. } => ReservationScope::ValueSpace(self.resource_id),
            ReservationKind::Alias { .. } => ReservationScope::Alias(self.resource_id),
            ReservationKind::Room { .. } => ReservationScope::Room(self.resource_id),
        }
    }

    /// The allocated value for value and alias reservations.
    pub fn value(&self) -> Option<&str> {
        match &self.kind {
            ReservationKind::Value { value } => Some(value),
            ReservationKind::Alias { alias_value, .. } => Some(alias_value),
            ReservationKind::Room { .. } => None,
        }
    }

    pub fn license_count(&self) -> u32 {
        match self.kind {
            ReservationKind::Room { license_count } => license_count,
            _ => 0,
        }
    }
}

// ── Requests ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Specification {
    Value {
        provider: Ulid,
        value: Option<String>,
    },
    Alias {
        technology: Technology,
        provider: Option<Ulid>,
        value: Option<String>,
    },
    Room {
        technologies: BTreeSet<Technology>,
        license_count: u32,
        provider: Option<Ulid>,
    },
}

impl Specification {
    pub fn is_room(&self) -> bool {
        matches!(self, Specification::Room { .. })
    }
}

/// One slot of an abstract request: when it starts and how long it lasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSpec {
    pub start: TimeSpec,
    pub duration: Period,
}

/// Abstract, possibly recurring request. Materialized into `ConcreteRequest`s
/// for every occurrence that falls inside the look-ahead window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSet {
    pub id: Ulid,
    pub slots: Vec<SlotSpec>,
    pub specification: Specification,
    /// Anchor for relative slot starts.
    pub created_at: Ms,
}

impl RequestSet {
    /// Whether any slot starts inside `window`. Malformed slots count as
    /// touching so pre-processing gets to report them.
    pub fn touches(&self, window: Span) -> bool {
        self.slots.iter().any(|slot| {
            slot.start
                .occurrences(self.created_at, window)
                .map_or(true, |starts| !starts.is_empty())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationState {
    NotAllocated,
    Allocated,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcreteRequest {
    pub id: Ulid,
    pub parent_id: Option<Ulid>,
    pub slot: Span,
    pub specification: Specification,
    pub state: AllocationState,
    /// Reservations currently held. Offered back as provided reservations on reallocation.
    pub reservation_ids: Vec<Ulid>,
}

impl ConcreteRequest {
    pub fn new(id: Ulid, slot: Span, specification: Specification) -> Self {
        Self {
            id,
            parent_id: None,
            slot,
            specification,
            state: AllocationState::NotAllocated,
            reservation_ids: Vec::new(),
        }
    }

    pub fn needs_allocation(&self) -> bool {
        self.state == AllocationState::NotAllocated
    }
}

/// The journal record format. One variant per stored mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ResourceSaved(Resource),
    ResourceRemoved { id: Ulid },
    RequestSetSaved(RequestSet),
    RequestSetRemoved { id: Ulid },
    RequestSaved(ConcreteRequest),
    RequestRemoved { id: Ulid },
    ReservationSaved(Reservation),
    ReservationRemoved { id: Ulid },
}
