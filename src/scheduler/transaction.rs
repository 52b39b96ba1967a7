use std::collections::{HashMap, HashSet};

use ulid::Ulid;

use crate::cache::{AvailabilityCache, AvailabilityContext, RoomProvider, ValueProvider};
use crate::error::{AllocationError, SchedulingError};
use crate::model::*;
use crate::storage::Storage;

/// Result of `get_available_value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableValue {
    pub value: String,
    /// The pending reservation recorded for the value.
    pub reservation: Reservation,
    /// Set when a provided reservation was reused instead of claiming a new value.
    pub source_reservation: Option<Ulid>,
}

/// License usage of one room provider over a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailableRoom {
    pub max_licenses: u32,
    pub used_licenses: u32,
    pub available_licenses: u32,
}

/// What a finished request keeps and gives back.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    pub reservations: Vec<Reservation>,
    /// Provided reservations the request no longer needs.
    pub released: Vec<Ulid>,
}

struct Loaded {
    span: Span,
    reservations: Vec<Reservation>,
}

struct Pending {
    request_id: Ulid,
    reservation: Reservation,
}

/// Per-run ledger over storage-committed and in-run reservations.
///
/// Storage is read at most once per scope (re-read only when a later slot
/// reaches outside what was loaded). Decisions are recorded as pending so
/// every later question in the same run sees them. One transaction serves
/// one scheduling pass and is dropped at its end.
pub struct AllocationTransaction<'a> {
    storage: &'a dyn Storage,
    cache: &'a AvailabilityCache,
    interval: Span,
    reference: Ms,
    loaded: HashMap<ReservationScope, Loaded>,
    pending: Vec<Pending>,
    released: HashSet<Ulid>,
    current: Option<Ulid>,
    provided: Vec<Reservation>,
}

impl<'a> AllocationTransaction<'a> {
    pub fn new(storage: &'a dyn Storage, cache: &'a AvailabilityCache, interval: Span, reference: Ms) -> Self {
        Self {
            storage,
            cache,
            interval,
            reference,
            loaded: HashMap::new(),
            pending: Vec::new(),
            released: HashSet::new(),
            current: None,
            provided: Vec::new(),
        }
    }

    pub fn interval(&self) -> Span {
        self.interval
    }

    pub fn reference(&self) -> Ms {
        self.reference
    }

    /// Start working on `request_id`, which already holds `provided`.
    pub fn begin_request(&mut self, request_id: Ulid, provided: Vec<Reservation>) {
        self.current = Some(request_id);
        self.provided = provided;
    }

    pub fn provided(&self) -> &[Reservation] {
        &self.provided
    }

    fn current_request(&self) -> Result<Ulid, SchedulingError> {
        self.current
            .ok_or_else(|| SchedulingError::Consistency("no request open in transaction".into()))
    }

    fn is_provided(&self, id: Ulid) -> bool {
        self.provided.iter().any(|r| r.id == id)
    }

    // ── Storage view ─────────────────────────────────────────

    async fn ensure_loaded(&mut self, scope: ReservationScope, slot: Span) -> Result<(), SchedulingError> {
        if self.loaded.get(&scope).is_some_and(|l| l.span.contains_span(&slot)) {
            return Ok(());
        }
        let span = match self.loaded.get(&scope) {
            Some(previous) => previous.span.hull(&slot),
            None => self.interval.hull(&slot),
        };
        let reservations = self.storage.load_reservations_intersecting(scope, span).await?;
        self.loaded.insert(scope, Loaded { span, reservations });
        Ok(())
    }

    /// Reservations in `scope` overlapping `slot` as this run sees them:
    /// storage minus released and provided ones, overridden and extended by pending.
    async fn effective(&mut self, scope: ReservationScope, slot: Span) -> Result<Vec<Reservation>, SchedulingError> {
        self.ensure_loaded(scope, slot).await?;
        let pending_ids: HashSet<Ulid> = self.pending.iter().map(|p| p.reservation.id).collect();

        let mut view: Vec<Reservation> = self
            .loaded
            .get(&scope)
            .map(|l| l.reservations.as_slice())
            .unwrap_or_default()
            .iter()
            .filter(|r| r.slot.overlaps(&slot))
            .filter(|r| !self.released.contains(&r.id) && !pending_ids.contains(&r.id) && !self.is_provided(r.id))
            .cloned()
            .collect();
        view.extend(
            self.pending
                .iter()
                .map(|p| &p.reservation)
                .filter(|r| r.scope() == scope && r.slot.overlaps(&slot))
                .cloned(),
        );
        Ok(view)
    }

    // ── Questions ────────────────────────────────────────────

    /// Claim a value from `provider` for `slot`.
    ///
    /// A provided reservation holding the requested value (or any value when
    /// none is requested) is reused first. Otherwise the used set is built from
    /// storage and pending reservations and the provider generates a value.
    pub async fn get_available_value(
        &mut self,
        provider: &ValueProvider,
        requested: Option<&str>,
        slot: Span,
    ) -> Result<AvailableValue, SchedulingError> {
        let request_id = self.current_request()?;
        let scope = ReservationScope::ValueSpace(provider.resource.id);

        let candidates: Vec<Reservation> = self
            .provided
            .iter()
            .filter(|r| r.scope() == scope)
            .filter(|r| requested.is_none_or(|v| r.value() == Some(v)))
            .cloned()
            .collect();
        for candidate in candidates {
            if self.is_provided_reservation_available(&candidate, slot).await? {
                let reservation = Reservation {
                    slot,
                    request_id: Some(request_id),
                    ..candidate
                };
                self.record_pending(reservation.clone())?;
                return Ok(AvailableValue {
                    value: reservation.value().unwrap_or_default().to_string(),
                    source_reservation: Some(reservation.id),
                    reservation,
                });
            }
        }

        let used: HashSet<String> = self
            .effective(scope, slot)
            .await?
            .iter()
            .filter_map(|r| r.value().map(str::to_string))
            .collect();
        let value = match requested {
            Some(v) => provider.generator.generate_requested(&used, v)?,
            None => provider
                .generator
                .generate(&used)
                .ok_or(AllocationError::NoAvailableValue(provider.resource.id))?,
        };

        let reservation = Reservation {
            id: Ulid::new(),
            request_id: Some(request_id),
            resource_id: provider.resource.id,
            slot,
            kind: ReservationKind::Value { value: value.clone() },
        };
        self.record_pending(reservation.clone())?;
        Ok(AvailableValue {
            value,
            reservation,
            source_reservation: None,
        })
    }

    /// License usage of `provider` over `slot`. An operationally unavailable
    /// resource counts as fully used.
    pub async fn get_available_room(&mut self, provider: &RoomProvider, slot: Span) -> Result<AvailableRoom, SchedulingError> {
        self.room_usage(provider, slot, None).await
    }

    async fn room_usage(
        &mut self,
        provider: &RoomProvider,
        slot: Span,
        exclude: Option<Ulid>,
    ) -> Result<AvailableRoom, SchedulingError> {
        let max = provider.license_count;
        let context = AvailabilityContext {
            slot,
            reference: self.reference,
        };
        if !self.cache.resource_available(provider.resource.id, &context).await {
            return Ok(AvailableRoom {
                max_licenses: max,
                used_licenses: max,
                available_licenses: 0,
            });
        }

        let used: u64 = self
            .effective(ReservationScope::Room(provider.resource.id), slot)
            .await?
            .iter()
            .filter(|r| Some(r.id) != exclude)
            .map(|r| u64::from(r.license_count()))
            .sum();
        let available = i64::from(max) - used as i64;
        if available < 0 {
            return Err(SchedulingError::Consistency(format!(
                "room {} has {used} licenses in use but only {max} exist",
                provider.resource.id
            )));
        }
        Ok(AvailableRoom {
            max_licenses: max,
            used_licenses: used as u32,
            available_licenses: available as u32,
        })
    }

    /// Whether `reservation` could be kept for `slot`: nothing else holds the
    /// same value over the slot, or for rooms, its licenses still fit.
    pub async fn is_provided_reservation_available(
        &mut self,
        reservation: &Reservation,
        slot: Span,
    ) -> Result<bool, SchedulingError> {
        match &reservation.kind {
            ReservationKind::Room { license_count } => {
                let Some(provider) = self.cache.room_provider(reservation.resource_id).await else {
                    return Ok(false);
                };
                let room = self.room_usage(&provider, slot, Some(reservation.id)).await?;
                Ok(room.available_licenses >= *license_count)
            }
            ReservationKind::Value { .. } | ReservationKind::Alias { .. } => {
                let value = reservation.value();
                let clash = self
                    .effective(reservation.scope(), slot)
                    .await?
                    .iter()
                    .any(|other| other.id != reservation.id && other.value() == value);
                Ok(!clash)
            }
        }
    }

    // ── Bookkeeping ──────────────────────────────────────────

    /// Record a decision for the open request. Later questions see it.
    pub fn record_pending(&mut self, mut reservation: Reservation) -> Result<(), SchedulingError> {
        let request_id = self.current_request()?;
        reservation.request_id = Some(request_id);
        self.pending.retain(|p| p.reservation.id != reservation.id);
        self.pending.push(Pending {
            request_id,
            reservation,
        });
        Ok(())
    }

    /// Close the open request successfully. Provided reservations it did not
    /// reuse are released for the rest of the run.
    pub fn finish_request(&mut self) -> RequestOutcome {
        let Some(request_id) = self.current.take() else {
            return RequestOutcome::default();
        };
        let reservations: Vec<Reservation> = self
            .pending
            .iter()
            .filter(|p| p.request_id == request_id)
            .map(|p| p.reservation.clone())
            .collect();
        let kept: HashSet<Ulid> = reservations.iter().map(|r| r.id).collect();
        let released: Vec<Ulid> = std::mem::take(&mut self.provided)
            .into_iter()
            .map(|r| r.id)
            .filter(|id| !kept.contains(id))
            .collect();
        self.released.extend(released.iter().copied());
        RequestOutcome {
            reservations,
            released,
        }
    }

    /// Close the open request as failed: its pending decisions are dropped
    /// and everything it held is released.
    pub fn abandon_request(&mut self) -> Vec<Ulid> {
        let Some(request_id) = self.current.take() else {
            return Vec::new();
        };
        self.pending.retain(|p| p.request_id != request_id);
        let released: Vec<Ulid> = std::mem::take(&mut self.provided).into_iter().map(|r| r.id).collect();
        self.released.extend(released.iter().copied());
        released
    }

    /// Pending reservations of every request, in decision order.
    pub fn pending(&self) -> impl Iterator<Item = &Reservation> {
        self.pending.iter().map(|p| &p.reservation)
    }
}
