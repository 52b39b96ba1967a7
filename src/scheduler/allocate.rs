use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;
use ulid::Ulid;

use crate::cache::{AliasProvider, AvailabilityCache, AvailabilityContext, RoomProvider};
use crate::error::{AllocationError, SchedulingError};
use crate::model::*;
use crate::scheduler::transaction::AllocationTransaction;

/// Allocate everything `request` specifies. Decisions land in the
/// transaction as pending reservations of the open request.
pub async fn allocate_request(
    tx: &mut AllocationTransaction<'_>,
    cache: &AvailabilityCache,
    request: &ConcreteRequest,
) -> Result<(), SchedulingError> {
    match &request.specification {
        Specification::Value { provider, value } => {
            allocate_value(tx, cache, *provider, value.as_deref(), request.slot).await
        }
        Specification::Alias {
            technology,
            provider,
            value,
        } => allocate_alias(tx, cache, *technology, *provider, value.as_deref(), request.slot).await,
        Specification::Room {
            technologies,
            license_count,
            provider,
        } => allocate_room(tx, cache, technologies, *license_count, *provider, request.slot).await,
    }
}

async fn allocate_value(
    tx: &mut AllocationTransaction<'_>,
    cache: &AvailabilityCache,
    provider_id: Ulid,
    requested: Option<&str>,
    slot: Span,
) -> Result<(), SchedulingError> {
    let provider = match cache.value_provider(provider_id).await {
        Some(provider) => provider,
        None if cache.resource(provider_id).await.is_some() => {
            return Err(AllocationError::CapabilityMissing {
                resource: provider_id,
                capability: "value-providing",
            }
            .into());
        }
        None => return Err(AllocationError::ResourceNotFound(provider_id).into()),
    };
    if provider.scope == ValueScope::Restricted {
        return Err(AllocationError::ValueProviderRestricted(provider_id).into());
    }
    let context = AvailabilityContext {
        slot,
        reference: tx.reference(),
    };
    if !cache.resource_available(provider_id, &context).await {
        return Err(AllocationError::ResourceNotAvailable(provider_id).into());
    }
    let available = tx.get_available_value(&provider, requested, slot).await?;
    debug!(value = %available.value, reused = available.source_reservation.is_some(), "value allocated");
    Ok(())
}

/// Try alias providers in id order. Request-level failures move on to the
/// next provider; the last one is returned if none succeeds.
async fn allocate_alias(
    tx: &mut AllocationTransaction<'_>,
    cache: &AvailabilityCache,
    technology: Technology,
    pinned: Option<Ulid>,
    requested: Option<&str>,
    slot: Span,
) -> Result<(), SchedulingError> {
    let candidates: Vec<Arc<AliasProvider>> = match pinned {
        Some(resource_id) => cache
            .alias_providers_on(resource_id)
            .await
            .into_iter()
            .filter(|a| a.technology == technology)
            .collect(),
        None => cache.alias_providers(technology).await,
    };

    let mut last_error = AllocationError::NoAliasProvider(technology);
    for alias_provider in candidates {
        match allocate_alias_on(tx, cache, &alias_provider, requested, slot).await {
            Ok(()) => return Ok(()),
            Err(SchedulingError::Allocation(e)) => {
                debug!(provider = %alias_provider.resource.id, error = %e, "alias provider skipped");
                last_error = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.into())
}

async fn allocate_alias_on(
    tx: &mut AllocationTransaction<'_>,
    cache: &AvailabilityCache,
    alias_provider: &AliasProvider,
    requested: Option<&str>,
    slot: Span,
) -> Result<(), SchedulingError> {
    let alias_id = alias_provider.resource.id;
    let context = AvailabilityContext {
        slot,
        reference: tx.reference(),
    };
    if !cache.resource_available(alias_id, &context).await {
        return Err(AllocationError::ResourceNotAvailable(alias_id).into());
    }
    let value_provider = cache
        .value_provider(alias_provider.value_provider)
        .await
        .ok_or(AllocationError::CapabilityMissing {
            resource: alias_provider.value_provider,
            capability: "value-providing",
        })?;
    if value_provider.scope == ValueScope::Restricted && value_provider.resource.id != alias_id {
        return Err(AllocationError::ValueProviderRestricted(value_provider.resource.id).into());
    }
    if !cache.resource_available(value_provider.resource.id, &context).await {
        return Err(AllocationError::ResourceNotAvailable(value_provider.resource.id).into());
    }

    let value = tx.get_available_value(&value_provider, requested, slot).await?;

    // Keep the alias reservation that already pointed at a reused value.
    let previous_alias = tx
        .provided()
        .iter()
        .find(|r| {
            r.resource_id == alias_id
                && matches!(r.kind, ReservationKind::Alias { value_reservation, .. } if Some(value_reservation) == value.source_reservation)
        })
        .map(|r| r.id);
    let alias = Reservation {
        id: previous_alias.unwrap_or_else(Ulid::new),
        request_id: value.reservation.request_id,
        resource_id: alias_id,
        slot,
        kind: ReservationKind::Alias {
            value_reservation: value.reservation.id,
            alias_value: value.value.clone(),
        },
    };
    tx.record_pending(alias)?;
    debug!(alias = %value.value, provider = %alias_id, "alias allocated");
    Ok(())
}

/// Reuse a still-fitting provided room reservation, otherwise pick the
/// candidate with the most free licenses (lowest id on ties).
async fn allocate_room(
    tx: &mut AllocationTransaction<'_>,
    cache: &AvailabilityCache,
    technologies: &BTreeSet<Technology>,
    license_count: u32,
    pinned: Option<Ulid>,
    slot: Span,
) -> Result<(), SchedulingError> {
    let candidates: Vec<Arc<RoomProvider>> = cache
        .room_providers_supporting(technologies)
        .await
        .into_iter()
        .filter(|room| pinned.is_none_or(|id| room.resource.id == id))
        .collect();
    let not_available = AllocationError::RoomNotAvailable {
        requested: license_count,
    };
    if candidates.is_empty() {
        return Err(not_available.into());
    }

    let provided: Vec<Reservation> = tx
        .provided()
        .iter()
        .filter(|r| r.license_count() == license_count)
        .filter(|r| matches!(r.kind, ReservationKind::Room { .. }))
        .filter(|r| candidates.iter().any(|c| c.resource.id == r.resource_id))
        .cloned()
        .collect();
    for reservation in provided {
        if tx.is_provided_reservation_available(&reservation, slot).await? {
            let reused = Reservation { slot, ..reservation };
            debug!(room = %reused.resource_id, "room reservation reused");
            return tx.record_pending(reused);
        }
    }

    let mut best: Option<(Arc<RoomProvider>, u32)> = None;
    for room in candidates {
        let usage = tx.get_available_room(&room, slot).await?;
        if usage.available_licenses < license_count {
            continue;
        }
        if best.as_ref().is_none_or(|(_, free)| usage.available_licenses > *free) {
            best = Some((room, usage.available_licenses));
        }
    }
    let Some((room, free)) = best else {
        return Err(not_available.into());
    };

    let reservation = Reservation {
        id: Ulid::new(),
        request_id: None,
        resource_id: room.resource.id,
        slot,
        kind: ReservationKind::Room { license_count },
    };
    debug!(room = %room.resource.id, licenses = license_count, free, "room allocated");
    tx.record_pending(reservation)
}
