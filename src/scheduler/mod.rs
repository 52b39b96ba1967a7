//! Pre-processing and allocation passes of one scheduling cycle.

pub mod allocate;
pub mod preprocess;
pub mod transaction;
pub mod value;


pub use preprocess::{PreprocessReport, preprocess};
pub use transaction::{AllocationTransaction, AvailableRoom, AvailableValue, RequestOutcome};
pub use value::ValueGenerator;

use tracing::{debug, warn};
use ulid::Ulid;

use crate::cache::AvailabilityCache;
use crate::config::DomainContext;
use crate::error::{SchedulingError, StorageError};
use crate::model::*;
use crate::notify::{Notification, Notifier};
use crate::observability::ALLOCATIONS_TOTAL;
use crate::storage::Storage;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleReport {
    pub allocated: usize,
    pub failed: usize,
}

/// Drop a reservation from storage. Already-missing is fine.
pub(crate) async fn release_reservation(storage: &dyn Storage, id: Ulid) -> Result<(), StorageError> {
    match storage.remove_reservation(id).await {
        Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Allocate every not-yet-allocated concrete request touching `window`, in
/// ascending id order, inside a single transaction.
///
/// A request that cannot be satisfied is marked failed and the pass goes on.
/// Storage and consistency errors abort the pass.
pub async fn schedule(
    storage: &dyn Storage,
    cache: &AvailabilityCache,
    notifier: &dyn Notifier,
    domain: &DomainContext,
    window: Span,
    reference: Ms,
) -> Result<ScheduleReport, SchedulingError> {
    let mut requests: Vec<ConcreteRequest> = storage
        .load_concrete_requests(window)
        .await?
        .into_iter()
        .filter(ConcreteRequest::needs_allocation)
        .collect();
    requests.sort_by_key(|r| r.id);

    let mut report = ScheduleReport::default();
    if requests.is_empty() {
        return Ok(report);
    }

    let interval = requests.iter().fold(window, |acc, r| acc.hull(&r.slot));
    let mut tx = AllocationTransaction::new(storage, cache, interval, reference);

    for mut request in requests {
        let provided = storage.load_reservations(&request.reservation_ids).await?;
        tx.begin_request(request.id, provided);

        match allocate::allocate_request(&mut tx, cache, &request).await {
            Ok(()) => {
                let outcome = tx.finish_request();
                for reservation in &outcome.reservations {
                    storage.persist_reservation(reservation).await?;
                }
                for id in &outcome.released {
                    release_reservation(storage, *id).await?;
                }
                request.state = AllocationState::Allocated;
                request.reservation_ids = outcome.reservations.iter().map(|r| r.id).collect();
                storage.persist_request(&request).await?;

                debug!(request = %request.id, reservations = request.reservation_ids.len(), "request allocated");
                notifier.enqueue(Notification::RequestAllocated {
                    domain: domain.name.clone(),
                    request_id: request.id,
                    parent_id: request.parent_id,
                    slot: request.slot,
                    reservations: request.reservation_ids.clone(),
                });
                metrics::counter!(ALLOCATIONS_TOTAL, "status" => "allocated").increment(1);
                report.allocated += 1;
            }
            Err(e) if e.is_request_scoped() => {
                for id in tx.abandon_request() {
                    release_reservation(storage, id).await?;
                }
                let reason = e.to_string();
                request.state = AllocationState::Failed { reason: reason.clone() };
                request.reservation_ids.clear();
                storage.persist_request(&request).await?;
                storage.report_failure(&request, &reason).await?;

                warn!(request = %request.id, error = %e, "allocation failed");
                notifier.enqueue(Notification::RequestFailed {
                    domain: domain.name.clone(),
                    request_id: request.id,
                    parent_id: request.parent_id,
                    slot: request.slot,
                    reason,
                });
                metrics::counter!(ALLOCATIONS_TOTAL, "status" => "failed").increment(1);
                report.failed += 1;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(report)
}
