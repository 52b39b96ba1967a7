use tracing::{debug, warn};
use ulid::Ulid;

use crate::config::SchedulerConfig;
use crate::error::{SchedulingError, ValidationError};
use crate::limits::CHILD_MATCH_TOLERANCE;
use crate::model::*;
use crate::notify::{Notification, Notifier};
use crate::observability::REQUESTS_MATERIALIZED_TOTAL;
use crate::scheduler::release_reservation;
use crate::storage::Storage;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PreprocessReport {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    /// Children rejected at materialization (room slot too long).
    pub failed: usize,
    /// Abstract requests skipped because their time specification is malformed.
    pub invalid: usize,
}

impl PreprocessReport {
    pub fn changed(&self) -> usize {
        self.created + self.updated + self.removed + self.failed
    }
}

/// Slots the abstract request wants inside `window`, sorted and deduplicated.
fn desired_slots(set: &RequestSet, window: Span) -> Result<Vec<Span>, ValidationError> {
    let mut slots = Vec::new();
    for slot in &set.slots {
        for start in slot.start.occurrences(set.created_at, window)? {
            let end = slot.duration.add_to(start)?;
            slots.push(Span::try_new(start, end)?);
        }
    }
    slots.sort();
    slots.dedup();
    Ok(slots)
}

/// Index of the unmatched child closest to `slot.start`, within tolerance.
fn closest_child(children: &[ConcreteRequest], taken: &[bool], slot: Span) -> Option<usize> {
    children
        .iter()
        .enumerate()
        .filter(|(i, _)| !taken[*i])
        .map(|(i, child)| (i, (child.slot.start - slot.start).abs(), child.id))
        .filter(|(_, distance, _)| *distance <= CHILD_MATCH_TOLERANCE)
        .min_by_key(|(_, distance, id)| (*distance, *id))
        .map(|(i, _, _)| i)
}

/// Materialize every abstract request touching `window` into concrete
/// per-occurrence requests.
///
/// Existing children are matched to occurrences by start proximity. A
/// matched child whose slot or specification changed goes back to
/// `NotAllocated` and keeps its reservations as provided ones. Children
/// left without an occurrence are deleted with their reservations.
pub async fn preprocess(
    storage: &dyn Storage,
    notifier: &dyn Notifier,
    config: &SchedulerConfig,
    window: Span,
) -> Result<PreprocessReport, SchedulingError> {
    let mut report = PreprocessReport::default();
    let mut sets = storage.load_pending_requests(window).await?;
    sets.sort_by_key(|s| s.id);

    for set in sets {
        let slots = match desired_slots(&set, window) {
            Ok(slots) => slots,
            Err(e) => {
                warn!(request_set = %set.id, error = %e, "abstract request skipped");
                report.invalid += 1;
                continue;
            }
        };

        let mut children = storage.load_child_requests(set.id, window).await?;
        children.sort_by_key(|c| (c.slot.start, c.id));
        let mut taken = vec![false; children.len()];

        for slot in slots {
            let (mut request, changed) = match closest_child(&children, &taken, slot) {
                Some(i) => {
                    taken[i] = true;
                    let mut child = children[i].clone();
                    let changed = child.slot != slot || child.specification != set.specification;
                    if changed {
                        child.slot = slot;
                        child.specification = set.specification.clone();
                        child.state = AllocationState::NotAllocated;
                        report.updated += 1;
                        metrics::counter!(REQUESTS_MATERIALIZED_TOTAL, "change" => "updated").increment(1);
                    }
                    (child, changed)
                }
                None => {
                    let mut child = ConcreteRequest::new(Ulid::new(), slot, set.specification.clone());
                    child.parent_id = Some(set.id);
                    report.created += 1;
                    metrics::counter!(REQUESTS_MATERIALIZED_TOTAL, "change" => "created").increment(1);
                    (child, true)
                }
            };
            if !changed {
                continue;
            }

            if let Some(reason) = room_duration_violation(&request, config) {
                for id in std::mem::take(&mut request.reservation_ids) {
                    release_reservation(storage, id).await?;
                }
                request.state = AllocationState::Failed { reason: reason.clone() };
                storage.persist_request(&request).await?;
                storage.report_failure(&request, &reason).await?;
                notifier.enqueue(Notification::RequestFailed {
                    domain: config.domain.name.clone(),
                    request_id: request.id,
                    parent_id: request.parent_id,
                    slot: request.slot,
                    reason,
                });
                report.failed += 1;
                metrics::counter!(REQUESTS_MATERIALIZED_TOTAL, "change" => "failed").increment(1);
                continue;
            }
            storage.persist_request(&request).await?;
        }

        for (child, _) in children.iter().zip(&taken).filter(|(_, taken)| !**taken) {
            for id in &child.reservation_ids {
                release_reservation(storage, *id).await?;
            }
            storage.remove_request(child.id).await?;
            report.removed += 1;
            metrics::counter!(REQUESTS_MATERIALIZED_TOTAL, "change" => "removed").increment(1);
        }
    }

    if report.changed() > 0 {
        debug!(?report, "abstract requests materialized");
    }
    Ok(report)
}

fn room_duration_violation(request: &ConcreteRequest, config: &SchedulerConfig) -> Option<String> {
    if !request.specification.is_room() {
        return None;
    }
    let max = config.room_max_duration;
    let exceeded = match max.add_to(request.slot.start) {
        Ok(limit) => request.slot.end > limit,
        Err(_) => false,
    };
    exceeded.then(|| ValidationError::DurationExceeded { slot: request.slot, max }.to_string())
}
