use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::error::StorageError;
use crate::model::*;
use crate::wal::Wal;

use super::Storage;

/// Reservation ids of one scope, sorted by `slot.start`.
#[derive(Default)]
struct Timeline {
    entries: Vec<(Span, Ulid)>,
}

impl Timeline {
    fn insert(&mut self, slot: Span, id: Ulid) {
        let pos = self
            .entries
            .binary_search_by_key(&slot.start, |(s, _)| s.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, (slot, id));
    }

    fn remove(&mut self, id: Ulid) {
        if let Some(pos) = self.entries.iter().position(|(_, i)| *i == id) {
            self.entries.remove(pos);
        }
    }

    /// Ids whose slot overlaps `query`. Entries starting at or after
    /// `query.end` are skipped by binary search.
    fn overlapping(&self, query: Span) -> impl Iterator<Item = Ulid> + '_ {
        let right_bound = self.entries.partition_point(|(s, _)| s.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |(s, _)| s.end > query.start)
            .map(|(_, id)| *id)
    }
}

struct Journal {
    wal: Mutex<Wal>,
    compact_threshold: u64,
}

/// DashMap-backed storage, optionally journaled to disk.
pub struct MemoryStorage {
    resources: DashMap<Ulid, Resource>,
    request_sets: DashMap<Ulid, RequestSet>,
    requests: DashMap<Ulid, ConcreteRequest>,
    /// Parent → children index.
    children: DashMap<Ulid, Vec<Ulid>>,
    reservations: DashMap<Ulid, Reservation>,
    timelines: DashMap<ReservationScope, Timeline>,
    failures: DashMap<Ulid, String>,
    journal: Option<Journal>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Volatile storage, nothing touches disk.
    pub fn new() -> Self {
        Self::with_journal(None)
    }

    /// Replay the journal at `path`, then keep appending to it. The journal is
    /// rewritten as a snapshot every `compact_threshold` appends.
    pub fn open(path: &Path, compact_threshold: u64) -> Result<Self, StorageError> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let storage = Self::with_journal(Some(Journal {
            wal: Mutex::new(wal),
            compact_threshold: compact_threshold.max(1),
        }));
        for event in &events {
            storage.apply(event);
        }
        info!(events = events.len(), path = %path.display(), "journal replayed");
        Ok(storage)
    }

    fn with_journal(journal: Option<Journal>) -> Self {
        Self {
            resources: DashMap::new(),
            request_sets: DashMap::new(),
            requests: DashMap::new(),
            children: DashMap::new(),
            reservations: DashMap::new(),
            timelines: DashMap::new(),
            failures: DashMap::new(),
            journal,
        }
    }

    // ── Event application ────────────────────────────────────

    fn apply(&self, event: &Event) {
        match event {
            Event::ResourceSaved(resource) => {
                self.resources.insert(resource.id, resource.clone());
            }
            Event::ResourceRemoved { id } => {
                self.resources.remove(id);
            }
            Event::RequestSetSaved(set) => {
                self.request_sets.insert(set.id, set.clone());
            }
            Event::RequestSetRemoved { id } => {
                self.request_sets.remove(id);
                self.children.remove(id);
            }
            Event::RequestSaved(request) => {
                let previous = self.requests.insert(request.id, request.clone());
                let previous_parent = previous.and_then(|p| p.parent_id);
                if previous_parent != request.parent_id {
                    if let Some(old) = previous_parent {
                        self.unlink_child(old, request.id);
                    }
                    if let Some(parent) = request.parent_id {
                        self.children.entry(parent).or_default().push(request.id);
                    }
                }
            }
            Event::RequestRemoved { id } => {
                if let Some((_, request)) = self.requests.remove(id)
                    && let Some(parent) = request.parent_id
                {
                    self.unlink_child(parent, *id);
                }
            }
            Event::ReservationSaved(reservation) => {
                if let Some(previous) = self.reservations.insert(reservation.id, reservation.clone())
                    && let Some(mut timeline) = self.timelines.get_mut(&previous.scope())
                {
                    timeline.remove(previous.id);
                }
                self.timelines
                    .entry(reservation.scope())
                    .or_default()
                    .insert(reservation.slot, reservation.id);
            }
            Event::ReservationRemoved { id } => {
                if let Some((_, reservation)) = self.reservations.remove(id)
                    && let Some(mut timeline) = self.timelines.get_mut(&reservation.scope())
                {
                    timeline.remove(*id);
                }
            }
        }
    }

    fn unlink_child(&self, parent: Ulid, child: Ulid) {
        if let Some(mut kids) = self.children.get_mut(&parent) {
            kids.retain(|c| *c != child);
        }
    }

    /// Minimal event list that recreates the current state.
    fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(
            self.resources.len() + self.request_sets.len() + self.requests.len() + self.reservations.len(),
        );
        events.extend(self.resources.iter().map(|e| Event::ResourceSaved(e.value().clone())));
        events.extend(self.request_sets.iter().map(|e| Event::RequestSetSaved(e.value().clone())));
        events.extend(self.requests.iter().map(|e| Event::RequestSaved(e.value().clone())));
        events.extend(self.reservations.iter().map(|e| Event::ReservationSaved(e.value().clone())));
        events
    }

    /// Journal (if any), apply, and compact once the threshold is reached.
    async fn record(&self, event: Event) -> Result<(), StorageError> {
        let Some(journal) = &self.journal else {
            self.apply(&event);
            return Ok(());
        };
        let mut wal = journal.wal.lock().await;
        wal.append(&event)?;
        self.apply(&event);
        if wal.appends_since_compact() >= journal.compact_threshold {
            let snapshot = self.snapshot();
            wal.compact(&snapshot)?;
            metrics::counter!(crate::observability::JOURNAL_COMPACTIONS_TOTAL).increment(1);
            debug!(events = snapshot.len(), "journal compacted");
        }
        Ok(())
    }

    // ── Administrative writes ────────────────────────────────

    pub async fn save_resource(&self, resource: Resource) -> Result<(), StorageError> {
        self.record(Event::ResourceSaved(resource)).await
    }

    pub async fn remove_resource(&self, id: Ulid) -> Result<(), StorageError> {
        if !self.resources.contains_key(&id) {
            return Err(StorageError::NotFound(id));
        }
        self.record(Event::ResourceRemoved { id }).await
    }

    pub async fn save_request_set(&self, set: RequestSet) -> Result<(), StorageError> {
        self.record(Event::RequestSetSaved(set)).await
    }

    /// Removes the set with its children and their reservations.
    pub async fn remove_request_set(&self, id: Ulid) -> Result<(), StorageError> {
        if !self.request_sets.contains_key(&id) {
            return Err(StorageError::NotFound(id));
        }
        for child in self.children_of(id) {
            for reservation_id in &child.reservation_ids {
                if self.reservations.contains_key(reservation_id) {
                    self.record(Event::ReservationRemoved { id: *reservation_id }).await?;
                }
            }
            self.record(Event::RequestRemoved { id: child.id }).await?;
        }
        self.record(Event::RequestSetRemoved { id }).await
    }

    // ── Reads ────────────────────────────────────────────────

    pub fn request(&self, id: Ulid) -> Option<ConcreteRequest> {
        self.requests.get(&id).map(|e| e.value().clone())
    }

    pub fn request_set(&self, id: Ulid) -> Option<RequestSet> {
        self.request_sets.get(&id).map(|e| e.value().clone())
    }

    pub fn reservation(&self, id: Ulid) -> Option<Reservation> {
        self.reservations.get(&id).map(|e| e.value().clone())
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Children of `parent`, ordered by slot start.
    pub fn children_of(&self, parent: Ulid) -> Vec<ConcreteRequest> {
        let ids = self
            .children
            .get(&parent)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut kids: Vec<ConcreteRequest> = ids.iter().filter_map(|id| self.request(*id)).collect();
        kids.sort_by_key(|r| (r.slot.start, r.id));
        kids
    }

    /// Reservations currently held by `request_id`.
    pub fn reservations_of(&self, request_id: Ulid) -> Vec<Reservation> {
        let mut held: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|e| e.value().request_id == Some(request_id))
            .map(|e| e.value().clone())
            .collect();
        held.sort_by_key(|r| r.id);
        held
    }

    /// Last failure reason reported for `request_id`.
    pub fn failure(&self, request_id: Ulid) -> Option<String> {
        self.failures.get(&request_id).map(|e| e.value().clone())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_resources(&self) -> Result<Vec<Resource>, StorageError> {
        let mut resources: Vec<Resource> = self.resources.iter().map(|e| e.value().clone()).collect();
        resources.sort_by_key(|r| r.id);
        Ok(resources)
    }

    async fn load_reservations_intersecting(
        &self,
        scope: ReservationScope,
        interval: Span,
    ) -> Result<Vec<Reservation>, StorageError> {
        let ids: Vec<Ulid> = match self.timelines.get(&scope) {
            Some(timeline) => timeline.overlapping(interval).collect(),
            None => return Ok(Vec::new()),
        };
        Ok(ids.iter().filter_map(|id| self.reservation(*id)).collect())
    }

    async fn load_reservations(&self, ids: &[Ulid]) -> Result<Vec<Reservation>, StorageError> {
        Ok(ids.iter().filter_map(|id| self.reservation(*id)).collect())
    }

    async fn load_pending_requests(&self, window: Span) -> Result<Vec<RequestSet>, StorageError> {
        let has_children_in = |id: &Ulid| {
            self.children.get(id).is_some_and(|kids| {
                kids.iter().any(|kid| {
                    self.requests
                        .get(kid)
                        .is_some_and(|r| window.start <= r.slot.start && r.slot.start <= window.end)
                })
            })
        };
        let mut sets: Vec<RequestSet> = self
            .request_sets
            .iter()
            .filter(|e| e.value().touches(window) || has_children_in(e.key()))
            .map(|e| e.value().clone())
            .collect();
        sets.sort_by_key(|s| s.id);
        Ok(sets)
    }

    async fn load_concrete_requests(&self, window: Span) -> Result<Vec<ConcreteRequest>, StorageError> {
        let mut requests: Vec<ConcreteRequest> = self
            .requests
            .iter()
            .filter(|e| e.value().slot.touches(&window))
            .map(|e| e.value().clone())
            .collect();
        requests.sort_by_key(|r| r.id);
        Ok(requests)
    }

    async fn load_child_requests(
        &self,
        parent_id: Ulid,
        window: Span,
    ) -> Result<Vec<ConcreteRequest>, StorageError> {
        Ok(self
            .children_of(parent_id)
            .into_iter()
            .filter(|r| window.start <= r.slot.start && r.slot.start <= window.end)
            .collect())
    }

    async fn persist_request(&self, request: &ConcreteRequest) -> Result<(), StorageError> {
        self.record(Event::RequestSaved(request.clone())).await
    }

    async fn persist_reservation(&self, reservation: &Reservation) -> Result<(), StorageError> {
        self.record(Event::ReservationSaved(reservation.clone())).await
    }

    async fn remove_request(&self, id: Ulid) -> Result<(), StorageError> {
        if !self.requests.contains_key(&id) {
            return Err(StorageError::NotFound(id));
        }
        self.record(Event::RequestRemoved { id }).await
    }

    async fn remove_reservation(&self, id: Ulid) -> Result<(), StorageError> {
        if !self.reservations.contains_key(&id) {
            return Err(StorageError::NotFound(id));
        }
        self.record(Event::ReservationRemoved { id }).await
    }

    async fn report_failure(&self, request: &ConcreteRequest, reason: &str) -> Result<(), StorageError> {
        warn!(request = %request.id, reason, "request not allocated");
        self.failures.insert(request.id, reason.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const H: Ms = 3_600_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("allotter_test_storage");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn value_reservation(space: Ulid, slot: Span, value: &str) -> Reservation {
        Reservation {
            id: Ulid::new(),
            request_id: None,
            resource_id: space,
            slot,
            kind: ReservationKind::Value { value: value.into() },
        }
    }

    #[tokio::test]
    async fn intersecting_query_is_half_open() {
        let storage = MemoryStorage::new();
        let space = Ulid::new();
        let early = value_reservation(space, Span::new(0, H), "1");
        let late = value_reservation(space, Span::new(2 * H, 3 * H), "2");
        storage.persist_reservation(&late).await.unwrap();
        storage.persist_reservation(&early).await.unwrap();

        let scope = ReservationScope::ValueSpace(space);
        let hits = storage.load_reservations_intersecting(scope, Span::new(H, 2 * H)).await.unwrap();
        assert!(hits.is_empty());

        let hits = storage
            .load_reservations_intersecting(scope, Span::new(H - 1, 2 * H + 1))
            .await
            .unwrap();
        assert_eq!(hits, vec![early.clone(), late.clone()]);

        let other = ReservationScope::ValueSpace(Ulid::new());
        assert!(storage.load_reservations_intersecting(other, Span::new(0, 3 * H)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resaving_reservation_moves_it() {
        let storage = MemoryStorage::new();
        let space = Ulid::new();
        let mut r = value_reservation(space, Span::new(0, H), "7");
        storage.persist_reservation(&r).await.unwrap();
        r.slot = Span::new(5 * H, 6 * H);
        storage.persist_reservation(&r).await.unwrap();

        let scope = ReservationScope::ValueSpace(space);
        assert!(storage.load_reservations_intersecting(scope, Span::new(0, H)).await.unwrap().is_empty());
        assert_eq!(
            storage.load_reservations_intersecting(scope, Span::new(5 * H, 6 * H)).await.unwrap(),
            vec![r]
        );
        assert_eq!(storage.reservation_count(), 1);
    }

    #[tokio::test]
    async fn children_follow_parent_changes() {
        let storage = MemoryStorage::new();
        let parent = Ulid::new();
        let spec = Specification::Value { provider: Ulid::new(), value: None };
        let mut child = ConcreteRequest::new(Ulid::new(), Span::new(H, 2 * H), spec);
        child.parent_id = Some(parent);
        storage.persist_request(&child).await.unwrap();
        assert_eq!(storage.children_of(parent).len(), 1);

        let window = Span::new(0, 10 * H);
        assert_eq!(storage.load_child_requests(parent, window).await.unwrap().len(), 1);
        assert!(storage.load_child_requests(parent, Span::new(3 * H, 4 * H)).await.unwrap().is_empty());

        storage.remove_request(child.id).await.unwrap();
        assert!(storage.children_of(parent).is_empty());
        assert!(matches!(
            storage.remove_request(child.id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn pending_sets_include_those_with_children_in_window() {
        let storage = MemoryStorage::new();
        let set = RequestSet {
            id: Ulid::new(),
            slots: Vec::new(),
            specification: Specification::Value { provider: Ulid::new(), value: None },
            created_at: 0,
        };
        storage.save_request_set(set.clone()).await.unwrap();
        let window = Span::new(0, 10 * H);
        assert!(storage.load_pending_requests(window).await.unwrap().is_empty());

        let mut child = ConcreteRequest::new(Ulid::new(), Span::new(H, 2 * H), set.specification.clone());
        child.parent_id = Some(set.id);
        storage.persist_request(&child).await.unwrap();
        assert_eq!(storage.load_pending_requests(window).await.unwrap(), vec![set]);
        assert!(storage.load_pending_requests(Span::new(3 * H, 4 * H)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn journal_survives_reopen() {
        let path = test_wal_path("reopen.wal");
        let space = Ulid::new();
        let kept = value_reservation(space, Span::new(0, H), "42");
        let dropped = value_reservation(space, Span::new(0, H), "43");
        let resource = Resource::new(Ulid::new(), "gatekeeper");
        {
            let storage = MemoryStorage::open(&path, 1000).unwrap();
            storage.save_resource(resource.clone()).await.unwrap();
            storage.persist_reservation(&kept).await.unwrap();
            storage.persist_reservation(&dropped).await.unwrap();
            storage.remove_reservation(dropped.id).await.unwrap();
        }

        let storage = MemoryStorage::open(&path, 1000).unwrap();
        assert_eq!(storage.load_resources().await.unwrap(), vec![resource]);
        assert_eq!(storage.reservation(kept.id), Some(kept.clone()));
        assert_eq!(storage.reservation(dropped.id), None);
        let scope = ReservationScope::ValueSpace(space);
        assert_eq!(storage.load_reservations_intersecting(scope, Span::new(0, H)).await.unwrap(), vec![kept]);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn compaction_keeps_state() {
        let path = test_wal_path("compaction.wal");
        let space = Ulid::new();
        let mut last = None;
        {
            let storage = MemoryStorage::open(&path, 3).unwrap();
            for i in 0..10 {
                let r = value_reservation(space, Span::new(i * H, (i + 1) * H), &i.to_string());
                storage.persist_reservation(&r).await.unwrap();
                if i % 2 == 0 {
                    storage.remove_reservation(r.id).await.unwrap();
                } else {
                    last = Some(r);
                }
            }
        }

        let replayed = crate::wal::Wal::replay(&path).unwrap();
        assert!(replayed.len() < 20, "journal should have been compacted");

        let storage = MemoryStorage::open(&path, 3).unwrap();
        assert_eq!(storage.reservation_count(), 5);
        let last = last.unwrap();
        assert_eq!(storage.reservation(last.id), Some(last));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn removing_set_cascades() {
        let storage = MemoryStorage::new();
        let set = RequestSet {
            id: Ulid::new(),
            slots: Vec::new(),
            specification: Specification::Value { provider: Ulid::new(), value: None },
            created_at: 0,
        };
        storage.save_request_set(set.clone()).await.unwrap();

        let reservation = value_reservation(Ulid::new(), Span::new(0, H), "1");
        let mut child = ConcreteRequest::new(Ulid::new(), Span::new(0, H), set.specification.clone());
        child.parent_id = Some(set.id);
        child.reservation_ids = vec![reservation.id];
        storage.persist_reservation(&reservation).await.unwrap();
        storage.persist_request(&child).await.unwrap();

        storage.remove_request_set(set.id).await.unwrap();
        assert_eq!(storage.request_count(), 0);
        assert_eq!(storage.reservation_count(), 0);
        assert!(storage.request_set(set.id).is_none());
    }

    #[tokio::test]
    async fn failures_are_recorded() {
        let storage = MemoryStorage::new();
        let request = ConcreteRequest::new(
            Ulid::new(),
            Span::new(0, H),
            Specification::Value { provider: Ulid::new(), value: None },
        );
        storage.report_failure(&request, "no available value").await.unwrap();
        assert_eq!(storage.failure(request.id).as_deref(), Some("no available value"));
    }
}
