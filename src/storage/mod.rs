mod memory;

pub use memory::MemoryStorage;

use async_trait::async_trait;
use ulid::Ulid;

use crate::error::StorageError;
use crate::model::*;

/// Persistence collaborator used by the coordinator. Calls are awaited in
/// sequence; any error aborts the running cycle.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn load_resources(&self) -> Result<Vec<Resource>, StorageError>;

    /// Reservations in `scope` whose slot overlaps `interval`.
    async fn load_reservations_intersecting(
        &self,
        scope: ReservationScope,
        interval: Span,
    ) -> Result<Vec<Reservation>, StorageError>;

    /// Reservations by id. Unknown ids are skipped.
    async fn load_reservations(&self, ids: &[Ulid]) -> Result<Vec<Reservation>, StorageError>;

    /// Abstract requests with at least one slot starting inside `window`, or
    /// with a child whose slot starts inside it.
    async fn load_pending_requests(&self, window: Span) -> Result<Vec<RequestSet>, StorageError>;

    /// Concrete requests whose slot touches `window`, any state.
    async fn load_concrete_requests(&self, window: Span) -> Result<Vec<ConcreteRequest>, StorageError>;

    /// Children of `parent_id` whose slot starts inside `window`.
    async fn load_child_requests(
        &self,
        parent_id: Ulid,
        window: Span,
    ) -> Result<Vec<ConcreteRequest>, StorageError>;

    async fn persist_request(&self, request: &ConcreteRequest) -> Result<(), StorageError>;

    async fn persist_reservation(&self, reservation: &Reservation) -> Result<(), StorageError>;

    async fn remove_request(&self, id: Ulid) -> Result<(), StorageError>;

    async fn remove_reservation(&self, id: Ulid) -> Result<(), StorageError>;

    async fn report_failure(&self, request: &ConcreteRequest, reason: &str) -> Result<(), StorageError>;
}
