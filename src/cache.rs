use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::error::CacheError;
use crate::model::*;
use crate::scheduler::value::ValueGenerator;

#[derive(Debug)]
pub struct RoomProvider {
    pub resource: Arc<Resource>,
    pub license_count: u32,
}

#[derive(Debug)]
pub struct AliasProvider {
    pub resource: Arc<Resource>,
    pub technology: Technology,
    pub value_provider: Ulid,
}

#[derive(Debug)]
pub struct ValueProvider {
    pub resource: Arc<Resource>,
    pub generator: ValueGenerator,
    pub scope: ValueScope,
}

/// Slot and reference instant an availability question is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityContext {
    pub slot: Span,
    pub reference: Ms,
}

#[derive(Default)]
struct CacheIndex {
    resources: BTreeMap<Ulid, Arc<Resource>>,
    rooms: BTreeMap<Ulid, Arc<RoomProvider>>,
    aliases: BTreeMap<Ulid, Vec<Arc<AliasProvider>>>,
    values: BTreeMap<Ulid, Arc<ValueProvider>>,
}

impl CacheIndex {
    /// Builds every provider first so a bad capability leaves the index untouched.
    fn insert(&mut self, resource: Resource) -> Result<(), CacheError> {
        if self.resources.contains_key(&resource.id) {
            return Err(CacheError::AlreadyExists(resource.id));
        }
        let resource = Arc::new(resource);
        let mut room = None;
        let mut aliases = Vec::new();
        let mut value = None;
        for capability in &resource.capabilities {
            match capability {
                Capability::RoomProviding { license_count } => {
                    room = Some(Arc::new(RoomProvider {
                        resource: resource.clone(),
                        license_count: *license_count,
                    }));
                }
                Capability::AliasProviding {
                    technology,
                    value_provider,
                } => aliases.push(Arc::new(AliasProvider {
                    resource: resource.clone(),
                    technology: *technology,
                    value_provider: *value_provider,
                })),
                Capability::ValueProviding {
                    patterns,
                    allow_any_requested_value,
                    scope,
                } => {
                    let generator = ValueGenerator::new(patterns, *allow_any_requested_value)
                        .map_err(|source| CacheError::InvalidCapability {
                            resource: resource.id,
                            source,
                        })?;
                    value = Some(Arc::new(ValueProvider {
                        resource: resource.clone(),
                        generator,
                        scope: *scope,
                    }));
                }
            }
        }

        let id = resource.id;
        if let Some(room) = room {
            self.rooms.insert(id, room);
        }
        if !aliases.is_empty() {
            self.aliases.insert(id, aliases);
        }
        if let Some(value) = value {
            self.values.insert(id, value);
        }
        self.resources.insert(id, resource);
        Ok(())
    }

    fn remove(&mut self, id: Ulid) -> Result<Arc<Resource>, CacheError> {
        let resource = self.resources.remove(&id).ok_or(CacheError::NotFound(id))?;
        self.rooms.remove(&id);
        self.aliases.remove(&id);
        self.values.remove(&id);
        Ok(resource)
    }
}

/// In-memory index of resources by capability.
///
/// Mutations take the write lock for their whole duration, so readers only
/// ever see complete states. No I/O happens in here.
#[derive(Default)]
pub struct AvailabilityCache {
    index: RwLock<CacheIndex>,
}

impl AvailabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_resource(&self, resource: Resource) -> Result<(), CacheError> {
        let mut index = self.index.write().await;
        index.insert(resource)?;
        metrics::gauge!(crate::observability::RESOURCES_CACHED).set(index.resources.len() as f64);
        Ok(())
    }

    pub async fn remove_resource(&self, id: Ulid) -> Result<Arc<Resource>, CacheError> {
        let mut index = self.index.write().await;
        let removed = index.remove(id)?;
        metrics::gauge!(crate::observability::RESOURCES_CACHED).set(index.resources.len() as f64);
        Ok(removed)
    }

    /// Remove-then-add in one critical section. On failure the previous
    /// version stays registered.
    pub async fn update_resource(&self, resource: Resource) -> Result<(), CacheError> {
        let mut index = self.index.write().await;
        let previous = index.remove(resource.id)?;
        if let Err(e) = index.insert(resource) {
            let restored = Arc::unwrap_or_clone(previous);
            index.insert(restored)?;
            return Err(e);
        }
        Ok(())
    }

    pub async fn resource(&self, id: Ulid) -> Option<Arc<Resource>> {
        self.index.read().await.resources.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.resources.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.resources.is_empty()
    }

    /// Room providers whose resource speaks every requested technology. An
    /// empty set means all of them. Ordered by resource id.
    pub async fn room_providers_supporting(&self, technologies: &BTreeSet<Technology>) -> Vec<Arc<RoomProvider>> {
        self.index
            .read()
            .await
            .rooms
            .values()
            .filter(|room| technologies.is_subset(&room.resource.technologies))
            .cloned()
            .collect()
    }

    pub async fn room_provider(&self, id: Ulid) -> Option<Arc<RoomProvider>> {
        self.index.read().await.rooms.get(&id).cloned()
    }

    /// Alias providers for `technology`, ordered by resource id.
    pub async fn alias_providers(&self, technology: Technology) -> Vec<Arc<AliasProvider>> {
        self.index
            .read()
            .await
            .aliases
            .values()
            .flatten()
            .filter(|alias| alias.technology == technology)
            .cloned()
            .collect()
    }

    pub async fn alias_providers_on(&self, resource_id: Ulid) -> Vec<Arc<AliasProvider>> {
        self.index
            .read()
            .await
            .aliases
            .get(&resource_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn value_provider(&self, id: Ulid) -> Option<Arc<ValueProvider>> {
        self.index.read().await.values.get(&id).cloned()
    }

    /// False when the resource is unknown, not allocatable, or the slot ends
    /// beyond its maximum future. Booking conflicts are not considered.
    pub async fn resource_available(&self, id: Ulid, context: &AvailabilityContext) -> bool {
        self.index
            .read()
            .await
            .resources
            .get(&id)
            .is_some_and(|r| r.available_for(&context.slot, context.reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::recurrence::Period;

    const H: Ms = 3_600_000;

    fn room(technologies: &[Technology], licenses: u32) -> Resource {
        let mut resource = Resource::new(Ulid::new(), "mcu")
            .with_capability(Capability::RoomProviding { license_count: licenses });
        resource.technologies.extend(technologies.iter().copied());
        resource
    }

    #[tokio::test]
    async fn duplicate_add_fails() {
        let cache = AvailabilityCache::new();
        let resource = room(&[Technology::H323], 10);
        cache.add_resource(resource.clone()).await.unwrap();
        assert_eq!(
            cache.add_resource(resource.clone()).await,
            Err(CacheError::AlreadyExists(resource.id))
        );
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn remove_missing_fails() {
        let cache = AvailabilityCache::new();
        let id = Ulid::new();
        assert_eq!(cache.remove_resource(id).await.unwrap_err(), CacheError::NotFound(id));

        let resource = room(&[], 4);
        cache.add_resource(resource.clone()).await.unwrap();
        cache.remove_resource(resource.id).await.unwrap();
        assert!(cache.is_empty().await);
        assert!(cache.room_provider(resource.id).await.is_none());
    }

    #[tokio::test]
    async fn room_providers_filter_by_technology() {
        let cache = AvailabilityCache::new();
        let h323 = room(&[Technology::H323], 10);
        let both = room(&[Technology::H323, Technology::Sip], 5);
        cache.add_resource(h323.clone()).await.unwrap();
        cache.add_resource(both.clone()).await.unwrap();

        let all = cache.room_providers_supporting(&BTreeSet::new()).await;
        assert_eq!(all.len(), 2);

        let sip: BTreeSet<_> = [Technology::Sip].into();
        let found = cache.room_providers_supporting(&sip).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].resource.id, both.id);

        let h323_only: BTreeSet<_> = [Technology::H323].into();
        assert_eq!(cache.room_providers_supporting(&h323_only).await.len(), 2);

        let adobe: BTreeSet<_> = [Technology::AdobeConnect].into();
        assert!(cache.room_providers_supporting(&adobe).await.is_empty());
    }

    #[tokio::test]
    async fn update_replaces_capabilities() {
        let cache = AvailabilityCache::new();
        let mut resource = room(&[Technology::H323], 10);
        cache.add_resource(resource.clone()).await.unwrap();

        resource.capabilities = vec![Capability::RoomProviding { license_count: 20 }];
        cache.update_resource(resource.clone()).await.unwrap();
        assert_eq!(cache.room_provider(resource.id).await.unwrap().license_count, 20);

        let missing = room(&[], 1);
        assert_eq!(
            cache.update_resource(missing.clone()).await,
            Err(CacheError::NotFound(missing.id))
        );
    }

    #[tokio::test]
    async fn failed_update_keeps_previous_version() {
        let cache = AvailabilityCache::new();
        let resource = room(&[Technology::Sip], 3);
        cache.add_resource(resource.clone()).await.unwrap();

        let mut broken = resource.clone();
        broken.capabilities.push(Capability::ValueProviding {
            patterns: vec!["{digit:0}".into()],
            allow_any_requested_value: false,
            scope: ValueScope::Shared,
        });
        assert!(matches!(
            cache.update_resource(broken).await,
            Err(CacheError::InvalidCapability { source: ValidationError::InvalidPattern { .. }, .. })
        ));
        assert_eq!(cache.room_provider(resource.id).await.unwrap().license_count, 3);
    }

    #[tokio::test]
    async fn readers_never_see_resource_missing_during_update() {
        let cache = Arc::new(AvailabilityCache::new());
        let resource = room(&[Technology::H323], 10);
        let id = resource.id;
        cache.add_resource(resource.clone()).await.unwrap();

        let writer = {
            let cache = cache.clone();
            tokio::spawn(async move {
                for n in 0..200u32 {
                    let mut next = resource.clone();
                    next.capabilities = vec![Capability::RoomProviding { license_count: n }];
                    cache.update_resource(next).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        for _ in 0..200 {
            assert!(cache.resource(id).await.is_some());
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn operational_availability() {
        let cache = AvailabilityCache::new();
        let mut resource = room(&[], 2);
        resource.maximum_future = Some(Period::days(7));
        cache.add_resource(resource.clone()).await.unwrap();

        let near = AvailabilityContext {
            slot: Span::new(H, 2 * H),
            reference: 0,
        };
        let far = AvailabilityContext {
            slot: Span::new(8 * 24 * H, 8 * 24 * H + H),
            reference: 0,
        };
        assert!(cache.resource_available(resource.id, &near).await);
        assert!(!cache.resource_available(resource.id, &far).await);
        assert!(!cache.resource_available(Ulid::new(), &near).await);

        resource.allocatable = false;
        cache.update_resource(resource.clone()).await.unwrap();
        assert!(!cache.resource_available(resource.id, &near).await);
    }

    #[tokio::test]
    async fn alias_and_value_providers_indexed() {
        let cache = AvailabilityCache::new();
        let id = Ulid::new();
        let resource = Resource::new(id, "gatekeeper")
            .with_capability(Capability::ValueProviding {
                patterns: vec!["950{digit:2}".into()],
                allow_any_requested_value: false,
                scope: ValueScope::Restricted,
            })
            .with_capability(Capability::AliasProviding {
                technology: Technology::H323,
                value_provider: id,
            });
        cache.add_resource(resource).await.unwrap();

        assert_eq!(cache.alias_providers(Technology::H323).await.len(), 1);
        assert!(cache.alias_providers(Technology::Sip).await.is_empty());
        assert_eq!(cache.alias_providers_on(id).await.len(), 1);
        let value = cache.value_provider(id).await.unwrap();
        assert_eq!(value.scope, ValueScope::Restricted);
    }
}
