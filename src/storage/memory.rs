//! In-memory object store
//!
//! Behaves like a remote blob store (containers, leases, metadata) without any
//! I/O. Clone the `Arc` to share one store between several "processes".

use super::object_store::{
    check_write_lease, grant_lease, release_slot, slot_state, validate_object_name, LeaseDuration,
    LeaseSlot, LeaseState, ObjectStore, ResourceKey, StoreError, StoreResult,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MemoryObject {
    data: Vec<u8>,
    metadata: HashMap<String, String>,
    lease: Option<LeaseSlot>,
}

#[derive(Debug, Default)]
struct MemoryContainer {
    objects: BTreeMap<String, MemoryObject>,
    lease: Option<LeaseSlot>,
}

#[derive(Debug, Default)]
struct MemoryState {
    containers: HashMap<String, MemoryContainer>,
    /// Remaining create attempts that fail with `ContainerBeingDeleted`
    deleting: HashMap<String, u32>,
}

/// Thread-safe in-memory [`ObjectStore`]
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    state: Mutex<MemoryState>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `attempts` creations of `container` fail as if a previous
    /// incarnation of it were still being deleted
    pub fn mark_container_being_deleted(&self, container: &str, attempts: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.deleting.insert(container.to_string(), attempts);
        }
    }

    /// Force the lease on `resource` to lapse, as if its holder stalled past
    /// the lease duration
    pub fn expire_lease(&self, resource: &ResourceKey) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let Some(c) = state.containers.get_mut(&resource.container) else {
            return;
        };
        let slot = match &resource.object {
            None => &mut c.lease,
            Some(object) => match c.objects.get_mut(object) {
                Some(o) => &mut o.lease,
                None => return,
            },
        };
        if let Some(lease) = slot.as_mut() {
            lease.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory store mutex poisoned".to_string()))
    }
}

fn container_mut<'a>(
    state: &'a mut MemoryState,
    container: &str,
) -> StoreResult<&'a mut MemoryContainer> {
    state
        .containers
        .get_mut(container)
        .ok_or_else(|| StoreError::ContainerNotFound(container.to_string()))
}

impl ObjectStore for MemoryObjectStore {
    fn container_exists(&self, container: &str) -> StoreResult<bool> {
        Ok(self.lock()?.containers.contains_key(container))
    }

    fn create_container(&self, container: &str) -> StoreResult<()> {
        let mut state = self.lock()?;
        if let Some(remaining) = state.deleting.get_mut(container) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::ContainerBeingDeleted(container.to_string()));
            }
        }
        if state.containers.contains_key(container) {
            return Err(StoreError::AlreadyExists(container.to_string()));
        }
        state
            .containers
            .insert(container.to_string(), MemoryContainer::default());
        Ok(())
    }

    fn exists(&self, container: &str, object: &str) -> StoreResult<bool> {
        let state = self.lock()?;
        Ok(state
            .containers
            .get(container)
            .map_or(false, |c| c.objects.contains_key(object)))
    }

    fn read(&self, container: &str, object: &str) -> StoreResult<Vec<u8>> {
        let state = self.lock()?;
        let c = state
            .containers
            .get(container)
            .ok_or_else(|| StoreError::ContainerNotFound(container.to_string()))?;
        c.objects
            .get(object)
            .map(|o| o.data.clone())
            .ok_or_else(|| StoreError::not_found(container, object))
    }

    fn upload(
        &self,
        container: &str,
        object: &str,
        data: &[u8],
        overwrite: bool,
        lease_id: Option<&str>,
    ) -> StoreResult<()> {
        validate_object_name(object)?;
        let now = Utc::now();
        let mut state = self.lock()?;
        let c = container_mut(&mut state, container)?;
        let name = format!("{}/{}", container, object);
        match c.objects.get_mut(object) {
            Some(existing) => {
                if !overwrite {
                    return Err(StoreError::AlreadyExists(name));
                }
                check_write_lease(existing.lease.as_ref(), lease_id, &name, now)?;
                existing.data = data.to_vec();
            }
            None => {
                if lease_id.is_some() {
                    return Err(StoreError::LeaseNotPresent(name));
                }
                c.objects.insert(
                    object.to_string(),
                    MemoryObject {
                        data: data.to_vec(),
                        ..MemoryObject::default()
                    },
                );
            }
        }
        Ok(())
    }

    fn delete(&self, container: &str, object: &str, lease_id: Option<&str>) -> StoreResult<()> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let c = container_mut(&mut state, container)?;
        let existing = c
            .objects
            .get(object)
            .ok_or_else(|| StoreError::not_found(container, object))?;
        check_write_lease(
            existing.lease.as_ref(),
            lease_id,
            &format!("{}/{}", container, object),
            now,
        )?;
        c.objects.remove(object);
        Ok(())
    }

    fn list(&self, container: &str, prefix: &str) -> StoreResult<Vec<String>> {
        let state = self.lock()?;
        let c = state
            .containers
            .get(container)
            .ok_or_else(|| StoreError::ContainerNotFound(container.to_string()))?;
        Ok(c.objects
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn get_metadata(&self, container: &str, object: &str) -> StoreResult<HashMap<String, String>> {
        let state = self.lock()?;
        state
            .containers
            .get(container)
            .and_then(|c| c.objects.get(object))
            .map(|o| o.metadata.clone())
            .ok_or_else(|| StoreError::not_found(container, object))
    }

    fn set_metadata(
        &self,
        container: &str,
        object: &str,
        metadata: HashMap<String, String>,
        lease_id: Option<&str>,
    ) -> StoreResult<()> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let c = container_mut(&mut state, container)?;
        let existing = c
            .objects
            .get_mut(object)
            .ok_or_else(|| StoreError::not_found(container, object))?;
        check_write_lease(
            existing.lease.as_ref(),
            lease_id,
            &format!("{}/{}", container, object),
            now,
        )?;
        existing.metadata = metadata;
        Ok(())
    }

    fn acquire_lease(&self, resource: &ResourceKey, duration: LeaseDuration) -> StoreResult<String> {
        let now = Utc::now();
        let name = resource.to_string();
        let mut state = self.lock()?;
        let c = container_mut(&mut state, &resource.container)?;
        match &resource.object {
            None => grant_lease(&mut c.lease, duration, &name, now),
            Some(object) => {
                let o = c
                    .objects
                    .get_mut(object)
                    .ok_or_else(|| StoreError::not_found(&resource.container, object))?;
                grant_lease(&mut o.lease, duration, &name, now)
            }
        }
    }

    fn release_lease(&self, resource: &ResourceKey, lease_id: &str) -> StoreResult<()> {
        let now = Utc::now();
        let name = resource.to_string();
        let mut state = self.lock()?;
        let c = container_mut(&mut state, &resource.container)?;
        match &resource.object {
            None => release_slot(&mut c.lease, lease_id, &name, now),
            Some(object) => {
                let o = c
                    .objects
                    .get_mut(object)
                    .ok_or_else(|| StoreError::not_found(&resource.container, object))?;
                release_slot(&mut o.lease, lease_id, &name, now)
            }
        }
    }

    fn lease_state(&self, resource: &ResourceKey) -> StoreResult<LeaseState> {
        let now = Utc::now();
        let state = self.lock()?;
        let c = state
            .containers
            .get(&resource.container)
            .ok_or_else(|| StoreError::ContainerNotFound(resource.container.clone()))?;
        match &resource.object {
            None => Ok(slot_state(c.lease.as_ref(), now)),
            Some(object) => {
                let o = c
                    .objects
                    .get(object)
                    .ok_or_else(|| StoreError::not_found(&resource.container, object))?;
                Ok(slot_state(o.lease.as_ref(), now))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_container() -> MemoryObjectStore {
        let store = MemoryObjectStore::new();
        store.create_container("db").unwrap();
        store
    }

    #[test]
    fn test_upload_and_read() {
        let store = store_with_container();
        store.upload("db", "a.json", b"{}", true, None).unwrap();
        assert_eq!(store.read("db", "a.json").unwrap(), b"{}");
        assert!(store.exists("db", "a.json").unwrap());

        let err = store.read("db", "missing.json").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_upload_without_overwrite() {
        let store = store_with_container();
        store.upload("db", "a", b"1", false, None).unwrap();
        assert!(matches!(
            store.upload("db", "a", b"2", false, None),
            Err(StoreError::AlreadyExists(_))
        ));
        assert_eq!(store.read("db", "a").unwrap(), b"1");
    }

    #[test]
    fn test_leased_object_rejects_foreign_writes() {
        let store = store_with_container();
        store.upload("db", "map.json", b"{}", true, None).unwrap();
        let key = ResourceKey::object("db", "map.json");

        let lease_id = store.acquire_lease(&key, LeaseDuration::Fixed(20)).unwrap();
        assert!(store.lease_state(&key).unwrap().is_leased());

        assert!(matches!(
            store.acquire_lease(&key, LeaseDuration::Fixed(20)),
            Err(StoreError::LeaseAlreadyPresent(_))
        ));
        assert!(matches!(
            store.upload("db", "map.json", b"x", true, None),
            Err(StoreError::LeaseIdMissing(_))
        ));
        store
            .upload("db", "map.json", b"y", true, Some(&lease_id))
            .unwrap();

        store.release_lease(&key, &lease_id).unwrap();
        assert_eq!(store.lease_state(&key).unwrap(), LeaseState::Available);
        store.upload("db", "map.json", b"z", true, None).unwrap();
    }

    #[test]
    fn test_container_being_deleted() {
        let store = MemoryObjectStore::new();
        store.mark_container_being_deleted("docs", 2);
        assert!(matches!(
            store.create_container("docs"),
            Err(StoreError::ContainerBeingDeleted(_))
        ));
        assert!(store.create_container("docs").is_err());
        store.create_container("docs").unwrap();
        assert!(store.container_exists("docs").unwrap());
    }

    #[test]
    fn test_list_by_prefix() {
        let store = store_with_container();
        store.upload("db", "chunks/chunk_1.json", b"", true, None).unwrap();
        store.upload("db", "chunks/chunk_0.json", b"", true, None).unwrap();
        store.upload("db", "texts/a.txt", b"", true, None).unwrap();

        let listed = store.list("db", "chunks/").unwrap();
        assert_eq!(listed, vec!["chunks/chunk_0.json", "chunks/chunk_1.json"]);
    }
}
