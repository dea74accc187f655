//! Mapping manager: the single writer path for chunks
//!
//! Every add/remove holds the index-mapping lease and then the blob-mapping
//! lease (always in that order) for its whole duration. Index blob leases
//! are taken by the backends themselves, strictly after both mapping leases.

use super::{BackendIds, BlobInfo, ChunkBlobMapping, ChunkIndexMapping};
use crate::error::Result;
use crate::lease::LeaseLock;
use crate::search::IndexBackend;
use crate::storage::{LeaseDuration, ResourceKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A chunk registered by [`MappingManager::add`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedChunk {
    pub chunk_id: String,
    pub text: String,
}

/// Mapping entries a chunk had when it was removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedChunk {
    pub chunk_id: String,
    pub index_ids: BackendIds,
    pub source: Option<BlobInfo>,
}

pub struct MappingManager {
    lock: Arc<LeaseLock>,
    index_mapping: ChunkIndexMapping,
    blob_mapping: ChunkBlobMapping,
    backends: Vec<Arc<dyn IndexBackend>>,
    lease_duration: LeaseDuration,
}

impl MappingManager {
    pub fn new(
        lock: Arc<LeaseLock>,
        container: &str,
        index_mapping_path: &str,
        blob_mapping_path: &str,
        backends: Vec<Arc<dyn IndexBackend>>,
        lease_duration: LeaseDuration,
    ) -> Self {
        Self {
            index_mapping: ChunkIndexMapping::new(lock.clone(), container, index_mapping_path),
            blob_mapping: ChunkBlobMapping::new(lock.clone(), container, blob_mapping_path),
            lock,
            backends,
            lease_duration,
        }
    }

    pub fn index_mapping(&self) -> &ChunkIndexMapping {
        &self.index_mapping
    }

    pub fn blob_mapping(&self) -> &ChunkBlobMapping {
        &self.blob_mapping
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Run `f` holding both mapping leases, releasing them on every path
    fn with_mapping_leases<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let index_resource =
            ResourceKey::object(self.index_mapping.container(), self.index_mapping.object());
        let blob_resource =
            ResourceKey::object(self.blob_mapping.container(), self.blob_mapping.object());

        self.lock.acquire(&index_resource, self.lease_duration)?;
        if let Err(e) = self.lock.acquire(&blob_resource, self.lease_duration) {
            self.lock.release(&index_resource);
            return Err(e);
        }

        let result = f();

        self.lock.release(&blob_resource);
        self.lock.release(&index_resource);
        result
    }

    /// Register `texts` as new chunks of `container/object` in every backend
    ///
    /// A backend failure aborts the call; chunks registered before the
    /// failure stay registered and the caller is expected to roll them back.
    pub fn add<S: AsRef<str>>(
        &self,
        container: &str,
        object: &str,
        texts: &[S],
    ) -> Result<Vec<AddedChunk>> {
        self.with_mapping_leases(|| {
            let mut added = Vec::with_capacity(texts.len());
            for text in texts {
                let text = text.as_ref();
                let chunk_id = self.index_mapping.get_new_id()?;

                let mut index_ids = BackendIds::new();
                for backend in &self.backends {
                    let backend_id = backend.add(text)?;
                    index_ids.insert(backend.name().to_string(), backend_id);
                }

                self.index_mapping.add_mapping(&chunk_id, index_ids)?;
                self.blob_mapping.add_mapping(&chunk_id, container, object)?;
                debug!("Registered chunk {} for {}/{}", chunk_id, container, object);

                added.push(AddedChunk {
                    chunk_id,
                    text: text.to_string(),
                });
            }
            info!(
                "Added {} chunks for {}/{}",
                added.len(),
                container,
                object
            );
            Ok(added)
        })
    }

    /// Remove a chunk from every backend and both mappings
    ///
    /// Backend failures are logged and skipped; the mapping entries are
    /// removed regardless. Returns `None` when the chunk was unknown.
    pub fn remove(&self, chunk_id: &str) -> Result<Option<RemovedChunk>> {
        self.with_mapping_leases(|| {
            let index_ids = self.index_mapping.get_index_ids(chunk_id)?;
            let source = self.blob_mapping.get_blob_info(chunk_id)?;
            if index_ids.is_none() && source.is_none() {
                debug!("Chunk {} is not registered", chunk_id);
                return Ok(None);
            }
            let index_ids = index_ids.unwrap_or_default();

            for backend in &self.backends {
                let Some(&backend_id) = index_ids.get(backend.name()) else {
                    warn!(
                        chunk_id = %chunk_id,
                        backend = backend.name(),
                        "Chunk has no id in backend"
                    );
                    continue;
                };
                if let Err(e) = backend.remove(backend_id) {
                    warn!(
                        chunk_id = %chunk_id,
                        backend = backend.name(),
                        error = %e,
                        "Failed to remove chunk from backend"
                    );
                }
            }

            self.index_mapping.remove_mapping(chunk_id)?;
            self.blob_mapping.remove_mapping(chunk_id)?;
            info!("Removed chunk {}", chunk_id);

            Ok(Some(RemovedChunk {
                chunk_id: chunk_id.to_string(),
                index_ids,
                source,
            }))
        })
    }

    /// Undo [`remove`](Self::remove): make the backend ids searchable again
    /// and re-register both mapping entries
    ///
    /// Unlike removal, a backend failure aborts the restore before any
    /// mapping is written.
    pub fn restore(&self, removed: &RemovedChunk) -> Result<()> {
        self.with_mapping_leases(|| {
            for backend in &self.backends {
                if let Some(&backend_id) = removed.index_ids.get(backend.name()) {
                    backend.restore(backend_id)?;
                }
            }

            self.index_mapping
                .add_mapping(&removed.chunk_id, removed.index_ids.clone())?;
            if let Some(source) = &removed.source {
                self.blob_mapping
                    .add_mapping(&removed.chunk_id, &source.container, &source.blob)?;
            }
            info!("Restored chunk {}", removed.chunk_id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BlobdexError;
    use crate::lease::LeaseOptions;
    use crate::storage::{MemoryObjectStore, ObjectStore};
    use std::sync::Mutex;
    use std::time::Duration;

    const INDEX_MAP: &str = "mapping/chunk_index_mapping.json";
    const BLOB_MAP: &str = "mapping/chunk_blob_mapping.json";

    /// In-memory backend that records calls and can be told to fail
    struct FakeBackend {
        name: &'static str,
        texts: Mutex<Vec<String>>,
        removed: Mutex<Vec<usize>>,
        fail_add: bool,
        fail_remove: bool,
    }

    impl FakeBackend {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                texts: Mutex::new(Vec::new()),
                removed: Mutex::new(Vec::new()),
                fail_add: false,
                fail_remove: false,
            }
        }
    }

    impl IndexBackend for FakeBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn add(&self, text: &str) -> Result<usize> {
            if self.fail_add {
                return Err(BlobdexError::Validation("add failed".to_string()));
            }
            let mut texts = self.texts.lock().unwrap();
            texts.push(text.to_string());
            Ok(texts.len() - 1)
        }

        fn remove(&self, backend_id: usize) -> Result<()> {
            if self.fail_remove {
                return Err(BlobdexError::Validation("remove failed".to_string()));
            }
            self.removed.lock().unwrap().push(backend_id);
            Ok(())
        }

        fn restore(&self, backend_id: usize) -> Result<()> {
            self.removed.lock().unwrap().retain(|&id| id != backend_id);
            Ok(())
        }
    }

    fn options() -> LeaseOptions {
        LeaseOptions {
            max_retries: 2,
            retry_delay: Duration::from_millis(5),
        }
    }

    fn manager_with(
        store: &Arc<MemoryObjectStore>,
        backends: Vec<Arc<dyn IndexBackend>>,
    ) -> MappingManager {
        let lock = Arc::new(LeaseLock::with_options(store.clone(), options()));
        MappingManager::new(
            lock,
            "db",
            INDEX_MAP,
            BLOB_MAP,
            backends,
            LeaseDuration::Fixed(15),
        )
    }

    fn store() -> Arc<MemoryObjectStore> {
        let store = Arc::new(MemoryObjectStore::new());
        store.create_container("db").unwrap();
        store
    }

    #[test]
    fn test_add_registers_chunks_in_order() {
        let store = store();
        let lexical = Arc::new(FakeBackend::new("lexical"));
        let vector = Arc::new(FakeBackend::new("vector"));
        let manager = manager_with(&store, vec![lexical.clone(), vector.clone()]);

        let added = manager.add("docs", "a.pdf", &["t1", "t2"]).unwrap();
        let ids: Vec<&str> = added.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1"]);
        assert_eq!(added[1].text, "t2");

        assert_eq!(
            manager
                .blob_mapping()
                .get_chunk_ids_by_blob("docs", "a.pdf")
                .unwrap(),
            vec!["0", "1"]
        );
        let index_ids = manager.index_mapping().get_index_ids("1").unwrap().unwrap();
        assert_eq!(index_ids.len(), 2);
        assert_eq!(index_ids["lexical"], 1);
        assert_eq!(index_ids["vector"], 1);
        assert_eq!(*lexical.texts.lock().unwrap(), vec!["t1", "t2"]);
        assert!(manager.lock.held().is_empty());
    }

    #[test]
    fn test_ids_survive_removal_and_restart() {
        let store = store();
        let manager = manager_with(&store, vec![Arc::new(FakeBackend::new("lexical"))]);
        manager.add("docs", "a.pdf", &["t1", "t2"]).unwrap();
        manager.remove("1").unwrap();

        // a fresh manager over the same store continues the counter
        let manager = manager_with(&store, vec![Arc::new(FakeBackend::new("lexical"))]);
        let added = manager.add("docs", "b.pdf", &["t3"]).unwrap();
        assert_eq!(added[0].chunk_id, "2");
    }

    #[test]
    fn test_remove_tolerates_backend_failure() {
        let store = store();
        let mut broken = FakeBackend::new("vector");
        broken.fail_remove = true;
        let lexical = Arc::new(FakeBackend::new("lexical"));
        let manager = manager_with(&store, vec![lexical.clone(), Arc::new(broken)]);

        manager.add("docs", "a.pdf", &["t1"]).unwrap();
        let removed = manager.remove("0").unwrap().unwrap();

        assert_eq!(removed.index_ids.len(), 2);
        assert_eq!(*lexical.removed.lock().unwrap(), vec![0]);
        assert_eq!(manager.index_mapping().get_index_ids("0").unwrap(), None);
        assert_eq!(manager.blob_mapping().get_blob_info("0").unwrap(), None);
        assert!(manager.lock.held().is_empty());
    }

    #[test]
    fn test_remove_unknown_chunk() {
        let store = store();
        let manager = manager_with(&store, vec![Arc::new(FakeBackend::new("lexical"))]);
        assert_eq!(manager.remove("42").unwrap(), None);
    }

    #[test]
    fn test_restore_reregisters_mappings() {
        let store = store();
        let lexical = Arc::new(FakeBackend::new("lexical"));
        let manager = manager_with(&store, vec![lexical.clone()]);
        manager.add("docs", "a.pdf", &["t1", "t2"]).unwrap();

        let removed = manager.remove("0").unwrap().unwrap();
        manager.restore(&removed).unwrap();

        assert!(lexical.removed.lock().unwrap().is_empty());
        assert_eq!(
            manager
                .blob_mapping()
                .get_chunk_ids_by_blob("docs", "a.pdf")
                .unwrap(),
            vec!["0", "1"]
        );
        assert_eq!(
            manager.index_mapping().get_chunk_id("lexical", 0).unwrap(),
            Some("0".to_string())
        );
    }

    #[test]
    fn test_backend_add_failure_aborts() {
        let store = store();
        let mut broken = FakeBackend::new("vector");
        broken.fail_add = true;
        let manager = manager_with(
            &store,
            vec![Arc::new(FakeBackend::new("lexical")), Arc::new(broken)],
        );

        assert!(manager.add("docs", "a.pdf", &["t1"]).is_err());
        assert!(manager
            .blob_mapping()
            .get_chunk_ids_by_blob("docs", "a.pdf")
            .unwrap()
            .is_empty());
        assert!(manager.lock.held().is_empty());
    }

    #[test]
    fn test_contended_mapping_aborts_before_any_chunk() {
        let store = store();
        let manager = manager_with(&store, vec![Arc::new(FakeBackend::new("lexical"))]);

        // another actor holds the blob mapping lease
        let other = LeaseLock::with_options(store.clone(), options());
        other
            .acquire(&ResourceKey::object("db", BLOB_MAP), LeaseDuration::Fixed(60))
            .unwrap();

        let err = manager.add("docs", "a.pdf", &["t1"]).unwrap_err();
        assert!(matches!(err, BlobdexError::LockAcquisition { .. }));
        assert!(manager.lock.held().is_empty());
        assert_eq!(manager.index_mapping().load().unwrap().id_counter, 0);
    }
}
