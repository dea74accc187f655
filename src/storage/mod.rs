//! Storage layer for blobdex
//!
//! Provides the object-store interface the lease, mapping and index layers
//! are built on, with an in-memory and a filesystem implementation.

pub mod fs;
pub mod memory;
pub mod object_store;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::Result;
use std::sync::Arc;
use tracing::info;

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;
pub use object_store::{
    LeaseDuration, LeaseState, ObjectStore, ResourceKey, StoreError, StoreResult,
    INFINITE_LEASE_SECS, MAX_LEASE_SECS, MIN_LEASE_SECS,
};

/// Open the configured object store and make sure both containers exist
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config.backend {
        StorageBackend::Memory => Arc::new(MemoryObjectStore::new()),
        StorageBackend::Fs => Arc::new(FsObjectStore::new(&config.root)?),
    };

    for container in [&config.db_container, &config.doc_container] {
        ensure_container(store.as_ref(), container)?;
    }

    info!(
        "Opened {:?} object store (db: {}, docs: {})",
        config.backend, config.db_container, config.doc_container
    );
    Ok(store)
}

/// Create a container unless it already exists
pub fn ensure_container(store: &dyn ObjectStore, container: &str) -> StoreResult<()> {
    if store.container_exists(container)? {
        return Ok(());
    }
    match store.create_container(container) {
        Ok(()) | Err(StoreError::AlreadyExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}
