//! Chunk id allocation and chunk id -> backend id mapping
//!
//! Persisted as one JSON object:
//! `{"id_counter": 3, "id_map": {"0": {"lexical": 0, "vector": 0}, ...}}`

use super::{load_json, save_json};
use crate::error::Result;
use crate::lease::LeaseLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Backend name -> backend-internal id
pub type BackendIds = BTreeMap<String, usize>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMappingData {
    #[serde(default)]
    pub id_counter: u64,
    #[serde(default)]
    pub id_map: BTreeMap<String, BackendIds>,
}

impl IndexMappingData {
    /// Chunk that owns `backend_id` in `backend` (linear scan)
    pub fn chunk_id(&self, backend: &str, backend_id: usize) -> Option<&str> {
        self.id_map
            .iter()
            .find(|(_, ids)| ids.get(backend) == Some(&backend_id))
            .map(|(chunk_id, _)| chunk_id.as_str())
    }
}

/// Durable chunk-id counter plus the backend id of every chunk
///
/// Every call reloads the object first and every mutation writes it back
/// whole. Mutations must run while the caller holds the object's lease.
pub struct ChunkIndexMapping {
    lock: Arc<LeaseLock>,
    container: String,
    object: String,
}

impl ChunkIndexMapping {
    pub fn new(lock: Arc<LeaseLock>, container: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            lock,
            container: container.into(),
            object: object.into(),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    /// Latest persisted state
    pub fn load(&self) -> Result<IndexMappingData> {
        load_json(self.lock.as_ref(), &self.container, &self.object)
    }

    fn save(&self, data: &IndexMappingData) -> Result<()> {
        save_json(self.lock.as_ref(), &self.container, &self.object, data)
    }

    /// Allocate the next chunk id; ids are never handed out twice
    pub fn get_new_id(&self) -> Result<String> {
        let mut data = self.load()?;
        let id = data.id_counter;
        data.id_counter += 1;
        self.save(&data)?;
        debug!("Allocated chunk id {}", id);
        Ok(id.to_string())
    }

    pub fn add_mapping(&self, chunk_id: &str, index_ids: BackendIds) -> Result<()> {
        let mut data = self.load()?;
        data.id_map.insert(chunk_id.to_string(), index_ids);
        self.save(&data)?;
        debug!("Added index mapping for chunk {}", chunk_id);
        Ok(())
    }

    pub fn remove_mapping(&self, chunk_id: &str) -> Result<()> {
        let mut data = self.load()?;
        if data.id_map.remove(chunk_id).is_some() {
            self.save(&data)?;
            debug!("Removed index mapping for chunk {}", chunk_id);
        }
        Ok(())
    }

    pub fn get_index_ids(&self, chunk_id: &str) -> Result<Option<BackendIds>> {
        Ok(self.load()?.id_map.remove(chunk_id))
    }

    /// Chunk that owns `backend_id` in `backend` (linear scan)
    pub fn get_chunk_id(&self, backend: &str, backend_id: usize) -> Result<Option<String>> {
        Ok(self
            .load()?
            .chunk_id(backend, backend_id)
            .map(str::to_string))
    }
}
