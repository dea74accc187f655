//! Chunk id -> source object mapping with a reverse index
//!
//! Persisted as `{"<chunk_id>": {"container": "...", "blob": "..."}, ...}`.
//! The reverse index is never stored; it is derived from the forward map on
//! every load so the two cannot drift apart.

use super::{load_json, save_json};
use crate::error::Result;
use crate::lease::LeaseLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Source object a chunk was extracted from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub container: String,
    pub blob: String,
}

/// Forward map plus its derived reverse index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobMappingData {
    mapping: BTreeMap<String, BlobInfo>,
    reverse: HashMap<SourceKey, Vec<String>>,
}

/// `(container, blob)` of a source object
type SourceKey = (String, String);

/// Numeric chunk ids sort by value so reverse lists follow allocation order
fn chunk_order(id: &str) -> (u64, &str) {
    (id.parse().unwrap_or(u64::MAX), id)
}

impl BlobMappingData {
    fn from_mapping(mapping: BTreeMap<String, BlobInfo>) -> Self {
        let mut data = Self {
            mapping,
            reverse: HashMap::new(),
        };
        data.rebuild_reverse();
        data
    }

    fn rebuild_reverse(&mut self) {
        let mut reverse: HashMap<SourceKey, Vec<String>> = HashMap::new();
        for (chunk_id, info) in &self.mapping {
            reverse
                .entry((info.container.clone(), info.blob.clone()))
                .or_default()
                .push(chunk_id.clone());
        }
        for ids in reverse.values_mut() {
            ids.sort_by(|a, b| chunk_order(a).cmp(&chunk_order(b)));
        }
        self.reverse = reverse;
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn get(&self, chunk_id: &str) -> Option<&BlobInfo> {
        self.mapping.get(chunk_id)
    }

    pub fn chunk_ids(&self, container: &str, blob: &str) -> Vec<String> {
        self.reverse
            .get(&(container.to_string(), blob.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of distinct source objects
    pub fn source_count(&self) -> usize {
        self.reverse.len()
    }
}

/// Lease-guarded persistence for [`BlobMappingData`]
pub struct ChunkBlobMapping {
    lock: Arc<LeaseLock>,
    container: String,
    object: String,
}

impl ChunkBlobMapping {
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

    pub fn load(&self) -> Result<BlobMappingData> {
        let mapping: BTreeMap<String, BlobInfo> =
            load_json(self.lock.as_ref(), &self.container, &self.object)?;
        Ok(BlobMappingData::from_mapping(mapping))
    }

    fn save(&self, data: &BlobMappingData) -> Result<()> {
        save_json(self.lock.as_ref(), &self.container, &self.object, &data.mapping)
    }

    pub fn add_mapping(&self, chunk_id: &str, container: &str, blob: &str) -> Result<()> {
        let mut data = self.load()?;
        data.mapping.insert(
            chunk_id.to_string(),
            BlobInfo {
                container: container.to_string(),
                blob: blob.to_string(),
            },
        );
        data.rebuild_reverse();
        self.save(&data)?;
        debug!("Added blob mapping {} -> {}/{}", chunk_id, container, blob);
        Ok(())
    }

    pub fn remove_mapping(&self, chunk_id: &str) -> Result<()> {
        let mut data = self.load()?;
        if data.mapping.remove(chunk_id).is_some() {
            data.rebuild_reverse();
            self.save(&data)?;
            debug!("Removed blob mapping for chunk {}", chunk_id);
        }
        Ok(())
    }

    pub fn get_blob_info(&self, chunk_id: &str) -> Result<Option<BlobInfo>> {
        Ok(self.load()?.get(chunk_id).cloned())
    }

    /// Chunk ids registered for a source object, in allocation order
    pub fn get_chunk_ids_by_blob(&self, container: &str, blob: &str) -> Result<Vec<String>> {
        Ok(self.load()?.chunk_ids(container, blob))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseOptions;
    use crate::storage::{MemoryObjectStore, ObjectStore};
    use std::time::Duration;

    const OBJECT: &str = "mapping/chunk_blob_mapping.json";

    fn mapping() -> (Arc<MemoryObjectStore>, ChunkBlobMapping) {
        let store = Arc::new(MemoryObjectStore::new());
        store.create_container("db").unwrap();
        let lock = LeaseLock::with_options(
            store.clone(),
            LeaseOptions {
                max_retries: 2,
                retry_delay: Duration::from_millis(5),
            },
        );
        (store, ChunkBlobMapping::new(Arc::new(lock), "db", OBJECT))
    }

    #[test]
    fn test_reverse_index_follows_allocation_order() {
        let (_store, m) = mapping();
        for id in ["2", "10", "9"] {
            m.add_mapping(id, "docs", "a.pdf").unwrap();
        }
        m.add_mapping("3", "docs", "b.pdf").unwrap();

        assert_eq!(
            m.get_chunk_ids_by_blob("docs", "a.pdf").unwrap(),
            vec!["2", "9", "10"]
        );
        assert_eq!(m.get_chunk_ids_by_blob("docs", "b.pdf").unwrap(), vec!["3"]);
        assert!(m.get_chunk_ids_by_blob("docs", "none.pdf").unwrap().is_empty());
    }

    #[test]
    fn test_remove_updates_reverse_index() {
        let (_store, m) = mapping();
        m.add_mapping("0", "docs", "a.pdf").unwrap();
        m.add_mapping("1", "docs", "a.pdf").unwrap();
        m.remove_mapping("0").unwrap();
        m.remove_mapping("missing").unwrap();

        assert_eq!(m.get_chunk_ids_by_blob("docs", "a.pdf").unwrap(), vec!["1"]);
        assert_eq!(m.get_blob_info("0").unwrap(), None);
        assert_eq!(
            m.get_blob_info("1").unwrap(),
            Some(BlobInfo {
                container: "docs".to_string(),
                blob: "a.pdf".to_string()
            })
        );
    }

    #[test]
    fn test_separator_in_names_does_not_merge_sources() {
        let (_store, m) = mapping();
        m.add_mapping("0", "docs:a", "b.pdf").unwrap();
        m.add_mapping("1", "docs", "a:b.pdf").unwrap();

        assert_eq!(m.get_chunk_ids_by_blob("docs:a", "b.pdf").unwrap(), vec!["0"]);
        assert_eq!(m.get_chunk_ids_by_blob("docs", "a:b.pdf").unwrap(), vec!["1"]);
        assert_eq!(m.load().unwrap().source_count(), 2);
    }

    #[test]
    fn test_persisted_format_has_no_reverse_index() {
        let (store, m) = mapping();
        m.add_mapping("0", "docs", "a.pdf").unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&store.read("db", OBJECT).unwrap()).unwrap();
        assert_eq!(
            raw,
            serde_json::json!({"0": {"container": "docs", "blob": "a.pdf"}})
        );
    }

    #[test]
    fn test_corrupt_mapping_is_an_error() {
        let (store, m) = mapping();
        store.upload("db", OBJECT, b"{not json", true, None).unwrap();
        assert!(m.load().is_err());
    }
}
