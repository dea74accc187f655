//! Identity and mapping layer
//!
//! Two JSON objects in the db container tie everything together: the
//! chunk id -> backend id map (which also owns the chunk id counter) and the
//! chunk id -> source object map. [`MappingManager`] keeps them and every
//! index backend in step under leases.

pub mod blob_mapping;
pub mod index_mapping;
pub mod manager;

use crate::error::{BlobdexError, Result};
use crate::lease::LeaseLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use blob_mapping::{BlobInfo, BlobMappingData, ChunkBlobMapping};
pub use index_mapping::{BackendIds, ChunkIndexMapping, IndexMappingData};
pub use manager::{AddedChunk, MappingManager, RemovedChunk};

/// Default location of the chunk id -> backend id map
pub const DEFAULT_INDEX_MAPPING_PATH: &str = "mapping/chunk_index_mapping.json";

/// Default location of the chunk id -> source object map
pub const DEFAULT_BLOB_MAPPING_PATH: &str = "mapping/chunk_blob_mapping.json";

/// Content of one chunk, stored at [`chunk_object`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub text: String,
    pub document_name: String,
    pub page_number: u32,
    /// RFC 3339
    pub created_at: String,
}

/// Object path of a chunk's content in the db container
pub fn chunk_object(chunk_id: &str) -> String {
    format!("chunks/chunk_{}.json", chunk_id)
}

/// Read a JSON object; missing or empty objects read as the default value
pub(crate) fn load_json<T>(lock: &LeaseLock, container: &str, object: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let bytes = match lock.store().read(container, object) {
        Ok(bytes) => bytes,
        Err(e) if e.is_not_found() => return Ok(T::default()),
        Err(e) => return Err(e.into()),
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes).map_err(|e| BlobdexError::Json {
        source: e,
        context: format!("Failed to parse {}/{}", container, object),
    })
}

/// Replace a JSON object, presenting the caller's lease on it
pub(crate) fn save_json<T: Serialize>(
    lock: &LeaseLock,
    container: &str,
    object: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value).map_err(|e| BlobdexError::Json {
        source: e,
        context: format!("Failed to serialize {}/{}", container, object),
    })?;
    lock.upload(container, object, &bytes)
}
