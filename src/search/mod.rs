//! Query-time search facades
//!
//! A facade runs one backend, maps backend ids back to chunk ids and reads
//! the chunk content from the db container. Searches never take leases, so
//! anything that cannot be resolved in the current snapshot is skipped
//! instead of failing the query.

pub mod backend;
mod lexical;
mod vector;

pub use backend::{
    IndexBackend, LexicalBackend, PersistedIndex, VectorBackend, LEXICAL_BACKEND, VECTOR_BACKEND,
};
pub use lexical::LexicalSearch;
pub use vector::VectorSearch;

use crate::error::Result;
use crate::lease::LeaseLock;
use crate::mapping::{chunk_object, ChunkBlobMapping, ChunkIndexMapping, ChunkRecord};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// One ranked chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Chunk id
    pub id: String,
    /// Higher is more relevant
    pub score: f64,
    pub chunk_text: String,
    pub document_name: String,
    pub page_number: u32,
}

/// Which backend answers a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SearchBackend {
    Lexical,
    Vector,
}

impl fmt::Display for SearchBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchBackend::Lexical => write!(f, "{}", LEXICAL_BACKEND),
            SearchBackend::Vector => write!(f, "{}", VECTOR_BACKEND),
        }
    }
}

/// Turns backend hits into [`SearchResult`]s
pub struct ChunkResolver {
    lock: Arc<LeaseLock>,
    container: String,
    index_mapping: ChunkIndexMapping,
    blob_mapping: ChunkBlobMapping,
}

impl ChunkResolver {
    pub fn new(
        lock: Arc<LeaseLock>,
        container: impl Into<String>,
        index_mapping_path: &str,
        blob_mapping_path: &str,
    ) -> Self {
        let container = container.into();
        Self {
            index_mapping: ChunkIndexMapping::new(lock.clone(), &container, index_mapping_path),
            blob_mapping: ChunkBlobMapping::new(lock.clone(), &container, blob_mapping_path),
            lock,
            container,
        }
    }

    /// Resolve `(backend_id, score)` hits in order, dropping what cannot be found
    pub fn resolve<I>(&self, backend: &str, hits: I) -> Result<Vec<SearchResult>>
    where
        I: IntoIterator<Item = (usize, f64)>,
    {
        // one snapshot of each mapping for the whole result list
        let index_mapping = self.index_mapping.load()?;
        let blob_mapping = self.blob_mapping.load()?;

        let mut results = Vec::new();
        for (backend_id, score) in hits {
            let Some(chunk_id) = index_mapping.chunk_id(backend, backend_id) else {
                debug!("No chunk for {} id {}, skipping", backend, backend_id);
                continue;
            };
            let Some(chunk) = self.read_chunk(chunk_id) else {
                continue;
            };
            let document_name = blob_mapping
                .get(chunk_id)
                .map(|info| info.blob.clone())
                .unwrap_or(chunk.document_name);

            results.push(SearchResult {
                id: chunk_id.to_string(),
                score,
                chunk_text: chunk.text,
                document_name,
                page_number: chunk.page_number,
            });
        }
        Ok(results)
    }

    fn read_chunk(&self, chunk_id: &str) -> Option<ChunkRecord> {
        let object = chunk_object(chunk_id);
        let bytes = match self.lock.store().read(&self.container, &object) {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                debug!("Chunk {} has no content object, skipping", chunk_id);
                return None;
            }
            Err(e) => {
                warn!("Failed to read chunk {}: {}", chunk_id, e);
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(chunk) => Some(chunk),
            Err(e) => {
                warn!("Chunk {} is not valid JSON: {}", chunk_id, e);
                None
            }
        }
    }
}

/// Search through one backend
pub enum Searcher {
    Lexical(LexicalSearch),
    Vector(VectorSearch),
}

impl Searcher {
    pub fn backend(&self) -> SearchBackend {
        match self {
            Searcher::Lexical(_) => SearchBackend::Lexical,
            Searcher::Vector(_) => SearchBackend::Vector,
        }
    }

    pub fn search(&self, query: &str, k: usize) -> Result<Vec<SearchResult>> {
        match self {
            Searcher::Lexical(search) => search.search(query, k),
            Searcher::Vector(search) => search.search(query, k),
        }
    }
}
