use super::{ChunkResolver, SearchResult, VectorBackend, VECTOR_BACKEND};
use crate::error::Result;
use std::sync::Arc;
use tracing::debug;

/// Nearest-neighbour search over chunk embeddings
pub struct VectorSearch {
    backend: Arc<VectorBackend>,
    resolver: Arc<ChunkResolver>,
}

impl VectorSearch {
    pub fn new(backend: Arc<VectorBackend>, resolver: Arc<ChunkResolver>) -> Self {
        Self { backend, resolver }
    }

    /// Top `k` chunks, best first
    ///
    /// Distances are turned into descending scores: `-d` for euclidean,
    /// `1 - d` for cosine and inner product.
    pub fn search(&self, query: &str, k: usize) -> Result<Vec<SearchResult>> {
        let (ids, distances) = self.backend.search(query, k)?;
        debug!("Vector search for {:?} matched {} ids", query, ids.len());
        let space = self.backend.space();
        let hits = ids
            .into_iter()
            .zip(distances)
            .map(|(id, distance)| (id, f64::from(space.similarity(distance))));
        self.resolver.resolve(VECTOR_BACKEND, hits)
    }
}
