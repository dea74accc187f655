use super::{ChunkResolver, LexicalBackend, SearchResult, LEXICAL_BACKEND};
use crate::error::Result;
use std::sync::Arc;
use tracing::debug;

/// BM25 search over chunk texts
pub struct LexicalSearch {
    backend: Arc<LexicalBackend>,
    resolver: Arc<ChunkResolver>,
}

impl LexicalSearch {
    pub fn new(backend: Arc<LexicalBackend>, resolver: Arc<ChunkResolver>) -> Self {
        Self { backend, resolver }
    }

    /// Top `k` chunks by BM25 score, best first
    pub fn search(&self, query: &str, k: usize) -> Result<Vec<SearchResult>> {
        let (ids, scores) = self.backend.search(query, k)?;
        debug!("Lexical search for {:?} matched {} ids", query, ids.len());
        self.resolver
            .resolve(LEXICAL_BACKEND, ids.into_iter().zip(scores))
    }
}
