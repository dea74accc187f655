//! Wiring: builds the store, lease lock, backends, mapping manager,
//! processor and search facades from one [`Config`]

use crate::config::Config;
use crate::embedding::{build_provider, EmbeddingProvider};
use crate::error::{BlobdexError, Result};
use crate::index::{MorphologicalTokenizer, LexicalStats, VectorStats};
use crate::ingest::{DocumentProcessor, ParserRegistry, ProcessOutcome};
use crate::lease::LeaseLock;
use crate::mapping::{MappingManager, RemovedChunk};
use crate::search::{
    ChunkResolver, IndexBackend, LexicalBackend, LexicalSearch, PersistedIndex, SearchBackend,
    SearchResult, Searcher, VectorBackend, VectorSearch,
};
use crate::storage::{ensure_container, open_store, ObjectStore};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Where removed chunks are parked so they can be restored
pub fn removed_object(chunk_id: &str) -> String {
    format!("removed/chunk_{}.json", chunk_id)
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub chunks: usize,
    pub documents: usize,
    pub lexical: LexicalStats,
    pub vector: VectorStats,
}

pub struct Engine {
    config: Config,
    lock: Arc<LeaseLock>,
    lexical: Arc<LexicalBackend>,
    vector: Arc<VectorBackend>,
    manager: Arc<MappingManager>,
    processor: DocumentProcessor,
    resolver: Arc<ChunkResolver>,
}

impl Engine {
    /// Open the configured store and build everything on top of it
    pub fn open(config: Config) -> Result<Self> {
        let store = open_store(&config.storage)?;
        Self::with_store(config, store)
    }

    /// Build on an existing store with the configured embedder and built-in parsers
    pub fn with_store(config: Config, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let embedder = build_provider(&config.embedding)?;
        Self::with_components(config, store, embedder, ParserRegistry::new())
    }

    pub fn with_components(
        config: Config,
        store: Arc<dyn ObjectStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        parsers: ParserRegistry,
    ) -> Result<Self> {
        let storage = &config.storage;
        ensure_container(store.as_ref(), &storage.db_container)?;

        let lock = Arc::new(LeaseLock::with_options(store, config.lease.options()));
        let duration = config.lease.duration()?;
        let db = storage.db_container.as_str();

        let lexical = Arc::new(LexicalBackend::new(
            PersistedIndex::new(lock.clone(), db, &config.lexical.index_path, duration),
            config.lexical.k1,
            config.lexical.b,
            Arc::new(MorphologicalTokenizer::new()),
        ));
        let vector = Arc::new(VectorBackend::new(
            PersistedIndex::new(lock.clone(), db, &config.vector.index_path, duration),
            config.vector.ndims,
            config.vector.space()?,
            config.vector.params(),
            embedder,
        )?);

        let backends: Vec<Arc<dyn IndexBackend>> = vec![lexical.clone(), vector.clone()];
        let manager = Arc::new(MappingManager::new(
            lock.clone(),
            db,
            &config.mapping.index_mapping_path,
            &config.mapping.blob_mapping_path,
            backends,
            duration,
        ));
        let processor =
            DocumentProcessor::new(lock.clone(), manager.clone(), Arc::new(parsers), db);
        let resolver = Arc::new(ChunkResolver::new(
            lock.clone(),
            db,
            &config.mapping.index_mapping_path,
            &config.mapping.blob_mapping_path,
        ));

        debug!("Engine ready over db container '{}'", db);
        Ok(Self {
            config,
            lock,
            lexical,
            vector,
            manager,
            processor,
            resolver,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn lock(&self) -> &Arc<LeaseLock> {
        &self.lock
    }

    pub fn manager(&self) -> &Arc<MappingManager> {
        &self.manager
    }

    pub fn processor(&self) -> &DocumentProcessor {
        &self.processor
    }

    pub fn searcher(&self, backend: SearchBackend) -> Searcher {
        match backend {
            SearchBackend::Lexical => {
                Searcher::Lexical(LexicalSearch::new(self.lexical.clone(), self.resolver.clone()))
            }
            SearchBackend::Vector => {
                Searcher::Vector(VectorSearch::new(self.vector.clone(), self.resolver.clone()))
            }
        }
    }

    pub fn search(&self, query: &str, k: usize, backend: SearchBackend) -> Result<Vec<SearchResult>> {
        self.searcher(backend).search(query, k)
    }

    /// Upload a local file as `container/object` and index it
    pub fn ingest_file(&self, container: &str, object: &str, path: &Path) -> Result<ProcessOutcome> {
        let data = std::fs::read(path).map_err(|e| BlobdexError::Io {
            source: e,
            context: format!("Failed to read {:?}", path),
        })?;
        ensure_container(self.lock.store().as_ref(), container)?;
        self.lock.upload(container, object, &data)?;
        info!("Uploaded {:?} as {}/{} ({} bytes)", path, container, object, data.len());
        self.processor.process(container, object)
    }

    /// Remove one chunk, parking its mapping entries for [`restore_chunk`](Self::restore_chunk)
    ///
    /// Returns false when the chunk is unknown.
    pub fn remove_chunk(&self, chunk_id: &str) -> Result<bool> {
        let Some(removed) = self.manager.remove(chunk_id)? else {
            return Ok(false);
        };
        let bytes = serde_json::to_vec(&removed).map_err(|e| BlobdexError::Json {
            source: e,
            context: format!("Failed to serialize removed chunk {}", chunk_id),
        })?;
        self.lock
            .upload(&self.config.storage.db_container, &removed_object(chunk_id), &bytes)?;
        Ok(true)
    }

    /// Bring back a chunk removed with [`remove_chunk`](Self::remove_chunk)
    ///
    /// Returns false when no removal record exists for the chunk.
    pub fn restore_chunk(&self, chunk_id: &str) -> Result<bool> {
        let db = &self.config.storage.db_container;
        let object = removed_object(chunk_id);
        let bytes = match self.lock.store().read(db, &object) {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let removed: RemovedChunk = serde_json::from_slice(&bytes).map_err(|e| BlobdexError::Json {
            source: e,
            context: format!("Failed to parse {}", object),
        })?;

        self.manager.restore(&removed)?;
        self.lock.delete(db, &object)?;
        Ok(true)
    }

    pub fn stats(&self) -> Result<EngineStats> {
        let blob_mapping = self.manager.blob_mapping().load()?;
        Ok(EngineStats {
            chunks: blob_mapping.len(),
            documents: blob_mapping.source_count(),
            lexical: self.lexical.stats()?,
            vector: self.vector.stats()?,
        })
    }
}
