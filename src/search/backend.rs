//! Persisted index backends
//!
//! Each backend keeps its whole index as one zstd-compressed blob in the db
//! container. A mutation takes the blob's lease, reloads the latest blob,
//! applies the change, uploads the new export and releases the lease, so
//! concurrent writers never lose each other's updates.
//!
//! The two backends do not cost the same to mutate: every lexical
//! `remove`/`restore` rebuilds the BM25 model over the active documents,
//! while a vector `remove`/`restore` only flips a tombstone. The vector
//! backend keeps its decoded graph keyed by the blob digest and only
//! rebuilds it when another writer changed the blob.

use crate::embedding::{EmbeddingError, EmbeddingProvider};
use crate::error::{BlobdexError, Result};
use crate::index::{
    Bm25IndexManager, HnswParams, LexicalStats, Tokenizer, VectorIndexManager, VectorSpace,
    VectorStats,
};
use crate::lease::LeaseLock;
use crate::storage::{LeaseDuration, ResourceKey};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info};

/// Name the lexical backend is registered under in the index mapping
pub const LEXICAL_BACKEND: &str = "lexical";

/// Name the vector backend is registered under in the index mapping
pub const VECTOR_BACKEND: &str = "vector";

const COMPRESSION_LEVEL: i32 = 3;

/// One index backend as seen by the mapping manager
pub trait IndexBackend: Send + Sync {
    /// Key used for this backend in the index mapping
    fn name(&self) -> &str;

    /// Index one chunk text and return its backend-internal id
    fn add(&self, text: &str) -> Result<usize>;

    /// Hide a backend id from search results
    fn remove(&self, backend_id: usize) -> Result<()>;

    /// Make a removed backend id searchable again
    fn restore(&self, backend_id: usize) -> Result<()>;
}

/// A compressed index blob guarded by its own lease
pub struct PersistedIndex {
    lock: Arc<LeaseLock>,
    container: String,
    object: String,
    duration: LeaseDuration,
}

impl PersistedIndex {
    pub fn new(
        lock: Arc<LeaseLock>,
        container: impl Into<String>,
        object: impl Into<String>,
        duration: LeaseDuration,
    ) -> Self {
        Self {
            lock,
            container: container.into(),
            object: object.into(),
            duration,
        }
    }

    pub fn resource(&self) -> ResourceKey {
        ResourceKey::object(&self.container, &self.object)
    }

    /// Compressed blob as stored, or `None` when no index has been written yet
    fn read_compressed(&self) -> Result<Option<Vec<u8>>> {
        let data = match self.lock.store().read(&self.container, &self.object) {
            Ok(data) => data,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(if data.is_empty() { None } else { Some(data) })
    }

    fn decompress(&self, compressed: &[u8]) -> Result<Vec<u8>> {
        zstd::decode_all(compressed).map_err(|e| BlobdexError::Io {
            source: e,
            context: format!("Failed to decompress index {}", self.resource()),
        })
    }

    /// Decompressed blob, or `None` when no index has been written yet
    pub fn read(&self) -> Result<Option<Vec<u8>>> {
        match self.read_compressed()? {
            Some(compressed) => Ok(Some(self.decompress(&compressed)?)),
            None => Ok(None),
        }
    }

    /// Compress and upload `data`, returning the digest of the stored blob
    fn write(&self, data: &[u8]) -> Result<blake3::Hash> {
        let compressed = zstd::encode_all(data, COMPRESSION_LEVEL).map_err(|e| BlobdexError::Io {
            source: e,
            context: format!("Failed to compress index {}", self.resource()),
        })?;
        debug!(
            "Writing index {} ({} bytes, {} compressed)",
            self.resource(),
            data.len(),
            compressed.len()
        );
        self.lock.upload(&self.container, &self.object, &compressed)?;
        Ok(blake3::hash(&compressed))
    }

    /// Run `f` while holding the blob's lease; the lease is released on every path
    fn with_lease<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let resource = self.resource();
        self.lock.acquire(&resource, self.duration)?;
        let result = f();
        self.lock.release(&resource);
        result
    }
}

/// BM25 backend
pub struct LexicalBackend {
    index: PersistedIndex,
    k1: f64,
    b: f64,
    tokenizer: Arc<dyn Tokenizer>,
}

impl LexicalBackend {
    pub fn new(index: PersistedIndex, k1: f64, b: f64, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            index,
            k1,
            b,
            tokenizer,
        }
    }

    /// Latest persisted index, or a fresh one when none exists
    pub fn load(&self) -> Result<Bm25IndexManager> {
        match self.index.read()? {
            Some(bytes) => Ok(Bm25IndexManager::import_with_tokenizer(
                &bytes,
                self.tokenizer.clone(),
            )?),
            None => {
                debug!("No lexical index at {}, starting empty", self.index.resource());
                Ok(Bm25IndexManager::with_params(self.k1, self.b)?
                    .with_tokenizer(self.tokenizer.clone()))
            }
        }
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Bm25IndexManager) -> Result<T>) -> Result<T> {
        self.index.with_lease(|| {
            let mut manager = self.load()?;
            let out = f(&mut manager)?;
            self.index.write(&manager.export()?)?;
            Ok(out)
        })
    }

    pub fn search(&self, query: &str, k: usize) -> Result<(Vec<usize>, Vec<f64>)> {
        Ok(self.load()?.search(query, k))
    }

    pub fn stats(&self) -> Result<LexicalStats> {
        Ok(self.load()?.stats())
    }
}

impl IndexBackend for LexicalBackend {
    fn name(&self) -> &str {
        LEXICAL_BACKEND
    }

    fn add(&self, text: &str) -> Result<usize> {
        self.mutate(|manager| {
            manager.add(&[text]).pop().ok_or_else(|| {
                BlobdexError::NotInitialized("lexical index returned no id".to_string())
            })
        })
    }

    fn remove(&self, backend_id: usize) -> Result<()> {
        let started = Instant::now();
        self.mutate(|manager| Ok(manager.remove(&[backend_id])?))?;
        info!(
            "Lexical id {} removed, index rebuilt in {:?}",
            backend_id,
            started.elapsed()
        );
        Ok(())
    }

    fn restore(&self, backend_id: usize) -> Result<()> {
        let started = Instant::now();
        self.mutate(|manager| Ok(manager.unmark_deleted(&[backend_id])?))?;
        info!(
            "Lexical id {} restored, index rebuilt in {:?}",
            backend_id,
            started.elapsed()
        );
        Ok(())
    }
}

/// A decoded vector index and the digest of the blob it was decoded from
struct LoadedIndex {
    digest: Option<blake3::Hash>,
    manager: VectorIndexManager,
}

/// HNSW backend; texts are embedded before the blob lease is taken
pub struct VectorBackend {
    index: PersistedIndex,
    ndims: usize,
    space: VectorSpace,
    params: HnswParams,
    embedder: Arc<dyn EmbeddingProvider>,
    cache: Mutex<Option<LoadedIndex>>,
}

impl VectorBackend {
    pub fn new(
        index: PersistedIndex,
        ndims: usize,
        space: VectorSpace,
        params: HnswParams,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        if embedder.dimension() != ndims {
            return Err(EmbeddingError::DimensionMismatch {
                expected: ndims,
                actual: embedder.dimension(),
            }
            .into());
        }
        Ok(Self {
            index,
            ndims,
            space,
            params,
            embedder,
            cache: Mutex::new(None),
        })
    }

    pub fn space(&self) -> VectorSpace {
        self.space
    }

    fn cache(&self) -> MutexGuard<'_, Option<LoadedIndex>> {
        // a panic mid-mutation leaves nothing behind: the entry is taken first
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fresh(&self) -> Result<VectorIndexManager> {
        debug!("No vector index at {}, starting empty", self.index.resource());
        Ok(VectorIndexManager::with_params(
            self.ndims,
            self.space,
            self.params,
        )?)
    }

    /// Latest persisted index, or a fresh one when none exists
    ///
    /// Always decodes the blob; use the cached paths for repeated access.
    pub fn load(&self) -> Result<VectorIndexManager> {
        match self.index.read()? {
            Some(bytes) => self.decode(&bytes),
            None => self.fresh(),
        }
    }

    /// Take the latest index out of the cache, decoding the blob only when
    /// its digest differs from the cached one
    fn take_latest(&self, cache: &mut Option<LoadedIndex>) -> Result<LoadedIndex> {
        let cached = cache.take();
        let Some(compressed) = self.index.read_compressed()? else {
            return Ok(LoadedIndex {
                digest: None,
                manager: self.fresh()?,
            });
        };

        let digest = blake3::hash(&compressed);
        match cached {
            Some(loaded) if loaded.digest == Some(digest) => {
                debug!("Vector index {} unchanged, reusing graph", self.index.resource());
                Ok(loaded)
            }
            _ => {
                let started = Instant::now();
                let manager = self.decode(&self.index.decompress(&compressed)?)?;
                debug!(
                    "Vector index {} rebuilt in {:?}",
                    self.index.resource(),
                    started.elapsed()
                );
                Ok(LoadedIndex {
                    digest: Some(digest),
                    manager,
                })
            }
        }
    }

    #[cfg(test)]
    fn cached_digest(&self) -> Option<blake3::Hash> {
        self.cache().as_ref().and_then(|loaded| loaded.digest)
    }

    fn decode(&self, bytes: &[u8]) -> Result<VectorIndexManager> {
        let manager = VectorIndexManager::import(bytes)?;
        if manager.ndims() != self.ndims || manager.space() != self.space {
            return Err(BlobdexError::Validation(format!(
                "Vector index {} was built as {}D {}, configured as {}D {}",
                self.index.resource(),
                manager.ndims(),
                manager.space(),
                self.ndims,
                self.space
            )));
        }
        Ok(manager)
    }

    /// Mutate under the blob lease; the cache only keeps what was uploaded
    fn mutate<T>(&self, f: impl FnOnce(&mut VectorIndexManager) -> Result<T>) -> Result<T> {
        self.index.with_lease(|| {
            let mut cache = self.cache();
            let mut loaded = self.take_latest(&mut cache)?;
            let out = f(&mut loaded.manager)?;
            let digest = self.index.write(&loaded.manager.export()?)?;
            *cache = Some(LoadedIndex {
                digest: Some(digest),
                manager: loaded.manager,
            });
            Ok(out)
        })
    }

    /// Run a read-only `f` against the latest index
    fn read_latest<T>(&self, f: impl FnOnce(&VectorIndexManager) -> Result<T>) -> Result<T> {
        let mut cache = self.cache();
        let loaded = self.take_latest(&mut cache)?;
        let out = f(&loaded.manager);
        *cache = Some(loaded);
        out
    }

    /// Embed `query` and return the nearest live ids with raw distances
    pub fn search(&self, query: &str, k: usize) -> Result<(Vec<usize>, Vec<f32>)> {
        self.read_latest(|manager| {
            if manager.stats().active_vectors == 0 || k == 0 {
                return Ok((Vec::new(), Vec::new()));
            }
            let embedding = self.embedder.embed(query)?;
            Ok(manager.search(&embedding, k)?)
        })
    }

    pub fn stats(&self) -> Result<VectorStats> {
        self.read_latest(|manager| Ok(manager.stats()))
    }
}

impl IndexBackend for VectorBackend {
    fn name(&self) -> &str {
        VECTOR_BACKEND
    }

    fn add(&self, text: &str) -> Result<usize> {
        let embedding = self.embedder.embed(text)?;
        self.mutate(|manager| {
            manager.add(&[embedding]).map_err(BlobdexError::from)?.pop().ok_or_else(|| {
                BlobdexError::NotInitialized("vector index returned no id".to_string())
            })
        })
    }

    fn remove(&self, backend_id: usize) -> Result<()> {
        self.mutate(|manager| Ok(manager.remove(&[backend_id])?))?;
        debug!("Vector id {} soft-deleted", backend_id);
        Ok(())
    }

    fn restore(&self, backend_id: usize) -> Result<()> {
        self.mutate(|manager| Ok(manager.unmark_deleted(&[backend_id])?))?;
        debug!("Vector id {} restored", backend_id);
        Ok(())
    }
}
