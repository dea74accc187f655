//! BM25 lexical index manager
//!
//! Documents live in an append-only list whose positions are the backend ids.
//! Deleting only adds a position to the tombstone set, after which the BM25
//! model is rebuilt from scratch over the remaining active documents. The
//! rebuild re-tokenizes every active document, which makes `add`, `remove`
//! and `unmark_deleted` O(corpus); callers must serialize them.

use super::tokenizer::{MorphologicalTokenizer, Tokenizer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

/// Default term-frequency saturation
pub const DEFAULT_K1: f64 = 1.5;

/// Default length normalisation
pub const DEFAULT_B: f64 = 0.75;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum LexicalIndexError {
    #[error("Lexical index is not initialized: add documents first")]
    NotInitialized,

    #[error("Invalid BM25 parameter: {0}")]
    InvalidParameter(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Unsupported lexical snapshot version {0}")]
    UnsupportedVersion(u32),
}

/// Counts reported by [`Bm25IndexManager::stats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LexicalStats {
    pub num_documents: usize,
    pub active_documents: usize,
    pub vocabulary_size: usize,
}

#[derive(Serialize, Deserialize)]
struct LexicalSnapshot {
    version: u32,
    k1: f64,
    b: f64,
    documents: Vec<String>,
    deleted: BTreeSet<usize>,
}

/// Okapi BM25 over the active documents
#[derive(Debug, Default)]
struct Bm25Model {
    /// Document position for every model row
    active: Vec<usize>,
    term_freqs: Vec<HashMap<String, u32>>,
    doc_lens: Vec<usize>,
    avgdl: f64,
    idf: HashMap<String, f64>,
}

impl Bm25Model {
    fn build(documents: &[String], deleted: &BTreeSet<usize>, tokenizer: &dyn Tokenizer) -> Self {
        let active: Vec<usize> = (0..documents.len())
            .filter(|i| !deleted.contains(i))
            .collect();

        let mut term_freqs = Vec::with_capacity(active.len());
        let mut doc_lens = Vec::with_capacity(active.len());
        let mut doc_freq: HashMap<String, usize> = HashMap::new();

        for &position in &active {
            let tokens = tokenizer.tokenize(&documents[position]);
            doc_lens.push(tokens.len());
            let mut freqs: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *freqs.entry(token).or_insert(0) += 1;
            }
            for term in freqs.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            term_freqs.push(freqs);
        }

        let n = active.len() as f64;
        let avgdl = if active.is_empty() {
            0.0
        } else {
            doc_lens.iter().sum::<usize>() as f64 / n
        };
        let idf = doc_freq
            .into_iter()
            .map(|(term, df)| {
                let df = df as f64;
                (term, (1.0 + (n - df + 0.5) / (df + 0.5)).ln())
            })
            .collect();

        Self {
            active,
            term_freqs,
            doc_lens,
            avgdl,
            idf,
        }
    }

    fn scores(&self, query_terms: &[String], k1: f64, b: f64) -> Vec<f64> {
        let mut scores = vec![0.0; self.active.len()];
        if self.avgdl <= 0.0 {
            return scores;
        }
        for term in query_terms {
            let Some(idf) = self.idf.get(term) else {
                continue;
            };
            for (row, freqs) in self.term_freqs.iter().enumerate() {
                let Some(&tf) = freqs.get(term) else {
                    continue;
                };
                let tf = f64::from(tf);
                let norm = 1.0 - b + b * self.doc_lens[row] as f64 / self.avgdl;
                scores[row] += idf * (tf * (k1 + 1.0)) / (tf + k1 * norm);
            }
        }
        scores
    }
}

/// Ranked keyword retrieval with tombstone-based deletion
pub struct Bm25IndexManager {
    k1: f64,
    b: f64,
    documents: Vec<String>,
    deleted: BTreeSet<usize>,
    model: Bm25Model,
    tokenizer: Arc<dyn Tokenizer>,
}

impl Default for Bm25IndexManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Bm25IndexManager {
    pub fn new() -> Self {
        Self {
            k1: DEFAULT_K1,
            b: DEFAULT_B,
            documents: Vec::new(),
            deleted: BTreeSet::new(),
            model: Bm25Model::default(),
            tokenizer: Arc::new(MorphologicalTokenizer::new()),
        }
    }

    /// Custom BM25 parameters; `k1` must be positive and `b` within 0..=1
    pub fn with_params(k1: f64, b: f64) -> Result<Self, LexicalIndexError> {
        if !(k1 > 0.0 && k1.is_finite()) {
            return Err(LexicalIndexError::InvalidParameter(format!(
                "k1 must be positive, got {}",
                k1
            )));
        }
        if !(0.0..=1.0).contains(&b) {
            return Err(LexicalIndexError::InvalidParameter(format!(
                "b must be within 0..=1, got {}",
                b
            )));
        }
        Ok(Self {
            k1,
            b,
            ..Self::new()
        })
    }

    /// Replace the tokenizer and rebuild the model with it
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = tokenizer;
        self.rebuild();
        self
    }

    pub fn k1(&self) -> f64 {
        self.k1
    }

    pub fn b(&self) -> f64 {
        self.b
    }

    /// True once at least one document has been added
    pub fn is_initialized(&self) -> bool {
        !self.documents.is_empty()
    }

    /// Text stored at a position, deleted or not
    pub fn document(&self, id: usize) -> Option<&str> {
        self.documents.get(id).map(String::as_str)
    }

    pub fn is_deleted(&self, id: usize) -> bool {
        self.deleted.contains(&id)
    }

    fn rebuild(&mut self) {
        let started = Instant::now();
        self.model = Bm25Model::build(&self.documents, &self.deleted, self.tokenizer.as_ref());
        debug!(
            "Rebuilt BM25 model over {} active documents in {:?}",
            self.model.active.len(),
            started.elapsed()
        );
    }

    /// Append documents and return their positions
    ///
    /// Existing tombstones are kept even when every earlier document is deleted.
    pub fn add<S: AsRef<str>>(&mut self, documents: &[S]) -> Vec<usize> {
        let start = self.documents.len();
        self.documents
            .extend(documents.iter().map(|d| d.as_ref().to_string()));
        let ids: Vec<usize> = (start..self.documents.len()).collect();

        self.rebuild();
        info!("{} documents have been added to the lexical index", ids.len());
        ids
    }

    /// Tombstone the given positions; out-of-range ids are ignored
    pub fn remove(&mut self, ids: &[usize]) -> Result<(), LexicalIndexError> {
        if !self.is_initialized() {
            return Err(LexicalIndexError::NotInitialized);
        }
        let len = self.documents.len();
        for &id in ids.iter().filter(|&&id| id < len) {
            self.deleted.insert(id);
        }

        self.rebuild();
        info!("{} documents have been removed from the lexical index", ids.len());
        Ok(())
    }

    /// Lift tombstones so the positions are searchable again
    pub fn unmark_deleted(&mut self, ids: &[usize]) -> Result<(), LexicalIndexError> {
        if !self.is_initialized() {
            return Err(LexicalIndexError::NotInitialized);
        }
        for id in ids {
            self.deleted.remove(id);
        }

        self.rebuild();
        info!("Deletion flags cleared for {} documents", ids.len());
        Ok(())
    }

    /// Top `k` active positions with a positive score, best first
    ///
    /// Ties keep position order. An empty or uninitialized index yields empty lists.
    pub fn search(&self, query: &str, k: usize) -> (Vec<usize>, Vec<f64>) {
        if self.model.active.is_empty() || k == 0 {
            debug!("Lexical index is empty, no search results");
            return (Vec::new(), Vec::new());
        }

        let terms = self.tokenizer.tokenize(query);
        let scores = self.model.scores(&terms, self.k1, self.b);

        let mut ranked: Vec<(usize, f64)> = scores
            .into_iter()
            .enumerate()
            .filter(|(_, score)| *score > 0.0)
            .collect();
        // stable sort keeps lower positions ahead on ties
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(k);

        let ids = ranked.iter().map(|(row, _)| self.model.active[*row]).collect();
        let scores = ranked.into_iter().map(|(_, score)| score).collect();
        (ids, scores)
    }

    pub fn stats(&self) -> LexicalStats {
        LexicalStats {
            num_documents: self.documents.len(),
            active_documents: self.model.active.len(),
            vocabulary_size: self.model.idf.len(),
        }
    }

    /// Serialize documents, tombstones and parameters
    pub fn export(&self) -> Result<Vec<u8>, LexicalIndexError> {
        let snapshot = LexicalSnapshot {
            version: SNAPSHOT_VERSION,
            k1: self.k1,
            b: self.b,
            documents: self.documents.clone(),
            deleted: self.deleted.clone(),
        };
        serde_json::to_vec(&snapshot).map_err(|e| LexicalIndexError::SerializationError(e.to_string()))
    }

    /// Restore a manager from [`export`](Self::export) output
    pub fn import(bytes: &[u8]) -> Result<Self, LexicalIndexError> {
        Self::import_with_tokenizer(bytes, Arc::new(MorphologicalTokenizer::new()))
    }

    pub fn import_with_tokenizer(
        bytes: &[u8],
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Result<Self, LexicalIndexError> {
        let snapshot: LexicalSnapshot = serde_json::from_slice(bytes)
            .map_err(|e| LexicalIndexError::SerializationError(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(LexicalIndexError::UnsupportedVersion(snapshot.version));
        }

        let mut manager = Self::with_params(snapshot.k1, snapshot.b)?;
        manager.tokenizer = tokenizer;
        manager.documents = snapshot.documents;
        manager.deleted = snapshot.deleted;
        manager.rebuild();
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pets() -> Bm25IndexManager {
        let mut manager = Bm25IndexManager::new();
        let ids = manager.add(&["the cat sat on the mat", "the dog ran in the park"]);
        assert_eq!(ids, vec![0, 1]);
        manager
    }

    #[test]
    fn test_search_finds_matching_document() {
        let manager = pets();
        let (ids, scores) = manager.search("cat", 5);
        assert_eq!(ids, vec![0]);
        assert_eq!(scores.len(), 1);
        assert!(scores[0] > 0.0);
    }

    #[test]
    fn test_removed_document_disappears() {
        let mut manager = pets();
        manager.remove(&[0]).unwrap();
        let (ids, scores) = manager.search("cat", 5);
        assert!(ids.is_empty());
        assert!(scores.is_empty());

        manager.unmark_deleted(&[0]).unwrap();
        assert_eq!(manager.search("cat", 5).0, vec![0]);
    }

    #[test]
    fn test_positions_are_never_reused() {
        let mut manager = pets();
        manager.remove(&[0, 1]).unwrap();
        let ids = manager.add(&["a cat again"]);
        assert_eq!(ids, vec![2]);

        // earlier tombstones survive an add into an empty active set
        assert!(manager.is_deleted(0));
        assert_eq!(manager.search("cat", 5).0, vec![2]);
        assert_eq!(manager.stats().active_documents, 1);
    }

    #[test]
    fn test_ties_keep_position_order() {
        let mut manager = Bm25IndexManager::new();
        manager.add(&["apple pie", "banana", "apple pie"]);
        let (ids, scores) = manager.search("apple", 5);
        assert_eq!(ids, vec![0, 2]);
        assert_eq!(scores[0], scores[1]);
    }

    #[test]
    fn test_uninitialized_behaviour() {
        let mut manager = Bm25IndexManager::new();
        assert_eq!(manager.search("anything", 3), (vec![], vec![]));
        assert!(matches!(
            manager.remove(&[0]),
            Err(LexicalIndexError::NotInitialized)
        ));
        assert!(matches!(
            manager.unmark_deleted(&[0]),
            Err(LexicalIndexError::NotInitialized)
        ));
        assert_eq!(
            manager.stats(),
            LexicalStats {
                num_documents: 0,
                active_documents: 0,
                vocabulary_size: 0
            }
        );
    }

    #[test]
    fn test_out_of_range_remove_is_ignored() {
        let mut manager = pets();
        manager.remove(&[7]).unwrap();
        assert_eq!(manager.stats().active_documents, 2);
    }

    #[test]
    fn test_export_import_preserves_ranking() {
        let mut manager = Bm25IndexManager::with_params(1.2, 0.5).unwrap();
        manager.add(&[
            "rust ownership and borrowing",
            "the borrow checker in rust",
            "python garbage collection",
            "ownership rules",
        ]);
        manager.remove(&[2]).unwrap();

        let restored = Bm25IndexManager::import(&manager.export().unwrap()).unwrap();
        assert_eq!(restored.k1(), 1.2);
        assert_eq!(restored.b(), 0.5);
        assert!(restored.is_deleted(2));
        assert_eq!(restored.stats(), manager.stats());

        for query in ["rust", "ownership", "python", "borrow checker"] {
            let (ids_a, scores_a) = manager.search(query, 10);
            let (ids_b, scores_b) = restored.search(query, 10);
            assert_eq!(ids_a, ids_b);
            for (a, b) in scores_a.iter().zip(&scores_b) {
                assert!((a - b).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_japanese_documents() {
        let mut manager = Bm25IndexManager::new();
        manager.add(&["東京都の天気は晴れです", "大阪の天気は雨です"]);
        let (ids, _) = manager.search("東京", 5);
        assert_eq!(ids, vec![0]);
    }

    #[test]
    fn test_kyoto_does_not_match_tokyo_metropolis() {
        let mut manager = Bm25IndexManager::new();
        manager.add(&["東京都の人口は多い", "京都の寺は古い"]);
        let (ids, scores) = manager.search("京都", 5);
        assert_eq!(ids, vec![1]);
        assert!(scores[0] > 0.0);
    }

    #[test]
    fn test_invalid_params() {
        assert!(Bm25IndexManager::with_params(0.0, 0.5).is_err());
        assert!(Bm25IndexManager::with_params(1.5, 1.5).is_err());
    }
}
