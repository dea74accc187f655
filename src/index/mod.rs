//! Index managers
//!
//! Two in-memory index engines with the same id discipline (backend ids are
//! positions assigned on insert and never reused) but different deletion
//! cost: the lexical manager rebuilds its BM25 model on every remove, the
//! vector manager only flags ids.

pub mod lexical;
pub mod tokenizer;
pub mod vector;

pub use lexical::{Bm25IndexManager, LexicalIndexError, LexicalStats, DEFAULT_B, DEFAULT_K1};
pub use tokenizer::{MorphologicalTokenizer, Tokenizer, WhitespaceTokenizer};
pub use vector::{
    HnswParams, SpaceDistance, VectorIndexError, VectorIndexManager, VectorSpace, VectorStats,
};
