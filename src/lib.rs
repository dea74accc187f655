//! blobdex - lease-guarded chunk index over an object store
//!
//! Documents in an object store are split into chunks and indexed by two
//! backends (BM25 and HNSW) that share a single chunk identity space. The
//! store has no transactions, so every multi-object mutation is serialized
//! with object leases.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod index;
pub mod ingest;
pub mod lease;
pub mod mapping;
pub mod search;
pub mod storage;

pub use error::{BlobdexError, Result};
