//! Configuration management for blobdex
//!
//! Configuration lives in a TOML file, can be overridden per key through
//! `BLOBDEX_SECTION__KEY` environment variables and is validated as a whole
//! before use.

use crate::error::{BlobdexError, Result};
use crate::index::{HnswParams, VectorSpace};
use crate::lease::LeaseOptions;
use crate::mapping::{DEFAULT_BLOB_MAPPING_PATH, DEFAULT_INDEX_MAPPING_PATH};
use crate::storage::LeaseDuration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod validator;

pub use validator::ConfigValidator;

/// Schema version written by `config init`
pub const SCHEMA_VERSION: &str = "1.0.0";

const ENV_PREFIX: &str = "BLOBDEX_";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub mapping: MappingConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub lexical: LexicalConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Which object store implementation to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Fs,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory of the filesystem store
    pub root: PathBuf,
    /// Container holding indexes, mappings and chunk objects
    pub db_container: String,
    /// Container holding source documents
    pub doc_container: String,
}

/// Object paths of the two mapping files inside the db container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    pub index_mapping_path: String,
    pub blob_mapping_path: String,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            index_mapping_path: DEFAULT_INDEX_MAPPING_PATH.to_string(),
            blob_mapping_path: DEFAULT_BLOB_MAPPING_PATH.to_string(),
        }
    }
}

/// Lease timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// 15..=60, or -1 for leases that never expire
    pub duration_secs: i64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_secs: 20,
            max_retries: 12,
            retry_delay_ms: 5000,
        }
    }
}

impl LeaseConfig {
    pub fn duration(&self) -> Result<LeaseDuration> {
        LeaseDuration::from_secs(self.duration_secs)
    }

    pub fn options(&self) -> LeaseOptions {
        LeaseOptions {
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

/// BM25 parameters and index location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LexicalConfig {
    pub k1: f64,
    pub b: f64,
    pub index_path: String,
}

impl Default for LexicalConfig {
    fn default() -> Self {
        Self {
            k1: crate::index::DEFAULT_K1,
            b: crate::index::DEFAULT_B,
            index_path: "index/lexical_index.bin".to_string(),
        }
    }
}

/// Vector index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    pub ndims: usize,
    /// "euclidean", "innerproduct" or "cosine"
    pub space: String,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub index_path: String,
}

impl Default for VectorConfig {
    fn default() -> Self {
        let params = HnswParams::default();
        Self {
            ndims: 384,
            space: "cosine".to_string(),
            m: params.m,
            ef_construction: params.ef_construction,
            ef_search: params.ef_search,
            index_path: "index/vector_index.bin".to_string(),
        }
    }
}

impl VectorConfig {
    pub fn space(&self) -> Result<VectorSpace> {
        Ok(self.space.parse::<VectorSpace>()?)
    }

    pub fn params(&self) -> HnswParams {
        HnswParams {
            m: self.m,
            ef_construction: self.ef_construction,
            ef_search: self.ef_search,
        }
    }
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// "hash" or "fastembed"
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hash".to_string(),
            model: "all-MiniLM-L6-v2".to_string(),
            dimension: 384,
            batch_size: 32,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BlobdexError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| BlobdexError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();
        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Load the file when it exists, defaults (plus env overrides) otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        tracing::debug!("No config at {:?}, using defaults", path);
        let mut config = Config::default();
        config.apply_env_overrides();
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BlobdexError::Io {
                source: e,
                context: format!("Failed to create config directory: {:?}", parent),
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| BlobdexError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: BLOBDEX_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(std::env::vars());
    }

    /// Apply `(NAME, value)` pairs; names without the `BLOBDEX_` prefix are ignored
    pub fn apply_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(config_key) = key.strip_prefix(ENV_PREFIX) {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
            value.parse().map_err(|_| BlobdexError::InvalidConfigValue {
                path: path.to_string(),
                message: format!("Cannot parse '{}'", value),
            })
        }

        match path {
            "STORAGE__BACKEND" => {
                self.storage.backend = match value.to_ascii_lowercase().as_str() {
                    "memory" => StorageBackend::Memory,
                    "fs" => StorageBackend::Fs,
                    _ => {
                        return Err(BlobdexError::InvalidConfigValue {
                            path: path.to_string(),
                            message: format!("Backend must be 'memory' or 'fs', got '{}'", value),
                        })
                    }
                };
            }
            "STORAGE__ROOT" => self.storage.root = PathBuf::from(value),
            "STORAGE__DB_CONTAINER" => self.storage.db_container = value.to_string(),
            "STORAGE__DOC_CONTAINER" => self.storage.doc_container = value.to_string(),
            "LEASE__DURATION_SECS" => self.lease.duration_secs = parse(path, value)?,
            "LEASE__MAX_RETRIES" => self.lease.max_retries = parse(path, value)?,
            "LEASE__RETRY_DELAY_MS" => self.lease.retry_delay_ms = parse(path, value)?,
            "LEXICAL__K1" => self.lexical.k1 = parse(path, value)?,
            "LEXICAL__B" => self.lexical.b = parse(path, value)?,
            "VECTOR__NDIMS" => self.vector.ndims = parse(path, value)?,
            "VECTOR__SPACE" => self.vector.space = value.to_string(),
            "VECTOR__EF_SEARCH" => self.vector.ef_search = parse(path, value)?,
            "EMBEDDING__PROVIDER" => self.embedding.provider = value.to_string(),
            "EMBEDDING__MODEL" => self.embedding.model = value.to_string(),
            "EMBEDDING__DIMENSION" => self.embedding.dimension = parse(path, value)?,
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| BlobdexError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("blobdex").join("config.toml"))
    }

    /// Get the default root of the filesystem object store
    pub fn default_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| BlobdexError::Config("Cannot determine data directory".to_string()))?;

        Ok(data_dir.join("blobdex").join("objects"))
    }
}

impl Default for Config {
    fn default() -> Self {
        let root = Self::default_data_dir().unwrap_or_else(|_| PathBuf::from(".blobdex/objects"));

        Self {
            meta: MetaConfig {
                schema_version: SCHEMA_VERSION.to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            storage: StorageConfig {
                backend: StorageBackend::Fs,
                root,
                db_container: "db-container".to_string(),
                doc_container: "doc-container".to_string(),
            },
            mapping: MappingConfig::default(),
            lease: LeaseConfig::default(),
            lexical: LexicalConfig::default(),
            vector: VectorConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.storage.root = temp.path().join("objects");
        config.vector.space = "innerproduct".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.storage.root, temp.path().join("objects"));
        assert_eq!(loaded.vector.space().unwrap(), VectorSpace::InnerProduct);
        assert_eq!(loaded.lease.duration().unwrap(), LeaseDuration::Fixed(20));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, BlobdexError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_optional_sections_default() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[_meta]
schema_version = "1.0.0"

[storage]
backend = "memory"
root = "unused"
db_container = "db"
doc_container = "docs"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.lexical.k1, 1.5);
        assert_eq!(config.mapping.index_mapping_path, DEFAULT_INDEX_MAPPING_PATH);
        assert_eq!(config.lease.options().max_retries, 12);
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config.apply_overrides(vars(&[
            ("BLOBDEX_STORAGE__BACKEND", "memory"),
            ("BLOBDEX_LEASE__DURATION_SECS", "-1"),
            ("BLOBDEX_LEXICAL__K1", "1.2"),
            ("BLOBDEX_VECTOR__SPACE", "euclidean"),
            ("BLOBDEX_UNKNOWN__KEY", "x"),
            ("PATH", "/usr/bin"),
        ]));
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.lease.duration().unwrap(), LeaseDuration::Infinite);
        assert_eq!(config.lexical.k1, 1.2);
        assert_eq!(config.vector.space, "euclidean");
    }

    #[test]
    fn test_bad_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(vars(&[
            ("BLOBDEX_LEASE__MAX_RETRIES", "many"),
            ("BLOBDEX_STORAGE__BACKEND", "s3"),
        ]));
        assert_eq!(config.lease.max_retries, 12);
        assert_eq!(config.storage.backend, StorageBackend::Fs);
    }
}
