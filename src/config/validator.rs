use crate::config::{Config, StorageBackend, SCHEMA_VERSION};
use crate::error::{BlobdexError, Result, ValidationError};
use crate::storage::{INFINITE_LEASE_SECS, MAX_LEASE_SECS, MIN_LEASE_SECS};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration, reporting every problem at once
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_storage(config, &mut errors);
        Self::validate_mapping(config, &mut errors);
        Self::validate_lease(config, &mut errors);
        Self::validate_lexical(config, &mut errors);
        Self::validate_vector(config, &mut errors);
        Self::validate_embedding(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(BlobdexError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != SCHEMA_VERSION {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_storage(config: &Config, errors: &mut Vec<ValidationError>) {
        let storage = &config.storage;
        if storage.backend == StorageBackend::Fs && storage.root.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.root",
                "Root directory cannot be empty for the fs backend",
            ));
        }
        Self::require_name("storage.db_container", &storage.db_container, errors);
        Self::require_name("storage.doc_container", &storage.doc_container, errors);
    }

    fn validate_mapping(config: &Config, errors: &mut Vec<ValidationError>) {
        let mapping = &config.mapping;
        Self::require_name("mapping.index_mapping_path", &mapping.index_mapping_path, errors);
        Self::require_name("mapping.blob_mapping_path", &mapping.blob_mapping_path, errors);

        if mapping.index_mapping_path == mapping.blob_mapping_path {
            errors.push(ValidationError::new(
                "mapping.blob_mapping_path",
                "Index and blob mappings must use different paths",
            ));
        }

        let index_paths = [&config.lexical.index_path, &config.vector.index_path];
        for (key, path) in [
            ("mapping.index_mapping_path", &mapping.index_mapping_path),
            ("mapping.blob_mapping_path", &mapping.blob_mapping_path),
        ] {
            if index_paths.contains(&path) {
                errors.push(ValidationError::new(
                    key,
                    format!("Path '{}' is already used by an index", path),
                ));
            }
        }
    }

    fn validate_lease(config: &Config, errors: &mut Vec<ValidationError>) {
        let secs = config.lease.duration_secs;
        if secs != INFINITE_LEASE_SECS && !(MIN_LEASE_SECS..=MAX_LEASE_SECS).contains(&secs) {
            errors.push(ValidationError::new(
                "lease.duration_secs",
                format!(
                    "Duration must be between {} and {} or {}, got {}",
                    MIN_LEASE_SECS, MAX_LEASE_SECS, INFINITE_LEASE_SECS, secs
                ),
            ));
        }

        if config.lease.max_retries == 0 {
            errors.push(ValidationError::new(
                "lease.max_retries",
                "Max retries must be at least 1",
            ));
        }
    }

    fn validate_lexical(config: &Config, errors: &mut Vec<ValidationError>) {
        let lexical = &config.lexical;
        if lexical.k1.is_nan() || lexical.k1 <= 0.0 {
            errors.push(ValidationError::new(
                "lexical.k1",
                format!("k1 must be greater than 0, got {}", lexical.k1),
            ));
        }
        if !(0.0..=1.0).contains(&lexical.b) {
            errors.push(ValidationError::new(
                "lexical.b",
                format!("b must be between 0.0 and 1.0, got {}", lexical.b),
            ));
        }
        Self::require_name("lexical.index_path", &lexical.index_path, errors);
    }

    fn validate_vector(config: &Config, errors: &mut Vec<ValidationError>) {
        let vector = &config.vector;
        if vector.ndims == 0 {
            errors.push(ValidationError::new(
                "vector.ndims",
                "Vector dimension must be greater than 0",
            ));
        }

        if vector.space().is_err() {
            errors.push(ValidationError::new(
                "vector.space",
                format!(
                    "Space must be 'euclidean', 'innerproduct' or 'cosine', got '{}'",
                    vector.space
                ),
            ));
        }

        if vector.m == 0 {
            errors.push(ValidationError::new("vector.m", "HNSW M must be greater than 0"));
        }

        if vector.ef_construction == 0 {
            errors.push(ValidationError::new(
                "vector.ef_construction",
                "HNSW ef_construction must be greater than 0",
            ));
        }

        if vector.ef_search == 0 {
            errors.push(ValidationError::new(
                "vector.ef_search",
                "HNSW ef_search must be greater than 0",
            ));
        }

        Self::require_name("vector.index_path", &vector.index_path, errors);
        if vector.index_path == config.lexical.index_path {
            errors.push(ValidationError::new(
                "vector.index_path",
                "Lexical and vector indexes must use different paths",
            ));
        }
    }

    fn validate_embedding(config: &Config, errors: &mut Vec<ValidationError>) {
        let embedding = &config.embedding;
        let valid_providers = ["hash", "fastembed"];
        if !valid_providers.contains(&embedding.provider.as_str()) {
            errors.push(ValidationError::new(
                "embedding.provider",
                format!(
                    "Provider must be one of {:?}, got '{}'",
                    valid_providers, embedding.provider
                ),
            ));
        }

        if embedding.model.is_empty() {
            errors.push(ValidationError::new(
                "embedding.model",
                "Model name cannot be empty",
            ));
        }

        if embedding.batch_size == 0 {
            errors.push(ValidationError::new(
                "embedding.batch_size",
                "Batch size must be greater than 0",
            ));
        }

        if embedding.dimension != config.vector.ndims {
            errors.push(ValidationError::new(
                "embedding.dimension",
                format!(
                    "Embedding dimension {} does not match vector.ndims {}",
                    embedding.dimension, config.vector.ndims
                ),
            ));
        }
    }

    fn require_name(path: &str, value: &str, errors: &mut Vec<ValidationError>) {
        if value.trim().is_empty() {
            errors.push(ValidationError::new(path, "Name cannot be empty"));
        }
    }
}
