//! Embedding generation
//!
//! The vector backend only sees [`EmbeddingProvider`]. The default provider
//! is a deterministic feature-hashing embedder that needs no model files;
//! FastEmbed is available behind the `fastembed` cargo feature.

mod hash;
mod provider;

pub use hash::HashEmbedder;
pub use provider::{EmbeddingError, EmbeddingProvider};

#[cfg(feature = "fastembed")]
pub use provider::FastEmbedProvider;

use crate::config::EmbeddingConfig;
use crate::error::{BlobdexError, Result};
use std::sync::Arc;

/// Build the provider named in the configuration
pub fn build_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let provider: Arc<dyn EmbeddingProvider> = match config.provider.as_str() {
        "hash" => Arc::new(HashEmbedder::new(config.dimension)?),
        #[cfg(feature = "fastembed")]
        "fastembed" => Arc::new(FastEmbedProvider::new(&config.model, config.batch_size)?),
        #[cfg(not(feature = "fastembed"))]
        "fastembed" => {
            return Err(BlobdexError::Config(
                "embedding provider 'fastembed' requires the `fastembed` feature".to_string(),
            ))
        }
        other => {
            return Err(BlobdexError::Config(format!(
                "Unknown embedding provider: {}",
                other
            )))
        }
    };

    if provider.dimension() != config.dimension {
        return Err(EmbeddingError::DimensionMismatch {
            expected: config.dimension,
            actual: provider.dimension(),
        }
        .into());
    }

    tracing::debug!(
        "Embedding provider ready: {} ({}D)",
        provider.model_name(),
        provider.dimension()
    );
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_hash_provider() {
        let config = EmbeddingConfig {
            provider: "hash".to_string(),
            dimension: 16,
            ..Default::default()
        };
        let provider = build_provider(&config).unwrap();
        assert_eq!(provider.dimension(), 16);
        assert_eq!(provider.model_name(), "fnv1a-hash-16");
    }

    #[test]
    fn test_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "openai".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            build_provider(&config),
            Err(BlobdexError::Config(_))
        ));
    }
}
