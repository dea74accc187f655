/// Embedding provider trait and FastEmbed implementation
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitializationError(String),

    #[error("Embedding generation failed: {0}")]
    GenerationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Trait for embedding providers
///
/// The vector backend only talks to this trait, so the model behind it can
/// be a local ONNX model, a remote service or a deterministic hash.
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embedding for a single text
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Generate embeddings for multiple texts, one vector per input in order
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|text| self.embed(text)).collect()
    }

    /// Get the embedding dimension
    fn dimension(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;
}

#[cfg(feature = "fastembed")]
pub use self::fast::FastEmbedProvider;

#[cfg(feature = "fastembed")]
mod fast {
    use super::{EmbeddingError, EmbeddingProvider};
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use std::sync::Arc;

    /// FastEmbed provider for local embedding generation
    ///
    /// Models are downloaded on first use to `~/.cache/huggingface/`.
    pub struct FastEmbedProvider {
        model: Arc<TextEmbedding>,
        model_name: String,
        dimension: usize,
        batch_size: usize,
    }

    impl FastEmbedProvider {
        pub fn new(model_name: &str, batch_size: usize) -> Result<Self, EmbeddingError> {
            let (embedding_model, dimension) = match model_name {
                "all-MiniLM-L6-v2" | "all-minilm-l6-v2" => (EmbeddingModel::AllMiniLML6V2, 384),
                "bge-small-en-v1.5" => (EmbeddingModel::BGESmallENV15, 384),
                "bge-base-en-v1.5" => (EmbeddingModel::BGEBaseENV15, 768),
                "multilingual-e5-small" => (EmbeddingModel::MultilingualE5Small, 384),
                _ => {
                    return Err(EmbeddingError::InitializationError(format!(
                        "Unsupported model: {}. Supported: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, multilingual-e5-small",
                        model_name
                    )));
                }
            };

            tracing::info!(
                "Initializing embedding model: {} ({}D)",
                model_name,
                dimension
            );

            let init_options = InitOptions::new(embedding_model).with_show_download_progress(true);
            let model = TextEmbedding::try_new(init_options)
                .map_err(|e| EmbeddingError::InitializationError(e.to_string()))?;

            Ok(Self {
                model: Arc::new(model),
                model_name: model_name.to_string(),
                dimension,
                batch_size,
            })
        }

        fn check(&self, embedding: &[f32]) -> Result<(), EmbeddingError> {
            if embedding.len() != self.dimension {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.dimension,
                    actual: embedding.len(),
                });
            }
            Ok(())
        }
    }

    impl EmbeddingProvider for FastEmbedProvider {
        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if text.is_empty() {
                return Err(EmbeddingError::InvalidInput("Empty text".to_string()));
            }
            let embedding = self
                .model
                .embed(vec![text.to_string()], None)
                .map_err(|e| EmbeddingError::GenerationError(e.to_string()))?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    EmbeddingError::GenerationError("No embeddings generated".to_string())
                })?;
            self.check(&embedding)?;
            Ok(embedding)
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            if texts.iter().any(|t| t.is_empty()) {
                return Err(EmbeddingError::InvalidInput(
                    "Batch contains empty text".to_string(),
                ));
            }
            let embeddings = self
                .model
                .embed(texts.to_vec(), Some(self.batch_size))
                .map_err(|e| EmbeddingError::GenerationError(e.to_string()))?;
            for embedding in &embeddings {
                self.check(embedding)?;
            }
            Ok(embeddings)
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn model_name(&self) -> &str {
            &self.model_name
        }
    }

}
