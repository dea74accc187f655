//! Deterministic feature-hashing embedder
//!
//! Each token is hashed with FNV-1a into one of `dimension` buckets, with the
//! sign taken from a second hash bit so collisions tend to cancel. The
//! result is L2-normalised, which makes cosine and inner-product search
//! agree. No model, no network: texts sharing tokens land close together.

use super::provider::{EmbeddingError, EmbeddingProvider};
use crate::index::{MorphologicalTokenizer, Tokenizer};
use std::sync::Arc;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

pub struct HashEmbedder {
    dimension: usize,
    tokenizer: Arc<dyn Tokenizer>,
    model_name: String,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Result<Self, EmbeddingError> {
        Self::with_tokenizer(dimension, Arc::new(MorphologicalTokenizer::new()))
    }

    pub fn with_tokenizer(
        dimension: usize,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Result<Self, EmbeddingError> {
        if dimension == 0 {
            return Err(EmbeddingError::InitializationError(
                "dimension must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            dimension,
            tokenizer,
            model_name: format!("fnv1a-hash-{}", dimension),
        })
    }
}

impl EmbeddingProvider for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let tokens = self.tokenizer.tokenize(text);
        if tokens.is_empty() {
            return Err(EmbeddingError::InvalidInput(
                "text contains no tokens".to_string(),
            ));
        }

        let mut vector = vec![0.0f32; self.dimension];
        let buckets = self.dimension as u64;
        for token in &tokens {
            let hash = fnv1a(token.as_bytes());
            let bucket = (hash % buckets) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_deterministic_and_normalised() {
        let embedder = HashEmbedder::new(64).unwrap();
        let a = embedder.embed("the cat sat on the mat").unwrap();
        let b = embedder.embed("the cat sat on the mat").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_tokens_are_closer() {
        let embedder = HashEmbedder::new(256).unwrap();
        let base = embedder.embed("rust ownership borrowing").unwrap();
        let near = embedder.embed("rust ownership").unwrap();
        let far = embedder.embed("tomato soup recipe").unwrap();
        assert!(cosine(&base, &near) > cosine(&base, &far));
    }

    #[test]
    fn test_empty_text_is_rejected() {
        let embedder = HashEmbedder::new(8).unwrap();
        assert!(matches!(
            embedder.embed("   "),
            Err(EmbeddingError::InvalidInput(_))
        ));
        assert!(HashEmbedder::new(0).is_err());
    }

    #[test]
    fn test_batch_matches_single() {
        let embedder = HashEmbedder::new(32).unwrap();
        let texts = vec!["alpha beta".to_string(), "gamma".to_string()];
        let batch = embedder.embed_batch(&texts).unwrap();
        assert_eq!(batch[0], embedder.embed("alpha beta").unwrap());
        assert_eq!(batch[1], embedder.embed("gamma").unwrap());
    }
}
