//! Tokenizers for the lexical index
//!
//! Japanese and other scripts written without spaces cannot be split on
//! whitespace. [`MorphologicalTokenizer`] runs lindera's ipadic segmenter
//! inside a tantivy analyzer, so compounds split on word boundaries
//! ("東京都" is "東京" + "都", never "京都").

use lindera::dictionary::load_dictionary;
use lindera::mode::Mode;
use lindera::segmenter::Segmenter;
use lindera_tantivy::tokenizer::LinderaTokenizer;
use std::sync::{Mutex, OnceLock};
use tantivy::tokenizer::{LowerCaser, SimpleTokenizer, TextAnalyzer, TokenStream};
use tracing::error;

const DICTIONARY: &str = "embedded://ipadic";

/// Splits text into index terms
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<String>;
}

fn build_analyzer() -> TextAnalyzer {
    match load_dictionary(DICTIONARY) {
        Ok(dictionary) => {
            let segmenter = Segmenter::new(Mode::Normal, dictionary, None);
            TextAnalyzer::builder(LinderaTokenizer::from_segmenter(segmenter))
                .filter(LowerCaser)
                .build()
        }
        Err(e) => {
            error!(
                "Failed to load {} dictionary, falling back to word splitting: {}",
                DICTIONARY, e
            );
            TextAnalyzer::builder(SimpleTokenizer::default())
                .filter(LowerCaser)
                .build()
        }
    }
}

/// The dictionary is decoded once per process and cloned into each tokenizer
fn shared_analyzer() -> TextAnalyzer {
    static ANALYZER: OnceLock<TextAnalyzer> = OnceLock::new();
    ANALYZER.get_or_init(build_analyzer).clone()
}

/// Default tokenizer: lindera (ipadic) morphological segmentation, lowercased
pub struct MorphologicalTokenizer {
    analyzer: Mutex<TextAnalyzer>,
}

impl Default for MorphologicalTokenizer {
    fn default() -> Self {
        Self {
            analyzer: Mutex::new(shared_analyzer()),
        }
    }
}

impl MorphologicalTokenizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tokenizer for MorphologicalTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        if text.trim().is_empty() {
            return tokens;
        }

        // token_stream needs &mut; a poisoned analyzer is still usable
        let mut analyzer = self.analyzer.lock().unwrap_or_else(|e| e.into_inner());
        let mut stream = analyzer.token_stream(text);
        while stream.advance() {
            let term = &stream.token().text;
            // whitespace and punctuation come back as tokens of their own
            if term.chars().any(char::is_alphanumeric) {
                tokens.push(term.clone());
            }
        }
        tokens
    }
}

/// Lowercased whitespace split, handy for tests and ASCII-only corpora
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        text.split_whitespace().map(|w| w.to_lowercase()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latin_words_are_lowercased() {
        let tokens = MorphologicalTokenizer::new().tokenize("The Cat sat, on the MAT!");
        for word in ["the", "cat", "sat", "on", "mat"] {
            assert!(tokens.contains(&word.to_string()), "missing {}", word);
        }
        assert!(tokens.iter().all(|t| t.chars().all(char::is_alphanumeric)));
        assert!(tokens.iter().all(|t| t.to_lowercase() == *t));
    }

    #[test]
    fn test_compound_splits_on_word_boundaries() {
        let tokens = MorphologicalTokenizer::new().tokenize("東京都");
        assert!(tokens.contains(&"東京".to_string()), "{:?}", tokens);
        assert!(!tokens.contains(&"京都".to_string()), "{:?}", tokens);
        assert_eq!(MorphologicalTokenizer::new().tokenize("京都"), vec!["京都"]);
    }

    #[test]
    fn test_particles_and_punctuation() {
        let tokens = MorphologicalTokenizer::new().tokenize("東京の天気は晴れです。");
        assert!(tokens.contains(&"天気".to_string()), "{:?}", tokens);
        assert!(!tokens.iter().any(|t| t == "。"));
    }

    #[test]
    fn test_mixed_scripts() {
        let tokens = MorphologicalTokenizer::new().tokenize("Rust言語 version 2");
        for word in ["rust", "言語", "version", "2"] {
            assert!(tokens.contains(&word.to_string()), "missing {} in {:?}", word, tokens);
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(MorphologicalTokenizer::new().tokenize("  ").is_empty());
        assert!(WhitespaceTokenizer.tokenize("").is_empty());
    }
}
