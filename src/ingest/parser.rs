//! Document parsers and the extension registration table
//!
//! Extensions resolve to a closed set of [`DocumentKind`]s, and each kind to
//! at most one registered [`DocumentParser`]. Only plain text and CSV ship
//! with the crate; other kinds are registered by the embedding application.

use crate::error::{BlobdexError, Result};
use encoding_rs::{Encoding, EUC_JP, ISO_2022_JP, SHIFT_JIS, WINDOWS_1252};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Longest chunk the built-in parsers emit, in characters
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Text segments of one page, in reading order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedPage {
    pub page_number: u32,
    pub texts: Vec<String>,
}

/// Turns raw document bytes into pages of text
///
/// A document that cannot be parsed yields an empty list; callers treat
/// that as a terminal failure for the document.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, content: &[u8]) -> Vec<ParsedPage>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Text,
    Csv,
    Pdf,
    Image,
    Spreadsheet,
    Word,
    Presentation,
    Mail,
}

const EXTENSIONS: &[(&str, DocumentKind)] = &[
    ("txt", DocumentKind::Text),
    ("csv", DocumentKind::Csv),
    ("pdf", DocumentKind::Pdf),
    ("png", DocumentKind::Image),
    ("jpg", DocumentKind::Image),
    ("jpeg", DocumentKind::Image),
    ("xls", DocumentKind::Spreadsheet),
    ("xlsx", DocumentKind::Spreadsheet),
    ("doc", DocumentKind::Word),
    ("docx", DocumentKind::Word),
    ("ppt", DocumentKind::Presentation),
    ("pptx", DocumentKind::Presentation),
    ("msg", DocumentKind::Mail),
];

/// Lowercased extension of an object name, without the dot
pub fn extension_of(object: &str) -> String {
    Path::new(object)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Extension -> kind -> parser
pub struct ParserRegistry {
    kinds: HashMap<String, DocumentKind>,
    parsers: HashMap<DocumentKind, Arc<dyn DocumentParser>>,
}

impl ParserRegistry {
    /// Standard extension table with no parsers
    pub fn empty() -> Self {
        Self {
            kinds: EXTENSIONS
                .iter()
                .map(|(ext, kind)| (ext.to_string(), *kind))
                .collect(),
            parsers: HashMap::new(),
        }
    }

    /// Standard extension table with the text and CSV parsers
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(DocumentKind::Text, Arc::new(TextParser::default()));
        registry.register(DocumentKind::Csv, Arc::new(CsvParser::default()));
        registry
    }

    pub fn register(&mut self, kind: DocumentKind, parser: Arc<dyn DocumentParser>) {
        debug!("Registered parser for {:?}", kind);
        self.parsers.insert(kind, parser);
    }

    pub fn register_extension(&mut self, extension: &str, kind: DocumentKind) {
        self.kinds.insert(extension.to_ascii_lowercase(), kind);
    }

    pub fn kind_for(&self, extension: &str) -> Result<DocumentKind> {
        self.kinds
            .get(&extension.to_ascii_lowercase())
            .copied()
            .ok_or_else(|| BlobdexError::UnsupportedExtension(extension.to_string()))
    }

    pub fn supports(&self, extension: &str) -> bool {
        self.kind_for(extension)
            .map(|kind| self.parsers.contains_key(&kind))
            .unwrap_or(false)
    }

    /// Parse `content` with the parser registered for `extension`
    pub fn parse(&self, content: &[u8], extension: &str) -> Result<Vec<ParsedPage>> {
        let kind = self.kind_for(extension)?;
        let parser = self.parsers.get(&kind).ok_or_else(|| {
            BlobdexError::UnsupportedExtension(format!(
                "{} (no parser registered for {:?})",
                extension, kind
            ))
        })?;
        Ok(parser.parse(content))
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode raw document bytes, trying UTF-8, the Japanese legacy encodings,
/// BOM-marked UTF-16 and finally windows-1252, which accepts any input
fn decode(content: &[u8]) -> String {
    if let Some((encoding, bom_len)) = Encoding::for_bom(content) {
        let (text, had_errors) = encoding.decode_without_bom_handling(&content[bom_len..]);
        if had_errors {
            debug!("{} content had malformed sequences", encoding.name());
        }
        return text.into_owned();
    }
    if let Ok(text) = std::str::from_utf8(content) {
        return text.to_string();
    }
    // First strict decode wins; SHIFT_JIS is windows-31j and covers cp932
    for encoding in [SHIFT_JIS, EUC_JP, ISO_2022_JP] {
        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(content) {
            debug!("Decoded content as {}", encoding.name());
            return text.into_owned();
        }
    }
    debug!("No candidate encoding matched, decoding as windows-1252");
    WINDOWS_1252.decode_without_bom_handling(content).0.into_owned()
}

/// Split on blank lines and pack paragraphs into chunks of at most
/// `chunk_size` characters; oversized paragraphs are cut by character
fn chunk_paragraphs(text: &str, chunk_size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    let normalized = text.replace("\r\n", "\n");
    for paragraph in normalized.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let len = paragraph.chars().count();

        if len > chunk_size {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = paragraph.chars().collect();
            chunks.extend(chars.chunks(chunk_size).map(|c| c.iter().collect::<String>()));
            continue;
        }

        // +2 for the paragraph break kept between packed paragraphs
        if !current.is_empty() && current_len + 2 + len > chunk_size {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
            current_len += 2;
        }
        current.push_str(paragraph);
        current_len += len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Plain text: one page of paragraph chunks
pub struct TextParser {
    chunk_size: usize,
}

impl TextParser {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Default for TextParser {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl DocumentParser for TextParser {
    fn parse(&self, content: &[u8]) -> Vec<ParsedPage> {
        let text = decode(content);
        let texts = chunk_paragraphs(&text, self.chunk_size);
        debug!(
            "Parsed text document: {} chars, {} chunks",
            text.chars().count(),
            texts.len()
        );
        if texts.is_empty() {
            return Vec::new();
        }
        vec![ParsedPage {
            page_number: 0,
            texts,
        }]
    }
}

/// CSV with a header row: one `column: value | ...` text per row
#[derive(Default)]
pub struct CsvParser;

impl DocumentParser for CsvParser {
    fn parse(&self, content: &[u8]) -> Vec<ParsedPage> {
        let text = decode(content);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());

        let headers = match reader.headers() {
            Ok(headers) => headers.clone(),
            Err(e) => {
                warn!("Failed to read CSV header: {}", e);
                return Vec::new();
            }
        };

        let mut texts = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    warn!("Failed to read CSV record {}: {}", index + 1, e);
                    return Vec::new();
                }
            };
            let fields: Vec<String> = record
                .iter()
                .enumerate()
                .filter(|(_, value)| !value.is_empty())
                .map(|(i, value)| match headers.get(i) {
                    Some(name) if !name.is_empty() => format!("{}: {}", name, value),
                    _ => value.to_string(),
                })
                .collect();
            if !fields.is_empty() {
                texts.push(fields.join(" | "));
            }
        }

        debug!("Parsed CSV document: {} rows", texts.len());
        if texts.is_empty() {
            return Vec::new();
        }
        vec![ParsedPage {
            page_number: 0,
            texts,
        }]
    }
}
