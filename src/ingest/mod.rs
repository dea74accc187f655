//! Document ingestion: parsing plus the processor that keeps chunks,
//! mappings and derived text objects in step with a source object

pub mod parser;
pub mod processor;

pub use parser::{
    extension_of, CsvParser, DocumentKind, DocumentParser, ParsedPage, ParserRegistry, TextParser,
    DEFAULT_CHUNK_SIZE,
};
pub use processor::{
    page_object, text_object, DocumentProcessor, ProcessOutcome, CHUNK_IDS_KEY, CONTENT_HASH_KEY,
};
