//! Document processing: parse a source object into chunks and keep the
//! derived objects in the db container in step with it
//!
//! Derived objects per source `object`:
//! - `chunks/chunk_<id>.json` for every chunk
//! - `pages/<object>_<page>.txt` with the concatenated text of each page
//! - `texts/<object>.txt` with the full text
//!
//! The source object's metadata records `content_hash` (blake3) and
//! `chunk_ids` (JSON array) so unchanged documents are not re-indexed.

use super::parser::{extension_of, ParsedPage, ParserRegistry};
use crate::error::{BlobdexError, Result};
use crate::lease::LeaseLock;
use crate::mapping::{chunk_object, ChunkRecord, MappingManager};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Metadata key holding the blake3 hash of the indexed content
pub const CONTENT_HASH_KEY: &str = "content_hash";

/// Metadata key holding the JSON array of chunk ids
pub const CHUNK_IDS_KEY: &str = "chunk_ids";

pub fn page_object(object: &str, page_number: u32) -> String {
    format!("pages/{}_{}.txt", object, page_number)
}

pub fn text_object(object: &str) -> String {
    format!("texts/{}.txt", object)
}

/// What [`DocumentProcessor::process`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The document was (re-)indexed into these chunks
    Indexed { chunk_ids: Vec<String> },
    /// Content hash unchanged; existing chunks kept
    Unchanged { chunk_ids: Vec<String> },
}

impl ProcessOutcome {
    pub fn chunk_ids(&self) -> &[String] {
        match self {
            ProcessOutcome::Indexed { chunk_ids } | ProcessOutcome::Unchanged { chunk_ids } => {
                chunk_ids
            }
        }
    }
}

pub struct DocumentProcessor {
    lock: Arc<LeaseLock>,
    manager: Arc<MappingManager>,
    parsers: Arc<ParserRegistry>,
    db_container: String,
}

impl DocumentProcessor {
    pub fn new(
        lock: Arc<LeaseLock>,
        manager: Arc<MappingManager>,
        parsers: Arc<ParserRegistry>,
        db_container: impl Into<String>,
    ) -> Self {
        Self {
            lock,
            manager,
            parsers,
            db_container: db_container.into(),
        }
    }

    /// Index `container/object`, replacing whatever was indexed for it before
    ///
    /// On failure every chunk registered for the object is removed again
    /// before the error is returned.
    pub fn process(&self, container: &str, object: &str) -> Result<ProcessOutcome> {
        let store = self.lock.store();
        let content = store.read(container, object)?;
        let content_hash = blake3::hash(&content).to_hex().to_string();

        let existing = self
            .manager
            .blob_mapping()
            .get_chunk_ids_by_blob(container, object)?;
        let metadata = store.get_metadata(container, object)?;
        if !existing.is_empty()
            && metadata.get(CONTENT_HASH_KEY).map(String::as_str) == Some(content_hash.as_str())
        {
            info!("{}/{} is unchanged, skipping", container, object);
            return Ok(ProcessOutcome::Unchanged {
                chunk_ids: existing,
            });
        }

        if !existing.is_empty() {
            info!(
                "Re-processing {}/{}: removing {} existing chunks",
                container,
                object,
                existing.len()
            );
            self.delete(container, object)?;
        }

        match self.index_document(container, object, &content, &content_hash) {
            Ok(chunk_ids) => {
                info!(
                    "Processed {}/{} into {} chunks",
                    container,
                    object,
                    chunk_ids.len()
                );
                Ok(ProcessOutcome::Indexed { chunk_ids })
            }
            Err(e) => {
                error!("Failed to process {}/{}: {}", container, object, e);
                if let Err(cleanup) = self.delete(container, object) {
                    error!(
                        "Rollback of {}/{} failed, chunks may remain: {}",
                        container, object, cleanup
                    );
                }
                Err(e)
            }
        }
    }

    fn index_document(
        &self,
        container: &str,
        object: &str,
        content: &[u8],
        content_hash: &str,
    ) -> Result<Vec<String>> {
        let pages = self.parsers.parse(content, &extension_of(object))?;
        let chunks: Vec<(u32, &str)> = pages
            .iter()
            .flat_map(|page| page.texts.iter().map(move |t| (page.page_number, t.as_str())))
            .collect();
        if chunks.is_empty() {
            return Err(BlobdexError::Parse(format!(
                "{}/{} produced no text",
                container, object
            )));
        }

        let texts: Vec<&str> = chunks.iter().map(|(_, text)| *text).collect();
        let added = self.manager.add(container, object, &texts)?;

        let created_at = chrono::Utc::now().to_rfc3339();
        for (chunk, (page_number, _)) in added.iter().zip(&chunks) {
            let record = ChunkRecord {
                text: chunk.text.clone(),
                document_name: object.to_string(),
                page_number: *page_number,
                created_at: created_at.clone(),
            };
            self.write_json(&chunk_object(&chunk.chunk_id), &record)?;
        }

        self.write_texts(object, &pages)?;

        let chunk_ids: Vec<String> = added.into_iter().map(|c| c.chunk_id).collect();
        let mut metadata = self.lock.store().get_metadata(container, object)?;
        metadata.insert(
            CHUNK_IDS_KEY.to_string(),
            serde_json::to_string(&chunk_ids).map_err(|e| BlobdexError::Json {
                source: e,
                context: "Failed to serialize chunk ids".to_string(),
            })?,
        );
        metadata.insert(CONTENT_HASH_KEY.to_string(), content_hash.to_string());
        self.lock.set_metadata(container, object, metadata)?;

        Ok(chunk_ids)
    }

    fn write_json(&self, object: &str, record: &ChunkRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record).map_err(|e| BlobdexError::Json {
            source: e,
            context: format!("Failed to serialize {}", object),
        })?;
        self.lock.upload(&self.db_container, object, &bytes)
    }

    fn write_texts(&self, object: &str, pages: &[ParsedPage]) -> Result<()> {
        let mut full_text = String::new();
        for page in pages {
            let page_text = page.texts.concat();
            full_text.push_str(&page_text);
            self.lock.upload(
                &self.db_container,
                &page_object(object, page.page_number),
                page_text.as_bytes(),
            )?;
        }
        self.lock
            .upload(&self.db_container, &text_object(object), full_text.as_bytes())?;
        debug!("Wrote {} page texts for {}", pages.len(), object);
        Ok(())
    }

    /// Remove every chunk of `container/object` and its derived objects
    ///
    /// Returns the number of chunks removed.
    pub fn delete(&self, container: &str, object: &str) -> Result<usize> {
        let chunk_ids = self
            .manager
            .blob_mapping()
            .get_chunk_ids_by_blob(container, object)?;

        for chunk_id in &chunk_ids {
            let chunk_path = chunk_object(chunk_id);
            let page_number = self.read_page_number(&chunk_path);

            self.manager.remove(chunk_id)?;
            self.delete_if_exists(&chunk_path)?;
            if let Some(page_number) = page_number {
                self.delete_if_exists(&page_object(object, page_number))?;
            }
        }

        self.delete_if_exists(&text_object(object))?;
        info!(
            "Deleted {} chunks of {}/{}",
            chunk_ids.len(),
            container,
            object
        );
        Ok(chunk_ids.len())
    }

    fn read_page_number(&self, chunk_path: &str) -> Option<u32> {
        let bytes = self.lock.store().read(&self.db_container, chunk_path).ok()?;
        match serde_json::from_slice::<ChunkRecord>(&bytes) {
            Ok(record) => Some(record.page_number),
            Err(e) => {
                warn!("Unreadable chunk record {}: {}", chunk_path, e);
                None
            }
        }
    }

    fn delete_if_exists(&self, object: &str) -> Result<()> {
        match self.lock.delete(&self.db_container, object) {
            Err(e) if e.is_not_found() => {
                debug!("{} already gone", object);
                Ok(())
            }
            other => other,
        }
    }
}
