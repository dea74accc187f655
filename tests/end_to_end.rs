use blobdex::config::{Config, StorageBackend};
use blobdex::engine::Engine;
use blobdex::ingest::ProcessOutcome;
use blobdex::search::SearchBackend;
use blobdex::storage::{MemoryObjectStore, ObjectStore};
use std::sync::Arc;

fn test_config() -> Config {
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Memory;
    config.storage.db_container = "db".to_string();
    config.storage.doc_container = "docs".to_string();
    config.lease.retry_delay_ms = 10;
    config.vector.ndims = 128;
    config.embedding.dimension = 128;
    config
}

fn engine_with_docs() -> (Arc<MemoryObjectStore>, Engine) {
    let store = Arc::new(MemoryObjectStore::new());
    store.create_container("docs").unwrap();
    store
        .upload(
            "docs",
            "pets.txt",
            b"the cat sat on the mat\n\nthe dog ran in the park",
            false,
            None,
        )
        .unwrap();
    store
        .upload(
            "docs",
            "crew.csv",
            b"name,role\nAda,engineer\nGrace,admiral\n",
            false,
            None,
        )
        .unwrap();

    let engine = Engine::with_store(test_config(), store.clone()).expect("engine");
    (store, engine)
}

#[test]
fn test_ingest_and_search_both_backends() {
    let (_store, engine) = engine_with_docs();

    let outcome = engine.processor().process("docs", "crew.csv").unwrap();
    assert_eq!(outcome.chunk_ids(), ["0".to_string(), "1".to_string()]);
    engine.processor().process("docs", "pets.txt").unwrap();

    let results = engine.search("admiral", 5, SearchBackend::Lexical).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "1");
    assert_eq!(results[0].document_name, "crew.csv");
    assert_eq!(results[0].chunk_text, "name: Grace | role: admiral");
    assert!(results[0].score > 0.0);

    let results = engine
        .search("name: Grace | role: admiral", 3, SearchBackend::Vector)
        .unwrap();
    assert_eq!(results[0].id, "1");
    assert!((results[0].score - 1.0).abs() < 1e-4);
    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));

    let stats = engine.stats().unwrap();
    assert_eq!(stats.documents, 2);
    assert_eq!(stats.chunks, 3);
    assert_eq!(stats.lexical.num_documents, 3);
    assert_eq!(stats.vector.num_vectors, 3);
    assert!(engine.lock().held().is_empty());
}

#[test]
fn test_every_chunk_has_an_id_in_every_backend() {
    let (_store, engine) = engine_with_docs();
    let outcome = engine.processor().process("docs", "crew.csv").unwrap();

    for chunk_id in outcome.chunk_ids() {
        let ids = engine
            .manager()
            .index_mapping()
            .get_index_ids(chunk_id)
            .unwrap()
            .unwrap();
        let backends: Vec<&str> = ids.keys().map(String::as_str).collect();
        assert_eq!(backends, vec!["lexical", "vector"]);
    }
}

#[test]
fn test_remove_and_restore_chunk() {
    let (_store, engine) = engine_with_docs();
    engine.processor().process("docs", "crew.csv").unwrap();

    assert!(engine.remove_chunk("1").unwrap());
    assert!(!engine.remove_chunk("1").unwrap());
    for backend in [SearchBackend::Lexical, SearchBackend::Vector] {
        let results = engine.search("Grace admiral", 5, backend).unwrap();
        assert!(results.iter().all(|r| r.id != "1"), "{:?}", backend);
    }

    assert!(engine.restore_chunk("1").unwrap());
    assert!(!engine.restore_chunk("1").unwrap());
    let results = engine.search("admiral", 5, SearchBackend::Lexical).unwrap();
    assert_eq!(results[0].id, "1");
    assert_eq!(
        engine
            .manager()
            .blob_mapping()
            .get_chunk_ids_by_blob("docs", "crew.csv")
            .unwrap(),
        vec!["0", "1"]
    );
}

#[test]
fn test_reprocess_and_delete_document() {
    let (store, engine) = engine_with_docs();
    engine.processor().process("docs", "pets.txt").unwrap();

    let unchanged = engine.processor().process("docs", "pets.txt").unwrap();
    assert!(matches!(unchanged, ProcessOutcome::Unchanged { .. }));

    store
        .upload("docs", "pets.txt", b"a bird sang in the tree", true, None)
        .unwrap();
    let outcome = engine.processor().process("docs", "pets.txt").unwrap();
    assert!(matches!(outcome, ProcessOutcome::Indexed { .. }));
    assert!(engine.search("cat", 5, SearchBackend::Lexical).unwrap().is_empty());
    assert_eq!(engine.search("bird", 5, SearchBackend::Lexical).unwrap().len(), 1);

    assert_eq!(engine.processor().delete("docs", "pets.txt").unwrap(), 1);
    assert!(engine.search("bird", 5, SearchBackend::Lexical).unwrap().is_empty());
    assert!(engine.search("bird", 5, SearchBackend::Vector).unwrap().is_empty());
    assert!(store.list("db", "chunks/").unwrap().is_empty());
}

#[test]
fn test_search_before_anything_is_indexed() {
    let (_store, engine) = engine_with_docs();
    assert!(engine.search("cat", 5, SearchBackend::Lexical).unwrap().is_empty());
    assert!(engine.search("cat", 5, SearchBackend::Vector).unwrap().is_empty());
}
