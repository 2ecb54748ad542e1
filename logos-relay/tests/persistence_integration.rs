//! Persistence integration tests on RocksDB.
//!
//! Verifies:
//! - Document state survives a store restart
//! - Compaction results and pending log survive a restart
//! - Multi-document isolation
//! - Fenced compaction keeps writes racing with it
//! - Handler configured from a storage URL persists through RocksDB

use logos_relay::broadcast::RoomManager;
use logos_relay::gateway::{ConnectionMeta, InboundEvent, Request};
use logos_relay::persistence::{CompactionMode, Persistence, PersistenceConfig};
use logos_relay::protocol::{Message, SyncMessage};
use logos_relay::session::SessionHandler;
use logos_relay::storage::{Backend, RocksBackend, StoreConfig};
use logos_relay::RelayConfig;

use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update, WriteTxn};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn edit(doc: &Doc, insert: &str) -> Vec<u8> {
    let sv = doc.transact().state_vector();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        let len = text.get_string(&txn).len() as u32;
        text.insert(&mut txn, len, insert);
    }
    doc.transact().encode_state_as_update_v1(&sv)
}

fn content_of(state: &[u8]) -> String {
    let doc = Doc::new();
    let mut txn = doc.transact_mut();
    txn.apply_update(Update::decode_v1(state).unwrap()).unwrap();
    let text = txn.get_or_insert_text("content");
    text.get_string(&txn)
}

fn open(path: &Path) -> Arc<RocksBackend> {
    Arc::new(RocksBackend::open(StoreConfig::for_testing(path)).unwrap())
}

fn persistence(backend: Arc<RocksBackend>, threshold: usize, mode: CompactionMode) -> Persistence {
    Persistence::new(
        backend,
        PersistenceConfig {
            compaction_threshold: threshold,
            compaction_mode: mode,
            ..Default::default()
        },
    )
}

// ─── Durability ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let author = Doc::new();

    {
        let p = persistence(open(&path), 0, CompactionMode::ClearLog);
        p.store_update("doc", edit(&author, "Hello")).await.unwrap();
        p.store_update("doc", edit(&author, " world")).await.unwrap();
    }

    let p = persistence(open(&path), 0, CompactionMode::ClearLog);
    let state = p.get_state("doc").await.unwrap().unwrap();
    assert_eq!(content_of(&state), "Hello world");
    assert_eq!(p.log_len("doc").await.unwrap(), 2);
}

#[tokio::test]
async fn test_compacted_state_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let author = Doc::new();

    {
        let p = persistence(open(&path), 4, CompactionMode::ClearLog);
        for word in ["a", "b", "c", "d", "e", "f"] {
            p.store_update("doc", edit(&author, word)).await.unwrap();
        }
        assert_eq!(p.log_len("doc").await.unwrap(), 2);
    }

    let backend = open(&path);
    assert!(backend.get("yjs:doc:snapshot").await.unwrap().is_some());

    let p = persistence(backend, 4, CompactionMode::ClearLog);
    assert_eq!(p.log_len("doc").await.unwrap(), 2);
    let state = p.get_state("doc").await.unwrap().unwrap();
    assert_eq!(content_of(&state), "abcdef");

    // Appends after reopening continue on top of the snapshot.
    p.store_update("doc", edit(&author, "g")).await.unwrap();
    let state = p.get_state("doc").await.unwrap().unwrap();
    assert_eq!(content_of(&state), "abcdefg");
}

#[tokio::test]
async fn test_documents_are_isolated() {
    let dir = tempdir().unwrap();
    let p = persistence(open(&dir.path().join("db")), 2, CompactionMode::ClearLog);

    let one = Doc::new();
    let two = Doc::new();
    p.store_update("doc", edit(&one, "first")).await.unwrap();
    p.store_update("doc2", edit(&two, "second")).await.unwrap();
    p.store_update("doc", edit(&one, "!")).await.unwrap();

    assert_eq!(p.log_len("doc").await.unwrap(), 0);
    assert_eq!(p.log_len("doc2").await.unwrap(), 1);
    assert_eq!(
        content_of(&p.get_state("doc").await.unwrap().unwrap()),
        "first!"
    );
    assert_eq!(
        content_of(&p.get_state("doc2").await.unwrap().unwrap()),
        "second"
    );
    assert_eq!(p.get_state("doc3").await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_with_fenced_compaction() {
    let dir = tempdir().unwrap();
    let p = Arc::new(persistence(
        open(&dir.path().join("db")),
        0,
        CompactionMode::Fenced,
    ));

    // Independent authors so every update applies on its own.
    let mut tasks = Vec::new();
    for writer in 0..4 {
        let doc = Doc::new();
        let updates: Vec<Vec<u8>> = (0..10)
            .map(|i| edit(&doc, &format!("{writer}{i}")))
            .collect();
        let p = p.clone();
        tasks.push(tokio::spawn(async move {
            for (i, update) in updates.into_iter().enumerate() {
                p.store_update("shared", update).await.unwrap();
                if i % 3 == 0 {
                    p.compact("shared").await.unwrap();
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let state = p.get_state("shared").await.unwrap().unwrap();
    // 40 two-character inserts from four independent authors.
    assert_eq!(content_of(&state).len(), 80);
}

// ─── Full stack ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_handler_from_storage_url() {
    let dir = tempdir().unwrap();
    let config = RelayConfig::from_json(&format!(
        r#"{{"storage_url": "rocksdb://{}", "compaction_threshold": 3}}"#,
        dir.path().join("db").display()
    ))
    .unwrap();

    let rooms = Arc::new(RoomManager::default());
    let handler = SessionHandler::builder(rooms)
        .backend(config.open_backend().unwrap())
        .config(&config)
        .build();

    let author = Doc::new();
    let mut request = Request::new("conn", "/docs/report").with_meta(ConnectionMeta::new());
    for word in ["one ", "two ", "three"] {
        let frame = Message::Sync(SyncMessage::Update(edit(&author, word))).encode();
        request.events.push(InboundEvent::Binary(frame));
    }
    handler.handle(request).await.unwrap();

    let persistence = handler.persistence().unwrap();
    assert_eq!(persistence.log_len("report").await.unwrap(), 0);
    let state = persistence.get_state("report").await.unwrap().unwrap();
    assert_eq!(content_of(&state), "one two three");
}
