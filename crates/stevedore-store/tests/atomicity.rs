//! Crash-safety tests for the envelope store.
//!
//! A crash during `save()` can leave two kinds of debris: a partially
//! written temporary file next to the state file, or (for a writer that did
//! not go through the rename) a truncated state file. Either way the next
//! `initialize()` must produce a complete envelope.

use std::fs;

use serde::{Deserialize, Serialize};
use stevedore_store::{Envelope, JsonStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Service {
    image: String,
    ports: Vec<u16>,
}

fn redis() -> Service {
    Service {
        image: "redis:7-alpine".to_string(),
        ports: vec![6379],
    }
}

#[test_log::test]
fn leftover_temp_file_does_not_shadow_prior_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("services.json");

    let store = JsonStore::new(&path);
    store.initialize().unwrap();
    store.set("redis", redis()).unwrap();

    // Simulate a crash halfway through writing the next envelope.
    let mut next: Envelope<Service> = store.export_data().unwrap();
    next.items.insert("pg".to_string(), redis());
    let bytes = serde_json::to_vec_pretty(&next).unwrap();
    fs::write(dir.path().join(".tmpA1b2C3"), &bytes[..bytes.len() / 2]).unwrap();

    let reopened: JsonStore<Service> = JsonStore::new(&path);
    reopened.initialize().unwrap();
    let items = reopened.get_all().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items.get("redis"), Some(&redis()));
}

#[test_log::test]
fn truncation_at_any_offset_yields_complete_or_empty_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("services.json");

    let store = JsonStore::new(&path);
    store.initialize().unwrap();
    store.set("redis", redis()).unwrap();
    store
        .set(
            "meilisearch",
            Service {
                image: "getmeili/meilisearch:v1.8".to_string(),
                ports: vec![7700],
            },
        )
        .unwrap();
    let full = fs::read(&path).unwrap();
    let complete = store.get_all().unwrap();

    for offset in 0..full.len() {
        fs::write(&path, &full[..offset]).unwrap();

        let reopened: JsonStore<Service> = JsonStore::new(&path);
        reopened.initialize().unwrap();
        let items = reopened.get_all().unwrap();
        assert!(
            items.is_empty() || items == complete,
            "partial envelope observed at offset {offset}: {items:?}"
        );
    }

    // The full file always decodes to the complete envelope.
    fs::write(&path, &full).unwrap();
    let reopened: JsonStore<Service> = JsonStore::new(&path);
    reopened.initialize().unwrap();
    assert_eq!(reopened.get_all().unwrap(), complete);
}

#[test_log::test]
fn corrupt_file_is_quarantined_and_reset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("services.json");
    fs::write(&path, b"{\"items\": {\"redis\": ").unwrap();

    let store: JsonStore<Service> = JsonStore::new(&path);
    store.initialize().unwrap();

    assert!(store.get_all().unwrap().is_empty());
    assert!(dir.path().join("services.json.corrupt").exists());

    // The fresh envelope was persisted.
    let on_disk: Envelope<Service> =
        serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    assert!(on_disk.items.is_empty());
}

#[test_log::test]
fn wrong_schema_version_resets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("services.json");
    fs::write(
        &path,
        r#"{"items": {}, "version": 42, "lastUpdated": "2026-01-01T00:00:00Z"}"#,
    )
    .unwrap();

    let store: JsonStore<Service> = JsonStore::new(&path);
    store.initialize().unwrap();
    assert!(store.get_all().unwrap().is_empty());
    assert_eq!(store.export_data().unwrap().version, stevedore_store::SCHEMA_VERSION);
}

#[test_log::test]
fn concurrent_sets_are_not_lost() {
    let dir = tempfile::tempdir().unwrap();
    let store = std::sync::Arc::new(JsonStore::new(dir.path().join("services.json")));
    store.initialize().unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            std::thread::spawn(move || {
                for j in 0..5 {
                    store.set(&format!("svc-{i}-{j}"), redis()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.get_all().unwrap().len(), 40);

    let reopened: JsonStore<Service> = JsonStore::new(store.path());
    reopened.initialize().unwrap();
    assert_eq!(reopened.get_all().unwrap().len(), 40);
}
