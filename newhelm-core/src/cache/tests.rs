use super::*;
use crate::error::NewhelmError;
use crate::fingerprint::fingerprint;
use crate::record::InitializationRecord;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

fn key(prompt: &str) -> CacheKey {
    let record = InitializationRecord::builder("demo_sut")
        .kwarg("model", "tiny")
        .build()
        .unwrap();
    fingerprint(&record, &json!({ "prompt": prompt })).unwrap()
}

#[test]
fn test_disk_put_then_get() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(dir.path()).unwrap();
    let k = key("hello");

    assert_eq!(cache.get(&k).unwrap(), None);
    assert_eq!(cache.put(&k, &json!({"text": "hi"})).unwrap(), PutOutcome::Stored);
    assert_eq!(cache.get(&k).unwrap(), Some(json!({"text": "hi"})));
    assert!(cache.entry_path(&k).starts_with(dir.path().join("v1")));
}

#[test]
fn test_disk_identical_reput_is_noop() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(dir.path()).unwrap();
    let k = key("hello");

    cache.put(&k, &json!({"a": 1, "b": 2})).unwrap();
    let outcome = cache.put(&k, &json!({"b": 2, "a": 1})).unwrap();
    assert_eq!(outcome, PutOutcome::AlreadyPresent);
}

#[test]
fn test_disk_floats_read_back_exactly() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(dir.path()).unwrap();
    let k = key("logprobs");
    // Parses to a neighbouring f64 unless float parsing is exact
    let awkward = 1.0715660391465826e-75_f64;
    let value = json!({"logprob": awkward, "top": [-0.1, 1.0 / 3.0, -2.5e-308]});

    assert_eq!(cache.put(&k, &value).unwrap(), PutOutcome::Stored);
    let stored = cache.get(&k).unwrap().unwrap();
    assert_eq!(stored, value);
    assert_eq!(stored["logprob"].as_f64(), Some(awkward));

    let reopened = DiskCache::open(dir.path()).unwrap();
    assert_eq!(reopened.put(&k, &value).unwrap(), PutOutcome::AlreadyPresent);
}

#[test]
fn test_disk_divergent_put_conflicts() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(dir.path()).unwrap();
    let k = key("hello");

    cache.put(&k, &json!({"text": "hi"})).unwrap();
    let err = cache.put(&k, &json!({"text": "bye"})).unwrap_err();
    assert!(matches!(err, NewhelmError::CacheKeyConflict { key } if key == k));
    assert_eq!(cache.get(&k).unwrap(), Some(json!({"text": "hi"})));
}

#[test]
fn test_disk_entries_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let k = key("persist");
    {
        let cache = DiskCache::open(dir.path()).unwrap();
        cache.put(&k, &json!(["one", 2, null])).unwrap();
    }
    let reopened = DiskCache::open(dir.path()).unwrap();
    assert_eq!(reopened.get(&k).unwrap(), Some(json!(["one", 2, null])));
}

#[test]
fn test_schema_version_namespacing_hides_old_entries() {
    let dir = TempDir::new().unwrap();
    let k = key("versioned");

    let v1 = DiskCache::open_with_version(dir.path(), 1).unwrap();
    v1.put(&k, &json!("old")).unwrap();

    let v2 = DiskCache::open_with_version(dir.path(), 2).unwrap();
    assert_eq!(v2.get(&k).unwrap(), None);
    v2.put(&k, &json!("new")).unwrap();
    assert_eq!(v1.get(&k).unwrap(), Some(json!("old")));

    assert_eq!(v2.stats().unwrap().other_versions, vec![1]);
    assert_eq!(v2.prune_other_versions().unwrap(), vec![1]);
    assert!(!dir.path().join("v1").exists());
    assert_eq!(v2.get(&k).unwrap(), Some(json!("new")));
}

#[test]
fn test_zero_schema_version_rejected() {
    let dir = TempDir::new().unwrap();
    assert!(DiskCache::open_with_version(dir.path(), 0).is_err());
}

#[test]
fn test_clear_and_stats() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(dir.path()).unwrap();
    for prompt in ["a", "b", "c"] {
        cache.put(&key(prompt), &json!({ "echo": prompt })).unwrap();
    }

    let stats = cache.stats().unwrap();
    assert_eq!(stats.entries, 3);
    assert!(stats.bytes > 0);

    assert_eq!(cache.clear().unwrap(), 3);
    assert_eq!(cache.stats().unwrap().entries, 0);
    assert_eq!(cache.get(&key("a")).unwrap(), None);
}

#[test]
fn test_corrupted_entry_reported() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(dir.path()).unwrap();
    let k = key("broken");
    let path = cache.entry_path(&k);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"{not json").unwrap();

    assert!(matches!(
        cache.get(&k),
        Err(NewhelmError::CacheCorrupted { .. })
    ));
}

#[test]
fn test_fresh_partials_are_kept() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(dir.path()).unwrap();
    let shard = cache.namespace_dir().join("ab");
    std::fs::create_dir_all(&shard).unwrap();
    std::fs::write(shard.join(".tmp-inflight.json"), b"{").unwrap();

    assert_eq!(cache.sweep_partials().unwrap(), 0);
    assert_eq!(cache.stats().unwrap().entries, 0);
}

#[test]
fn test_concurrent_writers_same_value() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(DiskCache::open(dir.path()).unwrap());
    let k = key("race");
    let stored = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            let stored = stored.clone();
            std::thread::spawn(move || {
                if cache.put(&k, &json!({"text": "same"})).unwrap() == PutOutcome::Stored {
                    stored.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(stored.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get(&k).unwrap(), Some(json!({"text": "same"})));
    assert_eq!(cache.stats().unwrap().entries, 1);
}

#[test]
fn test_concurrent_writers_different_values() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(DiskCache::open(dir.path()).unwrap());
    let k = key("race");

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let cache = cache.clone();
            std::thread::spawn(move || cache.put(&k, &json!({ "writer": i })).is_ok())
        })
        .collect();
    let successes = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();

    assert_eq!(successes, 1);
    let stored = cache.get(&k).unwrap().unwrap();
    assert!(stored["writer"].is_u64());
}

#[test]
fn test_in_memory_semantics_match_disk() {
    let cache = InMemoryCache::new();
    let k = key("mem");

    assert_eq!(cache.get(&k).unwrap(), None);
    assert_eq!(cache.put(&k, &json!(1)).unwrap(), PutOutcome::Stored);
    assert_eq!(cache.put(&k, &json!(1)).unwrap(), PutOutcome::AlreadyPresent);
    assert!(matches!(
        cache.put(&k, &json!(2)),
        Err(NewhelmError::CacheKeyConflict { .. })
    ));
    assert_eq!(cache.len(), 1);
    cache.clear();
    assert!(cache.is_empty());
}

#[test]
fn test_no_cache_never_hits() {
    let cache = NoCache;
    let k = key("none");
    assert_eq!(cache.put(&k, &json!("x")).unwrap(), PutOutcome::Discarded);
    assert_eq!(cache.get(&k).unwrap(), None);
}
