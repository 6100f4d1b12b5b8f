//! File-per-entry disk cache

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::{CACHE_SCHEMA_VERSION, CacheEntry, PutOutcome, ResponseCache};
use crate::error::{NewhelmError, Result};
use crate::fingerprint::CacheKey;
use crate::record::canonical;

const TEMP_PREFIX: &str = ".tmp-";

/// Temp files younger than this may belong to a live writer
const PARTIAL_GRACE: Duration = Duration::from_secs(60 * 60);

/// Summary of what a disk cache holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskCacheStats {
    pub root: PathBuf,
    pub schema_version: u32,
    pub entries: u64,
    pub bytes: u64,
    /// Other schema versions still present under the root
    pub other_versions: Vec<u32>,
}

/// Durable cache storing one JSON [`CacheEntry`] per file
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
    schema_version: u32,
}

impl DiskCache {
    /// Open (creating if needed) a cache at `root` for the current schema
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_version(root, CACHE_SCHEMA_VERSION)
    }

    /// Open a cache namespaced under a specific schema version
    pub fn open_with_version(root: impl Into<PathBuf>, schema_version: u32) -> Result<Self> {
        if schema_version == 0 {
            return Err(NewhelmError::Configuration(
                "cache schema version must be at least 1".to_string(),
            ));
        }
        let cache = Self {
            root: root.into(),
            schema_version,
        };
        let namespace = cache.namespace_dir();
        fs::create_dir_all(&namespace).map_err(|e| NewhelmError::cache_io(&namespace, e))?;

        let swept = cache.sweep_partials()?;
        if swept > 0 {
            tracing::info!(removed = swept, root = %cache.root.display(), "removed stale partial cache writes");
        }
        tracing::debug!(root = %cache.root.display(), schema_version, "opened disk cache");
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding entries for this schema version
    pub fn namespace_dir(&self) -> PathBuf {
        self.root.join(format!("v{}", self.schema_version))
    }

    /// Where the entry for `key` lives
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.namespace_dir()
            .join(key.shard())
            .join(format!("{}.json", key.to_hex()))
    }

    fn read_entry(&self, key: &CacheKey, path: &Path) -> Result<Option<CacheEntry>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(NewhelmError::cache_io(path, e)),
        };

        let entry: CacheEntry =
            serde_json::from_slice(&bytes).map_err(|e| NewhelmError::CacheCorrupted {
                key: key.to_hex(),
                reason: e.to_string(),
            })?;

        if entry.key != *key {
            return Err(NewhelmError::CacheCorrupted {
                key: key.to_hex(),
                reason: format!("file holds entry for {}", entry.key),
            });
        }
        if entry.metadata.schema_version != self.schema_version {
            tracing::warn!(
                key = %key,
                found = entry.metadata.schema_version,
                expected = self.schema_version,
                "ignoring cache entry from another schema version"
            );
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Compare an existing entry with a candidate value
    fn settle_existing(&self, key: &CacheKey, existing: &CacheEntry, value: &Value) -> Result<PutOutcome> {
        if canonical::canonical_eq(&existing.value, value)? {
            tracing::debug!(key = %key, "identical value already cached");
            Ok(PutOutcome::AlreadyPresent)
        } else {
            tracing::warn!(key = %key, "refusing to overwrite cached response with a different value");
            Err(NewhelmError::CacheKeyConflict { key: *key })
        }
    }

    /// Remove every entry in the current namespace. Returns entries removed.
    pub fn clear(&self) -> Result<u64> {
        let namespace = self.namespace_dir();
        let (entries, _) = count_entries(&namespace)?;
        match fs::remove_dir_all(&namespace) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(NewhelmError::cache_io(&namespace, e)),
        }
        fs::create_dir_all(&namespace).map_err(|e| NewhelmError::cache_io(&namespace, e))?;
        tracing::info!(removed = entries, namespace = %namespace.display(), "cleared cache");
        Ok(entries)
    }

    /// Delete namespaces left behind by other schema versions
    pub fn prune_other_versions(&self) -> Result<Vec<u32>> {
        let mut pruned = Vec::new();
        for version in self.versions_present()? {
            if version == self.schema_version {
                continue;
            }
            let dir = self.root.join(format!("v{}", version));
            fs::remove_dir_all(&dir).map_err(|e| NewhelmError::cache_io(&dir, e))?;
            tracing::info!(version, "pruned cache namespace");
            pruned.push(version);
        }
        Ok(pruned)
    }

    /// Entry count and size of the current namespace
    pub fn stats(&self) -> Result<DiskCacheStats> {
        let (entries, bytes) = count_entries(&self.namespace_dir())?;
        let other_versions = self
            .versions_present()?
            .into_iter()
            .filter(|v| *v != self.schema_version)
            .collect();
        Ok(DiskCacheStats {
            root: self.root.clone(),
            schema_version: self.schema_version,
            entries,
            bytes,
            other_versions,
        })
    }

    /// Delete temp files abandoned by interrupted writers
    pub fn sweep_partials(&self) -> Result<u64> {
        let namespace = self.namespace_dir();
        let shards = match fs::read_dir(&namespace) {
            Ok(shards) => shards,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(NewhelmError::cache_io(&namespace, e)),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for shard in shards {
            let shard = shard.map_err(|e| NewhelmError::cache_io(&namespace, e))?;
            if !shard.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let shard_path = shard.path();
            let files = fs::read_dir(&shard_path).map_err(|e| NewhelmError::cache_io(&shard_path, e))?;
            for file in files {
                let file = file.map_err(|e| NewhelmError::cache_io(&shard_path, e))?;
                if !file.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                    continue;
                }
                let stale = file
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok())
                    .map(|age| age >= PARTIAL_GRACE)
                    .unwrap_or(false);
                if stale && fs::remove_file(file.path()).is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    fn versions_present(&self) -> Result<Vec<u32>> {
        let dirs = fs::read_dir(&self.root).map_err(|e| NewhelmError::cache_io(&self.root, e))?;
        let mut versions = Vec::new();
        for dir in dirs {
            let dir = dir.map_err(|e| NewhelmError::cache_io(&self.root, e))?;
            let name = dir.file_name();
            let version = name
                .to_str()
                .and_then(|n| n.strip_prefix('v'))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(version) = version {
                if dir.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    versions.push(version);
                }
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }
}

impl ResponseCache for DiskCache {
    fn get(&self, key: &CacheKey) -> Result<Option<serde_json::Value>> {
        let path = self.entry_path(key);
        let entry = self.read_entry(key, &path)?;
        tracing::trace!(key = %key, hit = entry.is_some(), "cache lookup");
        Ok(entry.map(|e| e.value))
    }

    fn put(&self, key: &CacheKey, value: &Value) -> Result<PutOutcome> {
        let path = self.entry_path(key);
        if let Some(existing) = self.read_entry(key, &path)? {
            return self.settle_existing(key, &existing, value);
        }

        let shard_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.namespace_dir());
        fs::create_dir_all(&shard_dir).map_err(|e| NewhelmError::cache_io(&shard_dir, e))?;

        let entry = CacheEntry::new(*key, value.clone(), self.schema_version);
        let bytes = serde_json::to_vec(&entry)?;

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(".json")
            .tempfile_in(&shard_dir)
            .map_err(|e| NewhelmError::cache_io(&shard_dir, e))?;
        temp.write_all(&bytes)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| NewhelmError::cache_io(temp.path(), e))?;

        match temp.persist_noclobber(&path) {
            Ok(_) => {}
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                // Lost the race; the temp file is removed when `err` drops
                drop(err);
                return match self.read_entry(key, &path)? {
                    Some(existing) => self.settle_existing(key, &existing, value),
                    None => Err(NewhelmError::CacheCorrupted {
                        key: key.to_hex(),
                        reason: "entry vanished after a concurrent write".to_string(),
                    }),
                };
            }
            Err(err) => return Err(NewhelmError::cache_io(&path, err.error)),
        }

        fsync_dir(&shard_dir)?;
        tracing::debug!(key = %key, path = %path.display(), "stored cache entry");
        Ok(PutOutcome::Stored)
    }

    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)
        .and_then(|f| f.sync_all())
        .map_err(|e| NewhelmError::cache_io(dir, e))
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

fn count_entries(namespace: &Path) -> Result<(u64, u64)> {
    let shards = match fs::read_dir(namespace) {
        Ok(shards) => shards,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((0, 0)),
        Err(e) => return Err(NewhelmError::cache_io(namespace, e)),
    };
    let mut entries = 0;
    let mut bytes = 0;
    for shard in shards {
        let shard = shard.map_err(|e| NewhelmError::cache_io(namespace, e))?;
        if !shard.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let shard_path = shard.path();
        let files = fs::read_dir(&shard_path).map_err(|e| NewhelmError::cache_io(&shard_path, e))?;
        for file in files {
            let file = file.map_err(|e| NewhelmError::cache_io(&shard_path, e))?;
            let name = file.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(TEMP_PREFIX) || !name.ends_with(".json") {
                continue;
            }
            entries += 1;
            bytes += file.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok((entries, bytes))
}
