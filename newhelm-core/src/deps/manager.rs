//! Resolving declared assets to verified local paths

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::NamedTempFile;
use tokio::sync::OnceCell;

use super::archive::{gunzip_into, untar_gz_into};
use super::{AssetSource, Checksum, Decompression, DependencyAsset, FetchError, ResolutionState, SourceRouter};
use crate::config::DependencyConfig;
use crate::error::{NewhelmError, Result};
use crate::retry::{RetryConfig, RetryController, RetryError};

const TEMP_PREFIX: &str = ".tmp-";

/// Bookkeeping written next to every verified asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub name: String,
    pub source_locator: String,
    pub checksum: Checksum,
    pub decompression: Decompression,
    pub size_bytes: u64,
    pub resolved_at: DateTime<Utc>,
}

struct AssetSlot {
    asset: DependencyAsset,
    path: OnceCell<PathBuf>,
    state: Mutex<ResolutionState>,
}

impl AssetSlot {
    fn new(asset: DependencyAsset) -> Self {
        Self {
            asset,
            path: OnceCell::new(),
            state: Mutex::new(ResolutionState::Unresolved),
        }
    }

    fn set_state(&self, state: ResolutionState) {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = state;
    }

    fn state(&self) -> ResolutionState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Fetches, verifies and caches test assets
///
/// Resolution is single-flight per asset name within a process: concurrent
/// callers wait for the first resolver and share its result. A verified path
/// is memoized for the life of the manager and reused across runs from disk.
pub struct DependencyManager {
    data_dir: PathBuf,
    source: Arc<dyn AssetSource>,
    retry: RetryController,
    slots: Mutex<HashMap<String, Arc<AssetSlot>>>,
}

impl std::fmt::Debug for DependencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyManager")
            .field("data_dir", &self.data_dir)
            .field("retry", &self.retry)
            .finish()
    }
}

impl DependencyManager {
    pub fn new(data_dir: impl Into<PathBuf>, source: Arc<dyn AssetSource>) -> Self {
        Self {
            data_dir: data_dir.into(),
            source,
            retry: RetryController::default(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Build a manager with HTTP and local-file sources from configuration
    pub fn from_config(config: &DependencyConfig) -> Result<Self> {
        let router = SourceRouter::with_defaults(config.download_timeout).map_err(|e| {
            NewhelmError::Configuration(format!("Failed to build asset sources: {}", e))
        })?;
        Ok(Self::new(&config.data_dir, Arc::new(router)).with_retry(config.retry.clone()))
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryController::new(config);
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn asset_dir(&self, asset: &DependencyAsset) -> PathBuf {
        self.data_dir.join(asset.name())
    }

    /// Where the verified artifact for `asset` lives once resolved
    pub fn local_path_for(&self, asset: &DependencyAsset) -> PathBuf {
        self.asset_dir(asset).join(asset.expected_checksum().as_hex())
    }

    fn archive_path(&self, asset: &DependencyAsset) -> PathBuf {
        self.asset_dir(asset)
            .join(format!("{}.archive", asset.expected_checksum().as_hex()))
    }

    fn metadata_path(&self, asset: &DependencyAsset) -> PathBuf {
        self.asset_dir(asset)
            .join(format!("{}.metadata.json", asset.expected_checksum().as_hex()))
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<AssetSlot>>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn slot(&self, asset: &DependencyAsset) -> Result<Arc<AssetSlot>> {
        let mut slots = self.slots();
        if let Some(existing) = slots.get(asset.name()) {
            let same = existing.asset.expected_checksum() == asset.expected_checksum()
                && existing.asset.decompression() == asset.decompression();
            if !same {
                return Err(NewhelmError::InvalidAsset {
                    name: asset.name().to_string(),
                    reason: format!(
                        "already declared with checksum {} ({})",
                        existing.asset.expected_checksum(),
                        existing.asset.decompression()
                    ),
                });
            }
            return Ok(existing.clone());
        }
        let slot = Arc::new(AssetSlot::new(asset.clone()));
        slots.insert(asset.name().to_string(), slot.clone());
        Ok(slot)
    }

    /// Current state of the asset called `name`
    pub fn resolution_state(&self, name: &str) -> ResolutionState {
        self.slots()
            .get(name)
            .map(|slot| slot.state())
            .unwrap_or(ResolutionState::Unresolved)
    }

    /// Name -> checksum of every asset verified by this manager
    pub fn versions_used(&self) -> BTreeMap<String, Checksum> {
        self.slots()
            .iter()
            .filter(|(_, slot)| slot.path.initialized())
            .map(|(name, slot)| (name.clone(), slot.asset.expected_checksum().clone()))
            .collect()
    }

    /// Read the metadata recorded when `asset` was verified, if any
    pub fn metadata(&self, asset: &DependencyAsset) -> Result<Option<AssetMetadata>> {
        let path = self.metadata_path(asset);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(asset, e.into())),
        }
    }

    /// Resolve `asset` to a verified local path
    ///
    /// Idempotent: after the first success the memoized path is returned
    /// without touching the network.
    pub async fn resolve(&self, asset: &DependencyAsset) -> Result<PathBuf> {
        asset.validate()?;
        let slot = self.slot(asset)?;
        let resolved = slot
            .path
            .get_or_try_init(|| self.materialize(&slot))
            .await;
        match resolved {
            Ok(path) => Ok(path.clone()),
            Err(e) => {
                slot.set_state(ResolutionState::Failed);
                tracing::warn!(asset = asset.name(), error = %e, "asset resolution failed");
                Err(e)
            }
        }
    }

    /// Resolve several assets concurrently
    pub async fn resolve_all(&self, assets: &[DependencyAsset]) -> Result<BTreeMap<String, PathBuf>> {
        let resolved = futures::future::try_join_all(assets.iter().map(|asset| async move {
            self.resolve(asset)
                .await
                .map(|path| (asset.name().to_string(), path))
        }))
        .await?;
        Ok(resolved.into_iter().collect())
    }

    async fn materialize(&self, slot: &AssetSlot) -> Result<PathBuf> {
        let asset = &slot.asset;
        let asset_dir = self.asset_dir(asset);
        tokio::fs::create_dir_all(&asset_dir)
            .await
            .map_err(|e| unavailable(asset, e.into()))?;

        slot.set_state(ResolutionState::Verifying);
        if let Some(path) = self.verify_existing(asset).await? {
            tracing::debug!(asset = asset.name(), path = %path.display(), "reusing verified asset");
            slot.set_state(ResolutionState::Verified);
            return Ok(path);
        }

        slot.set_state(ResolutionState::Downloading);
        tracing::info!(asset = asset.name(), locator = asset.source_locator(), "downloading asset");
        let (temp, size_bytes) = self.download(asset).await?;

        slot.set_state(ResolutionState::Verifying);
        let temp_path = temp.path().to_path_buf();
        let actual = blocking(move || Ok(Checksum::of_file(&temp_path)?))
            .await
            .map_err(|e| unavailable(asset, e))?;
        if actual != *asset.expected_checksum() {
            drop(temp);
            return Err(NewhelmError::IntegrityError {
                asset: asset.name().to_string(),
                expected: asset.expected_checksum().to_string(),
                actual: actual.to_string(),
            });
        }

        let path = self.finalize(asset, temp).await?;
        self.write_metadata(asset, size_bytes).await;
        slot.set_state(ResolutionState::Verified);
        tracing::info!(asset = asset.name(), path = %path.display(), bytes = size_bytes, "asset verified");
        Ok(path)
    }

    /// Check a copy left by an earlier run.
    ///
    /// Returns the path if it still verifies. Anything stale is removed so
    /// the caller starts from a clean slate.
    async fn verify_existing(&self, asset: &DependencyAsset) -> Result<Option<PathBuf>> {
        let target = self.local_path_for(asset);
        let archive = self.archive_path(asset);
        let expected = asset.expected_checksum().clone();
        let decompression = asset.decompression();
        let name = asset.name().to_string();

        blocking(move || {
            if decompression == Decompression::None {
                if !target.is_file() {
                    return Ok(None);
                }
                if Checksum::of_file(&target)? == expected {
                    return Ok(Some(target));
                }
                tracing::warn!(asset = %name, path = %target.display(), "stored asset no longer matches its checksum");
                fs::remove_file(&target)?;
                return Ok(None);
            }

            let archive_ok = archive.is_file() && Checksum::of_file(&archive)? == expected;
            if !archive_ok {
                if archive.exists() {
                    tracing::warn!(asset = %name, path = %archive.display(), "discarding archive with wrong checksum");
                    fs::remove_file(&archive)?;
                }
                remove_path(&target)?;
                return Ok(None);
            }
            if !target.exists() {
                unpack(decompression, &archive, &target)?;
            }
            Ok(Some(target))
        })
        .await
        .map_err(|e| unavailable(asset, e))
    }

    /// Download into a temp file in the asset directory, retrying transient failures
    async fn download(&self, asset: &DependencyAsset) -> Result<(NamedTempFile, u64)> {
        let asset_dir = self.asset_dir(asset);
        let locator = asset.source_locator();
        let source = &self.source;

        self.retry
            .call(|| {
                let asset_dir = asset_dir.clone();
                async move {
                    let temp = tempfile::Builder::new()
                        .prefix(".tmp-download-")
                        .tempfile_in(&asset_dir)?;
                    let mut file = tokio::fs::File::from_std(temp.reopen()?);
                    let size = source.fetch(locator, &mut file).await?;
                    file.sync_all().await?;
                    Ok::<_, FetchError>((temp, size))
                }
            })
            .await
            .map_err(|err| {
                let source = match err {
                    RetryError::Fatal { error, .. } => error,
                    RetryError::Exhausted { attempts, last } => FetchError::Exhausted {
                        attempts,
                        last: Box::new(last),
                    },
                };
                unavailable(asset, source)
            })
    }

    /// Move verified bytes into place and unpack archives
    async fn finalize(&self, asset: &DependencyAsset, temp: NamedTempFile) -> Result<PathBuf> {
        let target = self.local_path_for(asset);
        let archive = self.archive_path(asset);
        let expected = asset.expected_checksum().clone();
        let decompression = asset.decompression();

        blocking(move || {
            if decompression == Decompression::None {
                place_verified(temp, &target, &expected)?;
            } else {
                place_verified(temp, &archive, &expected)?;
                if !target.exists() {
                    unpack(decompression, &archive, &target)?;
                }
            }
            Ok(target)
        })
        .await
        .map_err(|e| unavailable(asset, e))
    }

    async fn write_metadata(&self, asset: &DependencyAsset, size_bytes: u64) {
        let metadata = AssetMetadata {
            name: asset.name().to_string(),
            source_locator: asset.source_locator().to_string(),
            checksum: asset.expected_checksum().clone(),
            decompression: asset.decompression(),
            size_bytes,
            resolved_at: Utc::now(),
        };
        let path = self.metadata_path(asset);
        let written = blocking(move || {
            let bytes = serde_json::to_vec_pretty(&metadata)
                .map_err(|e| FetchError::Io(io::Error::other(e)))?;
            let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
            let mut temp = tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(&dir)?;
            io::Write::write_all(&mut temp, &bytes)?;
            temp.persist(&path).map_err(|e| FetchError::Io(e.error))?;
            Ok(())
        })
        .await;
        if let Err(e) = written {
            tracing::warn!(asset = asset.name(), error = %e, "failed to record asset metadata");
        }
    }
}

fn unavailable(asset: &DependencyAsset, source: FetchError) -> NewhelmError {
    NewhelmError::DependencyUnavailable {
        asset: asset.name().to_string(),
        source,
    }
}

async fn blocking<T, F>(f: F) -> std::result::Result<T, FetchError>
where
    F: FnOnce() -> std::result::Result<T, FetchError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FetchError::Io(io::Error::other(e)))?
}

/// Link verified bytes at `dest` unless another process got there first
fn place_verified(temp: NamedTempFile, dest: &Path, expected: &Checksum) -> std::result::Result<(), FetchError> {
    match temp.persist_noclobber(dest) {
        Ok(_) => {}
        Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
            if Checksum::of_file(dest)? == *expected {
                tracing::debug!(path = %dest.display(), "asset already materialized, discarding duplicate");
            } else {
                fs::remove_file(dest)?;
                err.file.persist_noclobber(dest).map_err(|e| FetchError::Io(e.error))?;
            }
        }
        Err(err) => return Err(FetchError::Io(err.error)),
    }
    fsync_parent(dest)
}

/// Unpack `archive` beside `target` then rename into place
fn unpack(decompression: Decompression, archive: &Path, target: &Path) -> std::result::Result<(), FetchError> {
    let dir = target
        .parent()
        .ok_or_else(|| FetchError::Archive(format!("{} has no parent", target.display())))?;

    match decompression {
        Decompression::None => return Ok(()),
        Decompression::Gzip => {
            let mut staged = tempfile::Builder::new()
                .prefix(".tmp-unpack-")
                .tempfile_in(dir)?;
            gunzip_into(archive, staged.as_file_mut())?;
            match staged.persist_noclobber(target) {
                Ok(_) => {}
                Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(FetchError::Io(err.error)),
            }
        }
        Decompression::TarGz => {
            let staged = tempfile::Builder::new()
                .prefix(".tmp-unpack-")
                .tempdir_in(dir)?;
            untar_gz_into(archive, staged.path())?;
            if let Err(e) = fs::rename(staged.path(), target) {
                if !target.is_dir() {
                    return Err(e.into());
                }
                // Another process unpacked the same verified archive first
            }
        }
    }
    fsync_parent(target)
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn fsync_parent(path: &Path) -> std::result::Result<(), FetchError> {
    if let Some(parent) = path.parent() {
        fs::File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn fsync_parent(_path: &Path) -> std::result::Result<(), FetchError> {
    Ok(())
}
