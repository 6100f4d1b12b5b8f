//! Run provenance
//!
//! A [`RunProvenance`] records what an evaluation run was built from: every
//! component's initialization record and digest, the asset versions that
//! were resolved and how the cache behaved. It is written once at the end of
//! a run and can be loaded back to rebuild the same components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;

use crate::deps::Checksum;
use crate::error::{NewhelmError, Result};
use crate::fingerprint::{CacheKey, fingerprint_record};
use crate::pipeline::CacheStats;
use crate::record::InitializationRecord;
use crate::registry::Capability;

/// Current provenance file schema
pub const PROVENANCE_SCHEMA_VERSION: u32 = 1;

/// One component used in a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentProvenance {
    pub capability: Capability,
    pub record: InitializationRecord,
    pub record_digest: CacheKey,
}

/// Everything needed to explain, and rebuild, a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProvenance {
    pub schema_version: u32,
    pub run_id: uuid::Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub components: Vec<ComponentProvenance>,
    #[serde(default)]
    pub dependency_versions: BTreeMap<String, Checksum>,
    #[serde(default)]
    pub cache_stats: CacheStats,
}

impl Default for RunProvenance {
    fn default() -> Self {
        Self::new()
    }
}

impl RunProvenance {
    /// Start a new run
    pub fn new() -> Self {
        Self {
            schema_version: PROVENANCE_SCHEMA_VERSION,
            run_id: uuid::Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            components: Vec::new(),
            dependency_versions: BTreeMap::new(),
            cache_stats: CacheStats::default(),
        }
    }

    /// Record a component; the same record is only listed once
    pub fn add_component(
        &mut self,
        capability: Capability,
        record: &InitializationRecord,
    ) -> Result<CacheKey> {
        let record_digest = fingerprint_record(record)?;
        if !self.components.iter().any(|c| c.record_digest == record_digest) {
            self.components.push(ComponentProvenance {
                capability,
                record: record.clone(),
                record_digest,
            });
        }
        Ok(record_digest)
    }

    pub fn with_dependency_versions(mut self, versions: BTreeMap<String, Checksum>) -> Self {
        self.dependency_versions = versions;
        self
    }

    /// Stamp the end of the run
    pub fn finish(&mut self, dependency_versions: BTreeMap<String, Checksum>, cache_stats: CacheStats) {
        self.dependency_versions = dependency_versions;
        self.cache_stats = cache_stats;
        self.finished_at = Some(Utc::now());
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }

    pub fn components_of(&self, capability: Capability) -> impl Iterator<Item = &ComponentProvenance> {
        self.components
            .iter()
            .filter(move |c| c.capability == capability)
    }

    /// Atomically write as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;

        let bytes = serde_json::to_vec_pretty(self)?;
        let mut temp = tempfile::Builder::new()
            .prefix(".tmp-provenance-")
            .tempfile_in(dir)
            .map_err(|e| io_error(dir, e))?;
        temp.write_all(&bytes)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| io_error(path, e))?;
        temp.persist(path).map_err(|e| io_error(path, e.error))?;

        tracing::info!(run_id = %self.run_id, path = %path.display(), "saved run provenance");
        Ok(())
    }

    /// Load a file written by [`save`](Self::save)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| io_error(path, e))?;
        let provenance: RunProvenance = serde_json::from_slice(&bytes)?;
        if provenance.schema_version > PROVENANCE_SCHEMA_VERSION {
            return Err(NewhelmError::Configuration(format!(
                "{} uses provenance schema {} but this build reads up to {}",
                path.display(),
                provenance.schema_version,
                PROVENANCE_SCHEMA_VERSION
            )));
        }
        Ok(provenance)
    }
}

fn io_error(path: &Path, e: std::io::Error) -> NewhelmError {
    NewhelmError::Configuration(format!("Provenance file {}: {}", path.display(), e))
}

impl fmt::Display for RunProvenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {}", self.run_id)?;
        write!(f, "  started:  {}", self.started_at.to_rfc3339())?;
        match self.finished_at {
            Some(end) => writeln!(f, "\n  finished: {}", end.to_rfc3339())?,
            None => writeln!(f, "\n  finished: (in progress)")?,
        }

        writeln!(f, "  components:")?;
        for component in &self.components {
            writeln!(
                f,
                "    [{}] {}  {}",
                component.capability,
                component.record,
                &component.record_digest.to_hex()[..12]
            )?;
        }

        if !self.dependency_versions.is_empty() {
            writeln!(f, "  dependencies:")?;
            for (name, checksum) in &self.dependency_versions {
                writeln!(f, "    {} = {}", name, checksum)?;
            }
        }

        write!(
            f,
            "  cache: {} hits, {} misses, {} writes",
            self.cache_stats.hits, self.cache_stats.misses, self.cache_stats.writes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::SecretRef;
    use tempfile::TempDir;

    fn sut_record() -> InitializationRecord {
        InitializationRecord::builder("together_sut")
            .arg("llama-2-7b")
            .secret_kwarg("api_key", SecretRef::required("together", "api_key"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_components_deduplicated() {
        let mut run = RunProvenance::new();
        let a = run.add_component(Capability::Sut, &sut_record()).unwrap();
        let b = run.add_component(Capability::Sut, &sut_record()).unwrap();
        assert_eq!(a, b);
        assert_eq!(run.components.len(), 1);
        assert_eq!(run.components_of(Capability::Test).count(), 0);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs").join("provenance.json");

        let mut run = RunProvenance::new();
        run.add_component(Capability::Sut, &sut_record()).unwrap();
        let mut versions = BTreeMap::new();
        versions.insert("bbq".to_string(), Checksum::of_bytes(b"bbq"));
        run.finish(
            versions,
            CacheStats {
                hits: 3,
                misses: 1,
                writes: 1,
            },
        );
        run.save(&path).unwrap();

        let loaded = RunProvenance::load(&path).unwrap();
        assert_eq!(loaded, run);
        assert!(loaded.duration().is_some());
    }

    #[test]
    fn test_display_summary_hides_secrets() {
        let mut run = RunProvenance::new();
        run.add_component(Capability::Sut, &sut_record()).unwrap();
        let summary = run.to_string();
        assert!(summary.contains("[sut] together_sut(\"llama-2-7b\", api_key=<secret together/api_key>)"));
        assert!(summary.contains("(in progress)"));
    }
}
