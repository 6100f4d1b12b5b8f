//! External test-asset dependencies
//!
//! Tests declare the files they need as [`DependencyAsset`]s: a name, where
//! to fetch it, the SHA-256 it must hash to and how to unpack it. The
//! [`DependencyManager`] turns a declaration into a verified local path.
//!
//! # Storage layout
//!
//! ```text
//! <data_dir>/<name>/<checksum>                 file or directory handed to callers
//! <data_dir>/<name>/<checksum>.archive         verified archive bytes (gzip / tar.gz)
//! <data_dir>/<name>/<checksum>.metadata.json   where it came from and when
//! <data_dir>/<name>/.tmp*                      in-flight downloads, never exposed
//! ```

mod archive;
mod manager;
mod source;

pub use manager::{AssetMetadata, DependencyManager};
pub use source::{AssetSource, HttpSource, LocalFileSource, SourceRouter};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{NewhelmError, Result};
use crate::retry::{Classify, ErrorClass};

static ASSET_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").expect("static regex"));

/// Expected SHA-256 of an asset's downloaded bytes
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum(String);

impl Checksum {
    /// Parse `sha256:<hex>` or bare `<hex>`
    pub fn parse(input: &str) -> Option<Self> {
        let hex = input.strip_prefix("sha256:").unwrap_or(input);
        if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(hex.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(format!("{:x}", Sha256::digest(bytes)))
    }

    /// Hash a file without loading it into memory
    pub fn of_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(Self(format!("{:x}", hasher.finalize())))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.0)
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("sha256:{}", self.0))
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Checksum::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid sha256 checksum '{}'", s)))
    }
}

/// How the downloaded bytes are turned into the local artifact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decompression {
    /// Keep the bytes as a single file
    #[default]
    None,
    /// Gunzip into a single file
    Gzip,
    /// Gunzip and untar into a directory
    TarGz,
}

impl fmt::Display for Decompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decompression::None => write!(f, "none"),
            Decompression::Gzip => write!(f, "gzip"),
            Decompression::TarGz => write!(f, "tar-gz"),
        }
    }
}

impl FromStr for Decompression {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(Decompression::None),
            "gzip" | "gz" => Ok(Decompression::Gzip),
            "tar-gz" | "tar.gz" | "tgz" => Ok(Decompression::TarGz),
            other => Err(format!("unknown decompression '{}'", other)),
        }
    }
}

/// A named file a Test needs, pinned by checksum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyAsset {
    name: String,
    source_locator: String,
    expected_checksum: Checksum,
    #[serde(default)]
    decompression: Decompression,
}

impl DependencyAsset {
    /// Declare an asset
    ///
    /// `name` becomes a directory name, so it is restricted to
    /// `[A-Za-z0-9_.-]` and may not start with a dot.
    pub fn new(
        name: impl Into<String>,
        source_locator: impl Into<String>,
        expected_checksum: &str,
    ) -> Result<Self> {
        let name = name.into();
        if !ASSET_NAME.is_match(&name) {
            return Err(NewhelmError::InvalidAsset {
                name,
                reason: "name must match [A-Za-z0-9_][A-Za-z0-9_.-]*".to_string(),
            });
        }
        let expected_checksum =
            Checksum::parse(expected_checksum).ok_or_else(|| NewhelmError::InvalidAsset {
                name: name.clone(),
                reason: format!("'{}' is not a sha256 checksum", expected_checksum),
            })?;
        Ok(Self {
            name,
            source_locator: source_locator.into(),
            expected_checksum,
            decompression: Decompression::None,
        })
    }

    /// Re-check the name of a declaration that was deserialized
    pub fn validate(&self) -> Result<()> {
        if ASSET_NAME.is_match(&self.name) {
            Ok(())
        } else {
            Err(NewhelmError::InvalidAsset {
                name: self.name.clone(),
                reason: "name must match [A-Za-z0-9_][A-Za-z0-9_.-]*".to_string(),
            })
        }
    }

    pub fn with_decompression(mut self, decompression: Decompression) -> Self {
        self.decompression = decompression;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_locator(&self) -> &str {
        &self.source_locator
    }

    pub fn expected_checksum(&self) -> &Checksum {
        &self.expected_checksum
    }

    pub fn decompression(&self) -> Decompression {
        self.decompression
    }
}

/// Where an asset is in its resolution lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    Unresolved,
    Downloading,
    Verifying,
    Verified,
    Failed,
}

impl fmt::Display for ResolutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResolutionState::Unresolved => "unresolved",
            ResolutionState::Downloading => "downloading",
            ResolutionState::Verifying => "verifying",
            ResolutionState::Verified => "verified",
            ResolutionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Failure fetching or materializing an asset
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{locator} returned HTTP {status}")]
    Status { locator: String, status: u16 },

    #[error("network error fetching {locator}: {message}")]
    Network { locator: String, message: String },

    #[error("timed out fetching {locator} after {after:?}")]
    Timeout { locator: String, after: Duration },

    #[error("{locator} does not exist")]
    NotFound { locator: String },

    #[error("no asset source handles '{0}'")]
    UnsupportedLocator(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot unpack archive: {0}")]
    Archive(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: usize,
        #[source]
        last: Box<FetchError>,
    },
}

impl Classify for FetchError {
    fn error_class(&self) -> ErrorClass {
        use std::io::ErrorKind;

        match self {
            FetchError::Status { status, .. } => match status {
                408 | 429 | 500..=599 => ErrorClass::Transient,
                _ => ErrorClass::Fatal,
            },
            FetchError::Network { .. } | FetchError::Timeout { .. } => ErrorClass::Transient,
            FetchError::Io(e) => match e.kind() {
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::TimedOut
                | ErrorKind::Interrupted
                | ErrorKind::UnexpectedEof => ErrorClass::Transient,
                _ => ErrorClass::Fatal,
            },
            FetchError::NotFound { .. }
            | FetchError::UnsupportedLocator(_)
            | FetchError::Archive(_)
            | FetchError::Exhausted { .. } => ErrorClass::Fatal,
        }
    }
}
