//! Secret descriptions and deferred secret injection
//!
//! Secret values never enter an initialization record. A record stores a
//! [`SecretRef`] naming where the value lives; the registry resolves it
//! against [`RawSecrets`] when an instance is built. Fingerprints and
//! provenance therefore stay identical whichever key a run was given.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// How to look up a secret and how to get the value if you don't have it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretDescription {
    pub scope: String,
    pub key: String,
    pub instructions: String,
}

impl SecretDescription {
    pub fn new(
        scope: impl Into<String>,
        key: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            scope: scope.into(),
            key: key.into(),
            instructions: instructions.into(),
        }
    }

    /// Reference to this secret for use as a constructor argument
    pub fn required(&self) -> SecretRef {
        SecretRef::required(&self.scope, &self.key)
    }

    /// Optional reference to this secret
    pub fn optional(&self) -> SecretRef {
        SecretRef::optional(&self.scope, &self.key)
    }
}

impl fmt::Display for SecretDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope={} key={}", self.scope, self.key)?;
        if !self.instructions.is_empty() {
            write!(f, " ({})", self.instructions)?;
        }
        Ok(())
    }
}

/// Pointer to a secret, recorded in place of its value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    pub scope: String,
    pub key: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl SecretRef {
    pub fn required(scope: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            key: key.into(),
            required: true,
        }
    }

    pub fn optional(scope: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            key: key.into(),
            required: false,
        }
    }

    /// Look the secret up.
    ///
    /// A missing required secret is an error; a missing optional secret
    /// resolves to `None`.
    pub fn resolve(&self, raw: &RawSecrets) -> Result<Option<String>, MissingSecretValues> {
        match raw.get(&self.scope, &self.key) {
            Some(value) => Ok(Some(value.to_string())),
            None if self.required => Err(MissingSecretValues::new(vec![SecretDescription::new(
                &self.scope,
                &self.key,
                "",
            )])),
            None => Ok(None),
        }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<secret {}/{}>", self.scope, self.key)
    }
}

/// Secret values as read from a file: scope -> key -> value
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawSecrets(BTreeMap<String, BTreeMap<String, String>>);

impl fmt::Debug for RawSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print values
        let scopes: BTreeMap<&str, Vec<&str>> = self
            .0
            .iter()
            .map(|(scope, keys)| (scope.as_str(), keys.keys().map(String::as_str).collect()))
            .collect();
        f.debug_tuple("RawSecrets").field(&scopes).finish()
    }
}

impl RawSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load secrets from a TOML file with one table per scope.
    ///
    /// ```toml
    /// [together]
    /// api_key = "..."
    /// ```
    pub fn from_file(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Toml},
        };

        let path = path.as_ref();
        if !path.exists() {
            return Err(crate::error::NewhelmError::Configuration(format!(
                "Secrets file not found: {}",
                path.display()
            )));
        }

        Figment::new().merge(Toml::file(path)).extract().map_err(|e| {
            crate::error::NewhelmError::Configuration(format!(
                "Failed to load secrets file {}: {}",
                path.display(),
                e
            ))
        })
    }

    pub fn insert(
        &mut self,
        scope: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.0
            .entry(scope.into())
            .or_default()
            .insert(key.into(), value.into());
    }

    pub fn with(mut self, scope: &str, key: &str, value: &str) -> Self {
        self.insert(scope, key, value);
        self
    }

    pub fn get(&self, scope: &str, key: &str) -> Option<&str> {
        self.0.get(scope)?.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }
}

/// One or more required secrets were not supplied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingSecretValues {
    descriptions: Vec<SecretDescription>,
}

impl MissingSecretValues {
    pub fn new(descriptions: Vec<SecretDescription>) -> Self {
        Self { descriptions }
    }

    /// Combine multiple errors into one
    pub fn combine(errors: impl IntoIterator<Item = MissingSecretValues>) -> Self {
        let descriptions = errors
            .into_iter()
            .flat_map(|error| error.descriptions)
            .collect();
        Self { descriptions }
    }

    pub fn descriptions(&self) -> &[SecretDescription] {
        &self.descriptions
    }
}

impl fmt::Display for MissingSecretValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Missing the following secrets:")?;
        for description in &self.descriptions {
            writeln!(f, "  {}", description)?;
        }
        Ok(())
    }
}

impl std::error::Error for MissingSecretValues {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_secret_resolves() {
        let raw = RawSecrets::new().with("together", "api_key", "sk-123");
        let secret = SecretRef::required("together", "api_key");
        assert_eq!(secret.resolve(&raw).unwrap().as_deref(), Some("sk-123"));
    }

    #[test]
    fn test_missing_optional_secret_is_none() {
        let secret = SecretRef::optional("together", "api_key");
        assert_eq!(secret.resolve(&RawSecrets::new()).unwrap(), None);
    }

    #[test]
    fn test_missing_secrets_combine() {
        let raw = RawSecrets::new();
        let errors: Vec<_> = [
            SecretRef::required("openai", "api_key"),
            SecretRef::required("perspective", "api_key"),
        ]
        .iter()
        .filter_map(|s| s.resolve(&raw).err())
        .collect();

        let combined = MissingSecretValues::combine(errors);
        assert_eq!(combined.descriptions().len(), 2);
        let message = combined.to_string();
        assert!(message.contains("scope=openai key=api_key"));
        assert!(message.contains("scope=perspective key=api_key"));
    }

    #[test]
    fn test_debug_never_prints_values() {
        let raw = RawSecrets::new().with("together", "api_key", "sk-very-secret");
        let debug = format!("{:?}", raw);
        assert!(debug.contains("together"));
        assert!(!debug.contains("sk-very-secret"));
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("secrets.toml");
        std::fs::write(&path, "[together]\napi_key = \"abc\"\n").unwrap();

        let raw = RawSecrets::from_file(&path).unwrap();
        assert_eq!(raw.get("together", "api_key"), Some("abc"));
        assert!(RawSecrets::from_file(dir.path().join("missing.toml")).is_err());
    }
}
