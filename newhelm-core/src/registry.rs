//! Plugin registry for SUTs, Tests and Annotators
//!
//! Each concrete type registers a factory once, under a stable type
//! identifier and a [`Capability`] tag. [`PluginRegistry::make_instance`]
//! rebuilds an object from its [`InitializationRecord`], resolving any
//! secret references against the supplied [`RawSecrets`] first.
//!
//! Registries are ordinary values. Process-wide state, when wanted, is set
//! up with [`PluginRegistry::init`] and torn down with
//! [`PluginRegistry::clear`]; nothing registers itself implicitly.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{NewhelmError, Result};
use crate::record::{ArgValue, InitializationRecord};
use crate::secrets::{MissingSecretValues, RawSecrets};

static TYPE_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.:-]+$").expect("static regex"));

/// Whether `id` is a valid type identifier
pub fn is_valid_type_identifier(id: &str) -> bool {
    TYPE_IDENTIFIER.is_match(id)
}

/// Kind of pluggable component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Sut,
    Test,
    Annotator,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Sut => write!(f, "sut"),
            Capability::Test => write!(f, "test"),
            Capability::Annotator => write!(f, "annotator"),
        }
    }
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Type identifier already registered
    DuplicateType(String),
    /// No factory for this type identifier
    NotFound(String),
    /// Type identifier contains characters outside `[A-Za-z0-9_.:-]`
    InvalidIdentifier(String),
    /// A constructor argument is missing or has the wrong shape
    InvalidArgument {
        type_identifier: String,
        argument: String,
        reason: String,
    },
    /// The factory itself failed
    Construction {
        type_identifier: String,
        reason: String,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateType(id) => {
                write!(f, "Type '{}' is already registered", id)
            }
            RegistryError::NotFound(id) => {
                write!(f, "Type '{}' not found", id)
            }
            RegistryError::InvalidIdentifier(id) => {
                write!(f, "Invalid type identifier '{}'", id)
            }
            RegistryError::InvalidArgument {
                type_identifier,
                argument,
                reason,
            } => {
                write!(
                    f,
                    "Invalid argument '{}' for '{}': {}",
                    argument, type_identifier, reason
                )
            }
            RegistryError::Construction {
                type_identifier,
                reason,
            } => {
                write!(f, "Failed to construct '{}': {}", type_identifier, reason)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Constructor arguments with secrets already resolved
#[derive(Debug, Clone)]
pub struct ConstructorArgs {
    record: InitializationRecord,
    positional: Vec<Value>,
    keyword: BTreeMap<String, Value>,
}

impl ConstructorArgs {
    /// The record these arguments were derived from
    pub fn record(&self) -> &InitializationRecord {
        &self.record
    }

    pub fn type_identifier(&self) -> &str {
        self.record.type_identifier()
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn keyword(&self) -> &BTreeMap<String, Value> {
        &self.keyword
    }

    fn invalid(&self, argument: String, reason: String) -> RegistryError {
        RegistryError::InvalidArgument {
            type_identifier: self.type_identifier().to_string(),
            argument,
            reason,
        }
    }

    /// Deserialize positional argument `index`
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> std::result::Result<T, RegistryError> {
        let value = self
            .positional
            .get(index)
            .ok_or_else(|| self.invalid(format!("#{}", index), "missing".to_string()))?;
        serde_json::from_value(value.clone())
            .map_err(|e| self.invalid(format!("#{}", index), e.to_string()))
    }

    /// Deserialize a required keyword argument
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> std::result::Result<T, RegistryError> {
        self.opt_kwarg(name)?
            .ok_or_else(|| self.invalid(name.to_string(), "missing".to_string()))
    }

    /// Deserialize an optional keyword argument; absent or null yields `None`
    pub fn opt_kwarg<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> std::result::Result<Option<T>, RegistryError> {
        match self.keyword.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| self.invalid(name.to_string(), e.to_string())),
        }
    }
}

/// Builds an instance from resolved constructor arguments
pub type Factory<T> =
    Arc<dyn Fn(&ConstructorArgs) -> std::result::Result<T, RegistryError> + Send + Sync>;

struct Registration<T> {
    capability: Capability,
    factory: Factory<T>,
}

/// Registers a group of plugin types
pub trait PluginSource<T> {
    fn register(&self, registry: &PluginRegistry<T>) -> std::result::Result<(), RegistryError>;
}

impl<T, F> PluginSource<T> for F
where
    F: Fn(&PluginRegistry<T>) -> std::result::Result<(), RegistryError>,
{
    fn register(&self, registry: &PluginRegistry<T>) -> std::result::Result<(), RegistryError> {
        self(registry)
    }
}

/// Type identifier -> factory map
pub struct PluginRegistry<T> {
    entries: RwLock<BTreeMap<String, Registration<T>>>,
}

impl<T> Default for PluginRegistry<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T> fmt::Debug for PluginRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("types", &self.list(None))
            .finish()
    }
}

impl<T> PluginRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Registration<T>>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Registration<T>>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a factory under `type_identifier`
    ///
    /// Fails if the identifier is malformed or already taken.
    pub fn register<F>(
        &self,
        type_identifier: impl Into<String>,
        capability: Capability,
        factory: F,
    ) -> std::result::Result<(), RegistryError>
    where
        F: Fn(&ConstructorArgs) -> std::result::Result<T, RegistryError> + Send + Sync + 'static,
    {
        let type_identifier = type_identifier.into();
        if !is_valid_type_identifier(&type_identifier) {
            return Err(RegistryError::InvalidIdentifier(type_identifier));
        }

        let mut entries = self.write();
        if entries.contains_key(&type_identifier) {
            return Err(RegistryError::DuplicateType(type_identifier));
        }
        tracing::debug!(type_identifier = %type_identifier, %capability, "registered plugin type");
        entries.insert(
            type_identifier,
            Registration {
                capability,
                factory: Arc::new(factory),
            },
        );
        Ok(())
    }

    pub fn contains(&self, type_identifier: &str) -> bool {
        self.read().contains_key(type_identifier)
    }

    pub fn capability_of(&self, type_identifier: &str) -> Option<Capability> {
        self.read().get(type_identifier).map(|r| r.capability)
    }

    /// Registered types, optionally filtered by capability, sorted by id
    pub fn list(&self, capability: Option<Capability>) -> Vec<(String, Capability)> {
        self.read()
            .iter()
            .filter(|(_, r)| capability.is_none_or(|c| c == r.capability))
            .map(|(id, r)| (id.clone(), r.capability))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Remove every registration
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Reset the registry and populate it from `sources`
    ///
    /// Returns the number of registered types.
    pub fn init(&self, sources: &[&dyn PluginSource<T>]) -> std::result::Result<usize, RegistryError> {
        self.clear();
        for source in sources {
            source.register(self)?;
        }
        let count = self.len();
        tracing::info!(types = count, "plugin registry initialised");
        Ok(count)
    }

    /// Rebuild an instance from its initialization record
    ///
    /// Every missing required secret is reported together in one
    /// [`NewhelmError::MissingSecrets`].
    pub fn make_instance(&self, record: &InitializationRecord, secrets: &RawSecrets) -> Result<T> {
        let factory = {
            let entries = self.read();
            let registration = entries
                .get(record.type_identifier())
                .ok_or_else(|| RegistryError::NotFound(record.type_identifier().to_string()))?;
            registration.factory.clone()
        };

        let mut missing = Vec::new();
        let mut resolve = |arg: &ArgValue| -> Value {
            match arg {
                ArgValue::Value(v) => v.clone(),
                ArgValue::Secret(secret) => match secret.resolve(secrets) {
                    Ok(Some(value)) => Value::String(value),
                    Ok(None) => Value::Null,
                    Err(e) => {
                        missing.push(e);
                        Value::Null
                    }
                },
            }
        };

        let positional: Vec<Value> = record.positional_args().iter().map(&mut resolve).collect();
        let keyword: BTreeMap<String, Value> = record
            .keyword_args()
            .iter()
            .map(|(name, arg)| (name.clone(), resolve(arg)))
            .collect();

        if !missing.is_empty() {
            return Err(NewhelmError::MissingSecrets(MissingSecretValues::combine(
                missing,
            )));
        }

        let args = ConstructorArgs {
            record: record.clone(),
            positional,
            keyword,
        };
        tracing::debug!(type_identifier = record.type_identifier(), "constructing plugin instance");
        Ok(factory(&args)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Recorded;
    use crate::secrets::SecretRef;

    #[derive(Debug)]
    struct DemoSut {
        record: InitializationRecord,
        model: String,
        api_key: String,
    }

    impl Recorded for DemoSut {
        fn initialization_record(&self) -> &InitializationRecord {
            &self.record
        }
    }

    fn register_demo(registry: &PluginRegistry<DemoSut>) -> std::result::Result<(), RegistryError> {
        registry.register("demo_sut", Capability::Sut, |args: &ConstructorArgs| {
            Ok(DemoSut {
                record: args.record().clone(),
                model: args.arg(0)?,
                api_key: args.kwarg("api_key")?,
            })
        })
    }

    fn demo_record() -> InitializationRecord {
        InitializationRecord::builder("demo_sut")
            .arg("tiny-model")
            .secret_kwarg("api_key", SecretRef::required("demo", "api_key"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = PluginRegistry::new();
        register_demo(&registry).unwrap();
        assert_eq!(
            register_demo(&registry),
            Err(RegistryError::DuplicateType("demo_sut".to_string()))
        );
    }

    #[test]
    fn test_invalid_identifier_rejected() {
        let registry: PluginRegistry<u32> = PluginRegistry::new();
        let result = registry.register("has space", Capability::Test, |_| Ok(1));
        assert!(matches!(result, Err(RegistryError::InvalidIdentifier(_))));
    }

    #[test]
    fn test_make_instance_resolves_secrets() {
        let registry = PluginRegistry::new();
        register_demo(&registry).unwrap();
        let secrets = RawSecrets::new().with("demo", "api_key", "sk-1");

        let record = demo_record();
        let sut = registry.make_instance(&record, &secrets).unwrap();
        assert_eq!(sut.model, "tiny-model");
        assert_eq!(sut.api_key, "sk-1");
        assert_eq!(sut.initialization_record(), &record);

        let rebuilt = registry
            .make_instance(sut.initialization_record(), &secrets)
            .unwrap();
        assert_eq!(rebuilt.initialization_record(), sut.initialization_record());
    }

    #[test]
    fn test_missing_secrets_are_combined() {
        let registry: PluginRegistry<()> = PluginRegistry::new();
        registry.register("two_keys", Capability::Annotator, |_| Ok(())).unwrap();
        let record = InitializationRecord::builder("two_keys")
            .secret_kwarg("a", SecretRef::required("openai", "api_key"))
            .secret_kwarg("b", SecretRef::required("perspective", "api_key"))
            .secret_kwarg("c", SecretRef::optional("extra", "token"))
            .build()
            .unwrap();

        match registry.make_instance(&record, &RawSecrets::new()) {
            Err(NewhelmError::MissingSecrets(missing)) => {
                assert_eq!(missing.descriptions().len(), 2);
            }
            other => panic!("expected missing secrets, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unknown_type() {
        let registry: PluginRegistry<()> = PluginRegistry::new();
        let record = InitializationRecord::bare("nope").unwrap();
        assert!(matches!(
            registry.make_instance(&record, &RawSecrets::new()),
            Err(NewhelmError::Registry(RegistryError::NotFound(_)))
        ));
    }

    #[test]
    fn test_list_init_and_clear() {
        let registry: PluginRegistry<&'static str> = PluginRegistry::new();
        let tests = |r: &PluginRegistry<&'static str>| {
            r.register("bbq", Capability::Test, |_| Ok("bbq"))?;
            r.register("demo_01", Capability::Test, |_| Ok("demo"))
        };
        let annotators = |r: &PluginRegistry<&'static str>| {
            r.register("perspective_api", Capability::Annotator, |_| Ok("perspective"))
        };

        let sources: [&dyn PluginSource<&'static str>; 2] = [&tests, &annotators];
        assert_eq!(registry.init(&sources).unwrap(), 3);
        let listed: Vec<String> = registry
            .list(Some(Capability::Test))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(listed, vec!["bbq", "demo_01"]);
        assert_eq!(registry.capability_of("perspective_api"), Some(Capability::Annotator));

        // init is repeatable because it starts from a clean slate
        let only_tests: [&dyn PluginSource<&'static str>; 1] = [&tests];
        assert_eq!(registry.init(&only_tests).unwrap(), 2);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_bad_argument_shape() {
        let registry = PluginRegistry::new();
        register_demo(&registry).unwrap();
        let record = InitializationRecord::builder("demo_sut")
            .arg(42)
            .kwarg("api_key", "inline")
            .build()
            .unwrap();
        assert!(matches!(
            registry.make_instance(&record, &RawSecrets::new()),
            Err(NewhelmError::Registry(RegistryError::InvalidArgument { .. }))
        ));
    }
}
