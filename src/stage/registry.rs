//! Registry of stage backends.
//!
//! Stages are persisted as a backend name plus its settings; the registry
//! turns that pair back into a live backend on load, and builds the
//! backends a configuration asks for.

use super::indexer::IndexerBackend;
use super::integrater::IntegraterBackend;
use super::refiner::RefinerBackend;
use super::scaler::ScalerBackend;
use super::traits::StageKind;
use crate::backend;
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A live backend of any kind.
#[derive(Debug, Clone)]
pub enum Backend {
    Indexer(Arc<dyn IndexerBackend>),
    Refiner(Arc<dyn RefinerBackend>),
    Integrater(Arc<dyn IntegraterBackend>),
    Scaler(Arc<dyn ScalerBackend>),
}

impl Backend {
    /// The stage kind this backend drives.
    pub fn kind(&self) -> StageKind {
        match self {
            Backend::Indexer(_) => StageKind::Indexer,
            Backend::Refiner(_) => StageKind::Refiner,
            Backend::Integrater(_) => StageKind::Integrater,
            Backend::Scaler(_) => StageKind::Scaler,
        }
    }

    /// Name the backend is registered and persisted under.
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Indexer(b) => b.name(),
            Backend::Refiner(b) => b.name(),
            Backend::Integrater(b) => b.name(),
            Backend::Scaler(b) => b.name(),
        }
    }
}

/// Builds a backend from its persisted settings.
pub type BackendConstructor = fn(&Value) -> Result<Backend>;

/// Registry of available backends, keyed by stage kind and name.
pub struct BackendRegistry {
    constructors: HashMap<(StageKind, String), BackendConstructor>,
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Create a registry with the XDS, DIALS and CCP4 backends.
    pub fn new_with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(StageKind::Indexer, "xds", backend::xds::indexer_from_settings);
        registry.register(StageKind::Indexer, "dials", backend::dials::indexer_from_settings);
        registry.register(StageKind::Refiner, "xds", backend::xds::refiner_from_settings);
        registry.register(StageKind::Refiner, "dials", backend::dials::refiner_from_settings);
        registry.register(StageKind::Integrater, "xds", backend::xds::integrater_from_settings);
        registry.register(StageKind::Integrater, "dials", backend::dials::integrater_from_settings);
        registry.register(StageKind::Scaler, "ccp4a", backend::ccp4::scaler_from_settings);
        registry.register(StageKind::Scaler, "xdsa", backend::xscale::scaler_from_settings);
        registry.register(StageKind::Scaler, "dials", backend::dials_scale::scaler_from_settings);
        registry
    }

    /// Register `constructor` as the backend `name` of `kind`, replacing
    /// any earlier registration.
    pub fn register(&mut self, kind: StageKind, name: &str, constructor: BackendConstructor) {
        self.constructors.insert((kind, name.to_string()), constructor);
    }

    /// Whether a backend `name` of `kind` is registered.
    pub fn contains(&self, kind: StageKind, name: &str) -> bool {
        self.constructors.contains_key(&(kind, name.to_string()))
    }

    /// Registered backend names for `kind`, sorted.
    pub fn names(&self, kind: StageKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .constructors
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Unregister a backend, returning its constructor.
    pub fn remove(&mut self, kind: StageKind, name: &str) -> Option<BackendConstructor> {
        self.constructors.remove(&(kind, name.to_string()))
    }

    /// Build the backend `name` of `kind` from `settings`.
    pub fn build(&self, kind: StageKind, name: &str, settings: &Value) -> Result<Backend> {
        let constructor = self
            .constructors
            .get(&(kind, name.to_string()))
            .ok_or_else(|| Error::Config(format!("no {kind} backend named {name}")))?;
        let backend = constructor(settings)?;
        if backend.kind() != kind {
            return Err(Error::Config(format!(
                "backend {name} registered as {kind} builds a {}",
                backend.kind()
            )));
        }
        Ok(backend)
    }

    /// Build the indexer backend `name`; errors if it is not an indexer.
    pub fn indexer(&self, name: &str, settings: &Value) -> Result<Arc<dyn IndexerBackend>> {
        match self.build(StageKind::Indexer, name, settings)? {
            Backend::Indexer(backend) => Ok(backend),
            other => Err(Error::Config(format!("{} is not an indexer", other.name()))),
        }
    }

    /// Build the refiner backend `name`.
    pub fn refiner(&self, name: &str, settings: &Value) -> Result<Arc<dyn RefinerBackend>> {
        match self.build(StageKind::Refiner, name, settings)? {
            Backend::Refiner(backend) => Ok(backend),
            other => Err(Error::Config(format!("{} is not a refiner", other.name()))),
        }
    }

    /// Build the integrater backend `name`.
    pub fn integrater(&self, name: &str, settings: &Value) -> Result<Arc<dyn IntegraterBackend>> {
        match self.build(StageKind::Integrater, name, settings)? {
            Backend::Integrater(backend) => Ok(backend),
            other => Err(Error::Config(format!("{} is not an integrater", other.name()))),
        }
    }

    /// Build the scaler backend `name`.
    pub fn scaler(&self, name: &str, settings: &Value) -> Result<Arc<dyn ScalerBackend>> {
        match self.build(StageKind::Scaler, name, settings)? {
            Backend::Scaler(backend) => Ok(backend),
            other => Err(Error::Config(format!("{} is not a scaler", other.name()))),
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_defaults() {
        let registry = BackendRegistry::new_with_defaults();

        assert!(registry.contains(StageKind::Indexer, "xds"));
        assert!(registry.contains(StageKind::Indexer, "dials"));
        assert!(registry.contains(StageKind::Scaler, "ccp4a"));
        assert!(!registry.contains(StageKind::Scaler, "xds"));
        assert_eq!(registry.names(StageKind::Refiner), ["dials", "xds"]);
        assert_eq!(registry.names(StageKind::Scaler), ["ccp4a", "dials", "xdsa"]);
    }

    #[test]
    fn test_registry_build() {
        let registry = BackendRegistry::new_with_defaults();

        let indexer = registry
            .indexer("xds", &serde_json::json!({ "all_images": true }))
            .unwrap();
        assert_eq!(indexer.name(), "xds");
        assert_eq!(indexer.settings()["all_images"], true);

        let err = registry.build(StageKind::Indexer, "mosflm", &Value::Null).unwrap_err();
        assert_eq!(err.to_string(), "configuration error: no indexer backend named mosflm");
    }

    #[test]
    fn test_registry_remove() {
        let mut registry = BackendRegistry::new_with_defaults();
        assert!(registry.remove(StageKind::Indexer, "dials").is_some());
        assert!(!registry.contains(StageKind::Indexer, "dials"));
        assert!(registry.scaler("ccp4a", &Value::Null).is_ok());
    }

    #[test]
    fn test_scaler_settings_round_trip() {
        let registry = BackendRegistry::new_with_defaults();
        for name in ["ccp4a", "xdsa", "dials"] {
            let scaler = registry.scaler(name, &Value::Null).unwrap();
            assert_eq!(scaler.name(), name);
            let rebuilt = registry.scaler(name, &scaler.settings()).unwrap();
            assert_eq!(rebuilt.settings(), scaler.settings());
        }

        let xscale = registry
            .scaler("xdsa", &serde_json::json!({ "executable": "xscale" }))
            .unwrap();
        assert_eq!(xscale.settings()["executable"], "xscale");
        assert_eq!(xscale.settings()["bins"], 20);
    }
}
