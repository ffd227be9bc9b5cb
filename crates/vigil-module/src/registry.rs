//! Module implementations known to a daemon, and their resolution.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use vigil_core::config::ModuleDescriptor;
use vigil_core::error::{Result, VigilError};

use crate::module::{Module, ModuleProperties};
use crate::unit::ModuleUnit;

/// Creates a module instance from its descriptor.
pub type InstanceFactory =
    Arc<dyn Fn(&ModuleDescriptor) -> anyhow::Result<Box<dyn Module>> + Send + Sync>;

/// A registered implementation.
///
/// Both fields are mandatory for resolution to succeed; they are optional
/// here so that a broken registration is reported as a load error instead
/// of being impossible to express.
#[derive(Clone, Default)]
pub struct ModuleImplementation {
    /// Raw properties record, parsed into [`ModuleProperties`]
    pub properties: Option<serde_json::Value>,
    pub factory: Option<InstanceFactory>,
}

impl ModuleImplementation {
    pub fn new<F>(properties: ModuleProperties, factory: F) -> Self
    where
        F: Fn(&ModuleDescriptor) -> anyhow::Result<Box<dyn Module>> + Send + Sync + 'static,
    {
        Self {
            properties: Some(properties.to_value()),
            factory: Some(Arc::new(factory)),
        }
    }
}

impl fmt::Debug for ModuleImplementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleImplementation")
            .field("properties", &self.properties)
            .field("factory", &self.factory.is_some())
            .finish()
    }
}

/// A descriptor paired with the implementation it resolved to.
#[derive(Clone)]
pub struct ResolvedModule {
    pub descriptor: ModuleDescriptor,
    pub properties: ModuleProperties,
    factory: InstanceFactory,
}

impl ResolvedModule {
    /// Build the module object only.
    pub fn create_module(&self) -> anyhow::Result<Box<dyn Module>> {
        (self.factory)(&self.descriptor)
    }

    /// Build a unit around a new module object.
    pub fn instantiate(&self) -> anyhow::Result<ModuleUnit> {
        let module = self.create_module()?;
        Ok(ModuleUnit::new(
            self.descriptor.clone(),
            self.properties.clone(),
            module,
        ))
    }
}

impl fmt::Debug for ResolvedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedModule")
            .field("descriptor", &self.descriptor.name)
            .field("properties", &self.properties)
            .finish()
    }
}

/// Implementations by name.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    implementations: BTreeMap<String, ModuleImplementation>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an implementation.
    pub fn register(&mut self, name: impl Into<String>, implementation: ModuleImplementation) {
        self.implementations.insert(name.into(), implementation);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.implementations.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.implementations.keys().map(String::as_str)
    }

    /// Resolve the implementation named by `descriptor`.
    pub fn resolve(&self, descriptor: &ModuleDescriptor) -> Result<ResolvedModule> {
        let implementation = self
            .implementations
            .get(&descriptor.implementation)
            .ok_or_else(|| VigilError::ModuleResolution {
                module: descriptor.name.clone(),
                implementation: descriptor.implementation.clone(),
            })?;

        let capability_error = |message: String| VigilError::ModuleCapability {
            module: descriptor.name.clone(),
            implementation: descriptor.implementation.clone(),
            message,
        };

        let raw = implementation
            .properties
            .as_ref()
            .ok_or_else(|| capability_error("has no properties".into()))?;
        let factory = implementation
            .factory
            .clone()
            .ok_or_else(|| capability_error("has no instance factory".into()))?;
        let properties = serde_json::from_value::<ModuleProperties>(raw.clone())
            .map_err(|e| capability_error(format!("has invalid properties: {e}")))?;

        Ok(ResolvedModule {
            descriptor: descriptor.clone(),
            properties,
            factory,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Phase;

    struct Noop;
    impl Module for Noop {}

    fn noop_factory(_: &ModuleDescriptor) -> anyhow::Result<Box<dyn Module>> {
        Ok(Box::new(Noop))
    }

    fn registry() -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        registry.register(
            "noop",
            ModuleImplementation::new(ModuleProperties::external("noop", &[Phase::Running]), noop_factory),
        );
        registry
    }

    #[test]
    fn test_resolve_valid_implementation() {
        let resolved = registry().resolve(&ModuleDescriptor::new("n1", "noop")).unwrap();
        assert_eq!(resolved.descriptor.name, "n1");
        assert!(resolved.properties.external);
        assert!(resolved.properties.has_phase(Phase::Running));

        let unit = resolved.instantiate().unwrap();
        assert_eq!(unit.name(), "n1");
    }

    #[test]
    fn test_resolve_unknown_implementation() {
        let err = registry().resolve(&ModuleDescriptor::new("n1", "missing")).unwrap_err();
        assert!(matches!(err, VigilError::ModuleResolution { .. }));
        assert!(err.is_module_error());
    }

    #[test]
    fn test_missing_capabilities_are_errors() {
        let mut registry = registry();
        registry.register(
            "no-factory",
            ModuleImplementation {
                properties: Some(serde_json::json!({"type": "x"})),
                factory: None,
            },
        );
        registry.register(
            "no-properties",
            ModuleImplementation {
                properties: None,
                factory: Some(Arc::new(noop_factory)),
            },
        );
        registry.register(
            "bad-properties",
            ModuleImplementation {
                properties: Some(serde_json::json!({"external": "sometimes"})),
                factory: Some(Arc::new(noop_factory)),
            },
        );

        for implementation in ["no-factory", "no-properties", "bad-properties"] {
            let err = registry
                .resolve(&ModuleDescriptor::new("m", implementation))
                .unwrap_err();
            assert!(
                matches!(err, VigilError::ModuleCapability { .. }),
                "{implementation}: {err}"
            );
        }
    }

    #[test]
    fn test_registry_names_sorted() {
        let mut registry = registry();
        registry.register("alpha", ModuleImplementation::default());
        let names: Vec<&str> = registry.names().collect();
        assert_eq!(names, vec!["alpha", "noop"]);
        assert!(registry.contains("alpha"));
    }
}
