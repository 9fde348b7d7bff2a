//! Named molecular configurations known to the engine.

use std::collections::BTreeMap;

use ef_types::{Configuration, RequestError};

#[derive(Debug, Clone)]
pub struct ConfigurationCatalog {
    entries: BTreeMap<String, Configuration>,
}

impl ConfigurationCatalog {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register or replace a configuration. Returns the previous entry, if any.
    pub fn insert(&mut self, configuration: Configuration) -> Option<Configuration> {
        self.entries.insert(configuration.id.clone(), configuration)
    }

    pub fn with(mut self, configuration: Configuration) -> Self {
        self.insert(configuration);
        self
    }

    pub fn get(&self, id: &str) -> Result<&Configuration, RequestError> {
        self.entries
            .get(id)
            .ok_or_else(|| RequestError::UnknownConfiguration {
                configuration_id: id.to_string(),
            })
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ConfigurationCatalog {
    /// Hydrogen and lithium hydride in a minimal basis.
    fn default() -> Self {
        Self::empty()
            .with(
                Configuration::new("H2", "Hydrogen Molecule")
                    .with_geometry("H 0.0 0.0 0.0; H 0.0 0.0 {r}", 0.735)
                    .with_electrons(2),
            )
            .with(
                Configuration::new("LiH", "Lithium Hydride")
                    .with_geometry("Li 0.0 0.0 0.0; H 0.0 0.0 {r}", 1.596)
                    .with_electrons(4),
            )
    }
}
