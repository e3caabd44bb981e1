//! Layered configuration: defaults merged under runtime overrides.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One flat configuration dictionary.
pub type ConfigMap = Map<String, Value>;

/// All configuration, keyed by config key.
pub type ConfigDb = HashMap<String, ConfigMap>;

/// The two layers for one config key. Effective config is a shallow
/// merge with overrides winning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub defaults: ConfigMap,
    pub overrides: ConfigMap,
}

impl ConfigEntry {
    /// Shallow merge, overrides winning per field.
    pub fn merged(&self) -> ConfigMap {
        let mut result = self.defaults.clone();
        shallow_merge(&mut result, &self.overrides);
        result
    }
}

/// Copy `layer` over `base`, last write wins per top-level field.
pub fn shallow_merge(base: &mut ConfigMap, layer: &ConfigMap) {
    for (field, value) in layer {
        base.insert(field.clone(), value.clone());
    }
}
