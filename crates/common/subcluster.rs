//! Declarative subcluster configuration: a named group of vats launched
//! together, with one of them designated as the bootstrap vat.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Process,
    Local,
}

/// Options applied when the worker service materializes the vat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerKind>,
    /// Overrides the service-wide worker command for process workers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatSpec {
    pub bundle_spec: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_options: Option<CreationOptions>,
}

/// `{bootstrap, vats: {name: spec}, services?}`; the bootstrap name must be
/// one of the vat names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubclusterConfig {
    pub bootstrap: String,
    pub vats: BTreeMap<String, VatSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

impl SubclusterConfig {
    /// The bootstrap name must resolve to a configured vat.
    pub fn validate(&self) -> Result<(), String> {
        if self.vats.is_empty() {
            return Err("subcluster config has no vats".to_string());
        }
        if !self.vats.contains_key(&self.bootstrap) {
            return Err(format!(
                "bootstrap vat {:?} is not among the configured vats",
                self.bootstrap
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_spec_shaped_config() {
        let config: SubclusterConfig = serde_json::from_value(json!({
            "bootstrap": "a",
            "vats": {
                "a": {"bundleSpec": "alice.bundle", "parameters": {"n": 1}},
                "b": {"bundleSpec": "bob.bundle",
                      "creationOptions": {"worker": "process"}},
            },
        }))
        .expect("decode");
        assert!(config.validate().is_ok());
        assert_eq!(config.vats["a"].bundle_spec, "alice.bundle");
        assert_eq!(
            config.vats["b"]
                .creation_options
                .as_ref()
                .and_then(|o| o.worker),
            Some(WorkerKind::Process)
        );
    }

    #[test]
    fn rejects_unknown_bootstrap() {
        let config: SubclusterConfig = serde_json::from_value(json!({
            "bootstrap": "missing",
            "vats": {"a": {"bundleSpec": "alice.bundle"}},
        }))
        .expect("decode");
        assert!(config.validate().is_err());
    }
}
