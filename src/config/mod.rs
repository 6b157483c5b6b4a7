use std::{collections::HashMap, fs};

use log::{debug, trace};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::{Validate, ValidationError};

use crate::core::error::{DeployError, DeployResult};

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
pub struct Config {
    #[serde(default)]
    pub log: Option<Log>,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub units: Vec<UnitConfig>,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> DeployResult<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).map_err(|e| {
            DeployError::Configuration(format!("Unable to read conf file from {path}: {e}"))
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn from_yaml(conf_str: &str) -> DeployResult<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str)
            .map_err(|e| DeployError::Configuration(format!("Unable to parse yaml conf: {e}")))?;

        trace!("Loaded conf: {conf:?}");

        // use validator to validate conf file
        conf.validate()
            .map_err(|e| DeployError::Configuration(format!("Conf file validation failed: {e}")))?;

        Ok(conf)
    }

    #[allow(dead_code)]
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub path: String,
}

/// One deployment unit: an artifact bundle with nested subunits.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "UnitConfig::validate_component_names"))]
pub struct UnitConfig {
    #[validate(length(min = 1))]
    pub name: String,

    /// External provider marker; stored on the root unit of the tree.
    pub provider: Option<String>,

    #[serde(default)]
    #[validate(nested)]
    pub components: Vec<ComponentConfig>,

    #[serde(default)]
    #[validate(nested)]
    pub subunits: Vec<UnitConfig>,
}

impl UnitConfig {
    fn validate_component_names(&self) -> Result<(), ValidationError> {
        let mut seen = std::collections::HashSet::new();
        for component in &self.components {
            if !seen.insert(component.name.as_str()) {
                let mut err = ValidationError::new("duplicate_component_name");
                err.add_param("name".into(), &component.name);
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Declarative component configuration: target handler, lifecycle hooks,
/// and ordered method-interceptor bindings.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct ComponentConfig {
    #[validate(length(min = 1))]
    pub name: String,

    /// Handler id of the component target.
    #[validate(length(min = 1))]
    pub target: String,

    #[serde(default)]
    pub post_construct: Vec<String>,
    #[serde(default)]
    pub pre_destroy: Vec<String>,

    #[serde(default)]
    pub instantiation: InstantiationPolicy,
    #[serde(default = "ComponentConfig::default_pool_size")]
    pub pool_size: usize,

    #[serde(default)]
    #[validate(nested)]
    pub interceptors: Vec<InterceptorBinding>,

    /// Extra services the component's own service depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl ComponentConfig {
    fn default_pool_size() -> usize {
        8
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstantiationPolicy {
    /// A fresh instance per `get_instance` call
    #[default]
    PerInvocation,
    /// Returned instances are kept for reuse, up to `pool_size`
    Pooled,
}

/// One AROUND-INVOKE interceptor binding.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "InterceptorBinding::validate_filter"))]
pub struct InterceptorBinding {
    /// Handler id of the interceptor.
    #[validate(length(min = 1))]
    pub interceptor: String,

    /// Interceptor method to run.
    #[validate(length(min = 1))]
    pub method: String,

    /// Which target methods the binding applies to.
    #[serde(default)]
    pub filter: MethodSelector,

    /// Resource injections applied to the interceptor instance.
    #[serde(default)]
    pub injections: HashMap<String, JsonValue>,
}

impl InterceptorBinding {
    fn validate_filter(&self) -> Result<(), ValidationError> {
        if let MethodSelector::Pattern(pattern) = &self.filter {
            if Regex::new(pattern).is_err() {
                let mut err = ValidationError::new("invalid_method_filter");
                err.add_param("pattern".into(), pattern);
                return Err(err);
            }
        }
        Ok(())
    }
}

/// A method filter: an explicit method list or a regex over method names.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MethodSelector {
    Methods(Vec<String>),
    Pattern(String),
}

impl Default for MethodSelector {
    fn default() -> Self {
        MethodSelector::Pattern(".*".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_load_manifest() {
        init_log();
        let conf_str = r#"
---
log:
  path: /tmp/stagehand.log

units:
  - name: shop.app
    provider: hibernate
    components:
      - name: cart
        target: echo
        post_construct: [init]
        pre_destroy: [shutdown]
        instantiation: pooled
        interceptors:
          - interceptor: audit
            method: log
            filter: "get_.*"
            injections:
              tag: checkout
    subunits:
      - name: catalog.war
        components:
          - name: listing
            target: echo
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        assert_eq!(1, conf.units.len());
        let unit = &conf.units[0];
        assert_eq!("shop.app", unit.name);
        assert_eq!(Some("hibernate".to_string()), unit.provider);
        assert_eq!(1, unit.components.len());
        assert_eq!(1, unit.subunits.len());
        let cart = &unit.components[0];
        assert_eq!(InstantiationPolicy::Pooled, cart.instantiation);
        assert_eq!(8, cart.pool_size);
        assert_eq!(1, cart.interceptors.len());
        assert!(matches!(
            cart.interceptors[0].filter,
            MethodSelector::Pattern(_)
        ));
        print!("{}", conf.to_yaml());
    }

    #[test]
    fn test_method_list_filter() {
        init_log();
        let conf_str = r#"
---
units:
  - name: shop.app
    components:
      - name: cart
        target: echo
        interceptors:
          - interceptor: audit
            method: log
            filter: [checkout, pay]
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        let binding = &conf.units[0].components[0].interceptors[0];
        match &binding.filter {
            MethodSelector::Methods(methods) => assert_eq!(methods.len(), 2),
            other => panic!("expected method list, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_units_length() {
        init_log();
        let conf_str = r#"
---
units: []
        "#;
        let conf = Config::from_yaml(conf_str);
        assert!(conf.is_err(), "empty manifest must be rejected");
    }

    #[test]
    fn test_valid_component_target() {
        init_log();
        let conf_str = r#"
---
units:
  - name: shop.app
    components:
      - name: cart
        target: ""
        "#;
        let conf = Config::from_yaml(conf_str);
        assert!(conf.is_err(), "blank target must be rejected");
    }

    #[test]
    fn test_valid_filter_pattern() {
        init_log();
        let conf_str = r#"
---
units:
  - name: shop.app
    components:
      - name: cart
        target: echo
        interceptors:
          - interceptor: audit
            method: log
            filter: "("
        "#;
        let conf = Config::from_yaml(conf_str);
        assert!(conf.is_err(), "broken regex must be rejected");
    }

    #[test]
    fn test_valid_duplicate_component_names() {
        init_log();
        let conf_str = r#"
---
units:
  - name: shop.app
    components:
      - name: cart
        target: echo
      - name: cart
        target: echo
        "#;
        let conf = Config::from_yaml(conf_str);
        assert!(conf.is_err(), "duplicate component names must be rejected");
    }
}
