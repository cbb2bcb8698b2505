//! Declarative filter chain configuration

use crate::error::{DevflowError, DevflowResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Typed parameter value of a filter configuration link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterValue {
    Double(f64),
    Int64(i64),
    Bool(bool),
    Guid(Uuid),
    #[serde(rename = "wstring")]
    WString(String),
    DoubleArray(Vec<f64>),
    GuidArray(Vec<Uuid>),
}

impl ParameterValue {
    /// Name of the value type, for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            ParameterValue::Double(_) => "double",
            ParameterValue::Int64(_) => "int64",
            ParameterValue::Bool(_) => "bool",
            ParameterValue::Guid(_) => "guid",
            ParameterValue::WString(_) => "wstring",
            ParameterValue::DoubleArray(_) => "double array",
            ParameterValue::GuidArray(_) => "guid array",
        }
    }

    /// Convert to f64 if possible
    pub fn as_double(&self) -> Option<f64> {
        match self {
            ParameterValue::Double(v) => Some(*v),
            ParameterValue::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Convert to i64 if possible
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParameterValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Convert to bool if possible
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// GUIDs may also be written as strings in persisted configurations
    pub fn as_guid(&self) -> Option<Uuid> {
        match self {
            ParameterValue::Guid(v) => Some(*v),
            ParameterValue::WString(s) => Uuid::parse_str(s.trim()).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::WString(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Double(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int64(value)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<Uuid> for ParameterValue {
    fn from(value: Uuid) -> Self {
        ParameterValue::Guid(value)
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::WString(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::WString(value.to_string())
    }
}

impl From<Vec<f64>> for ParameterValue {
    fn from(value: Vec<f64>) -> Self {
        ParameterValue::DoubleArray(value)
    }
}

impl From<Vec<Uuid>> for ParameterValue {
    fn from(value: Vec<Uuid>) -> Self {
        ParameterValue::GuidArray(value)
    }
}

/// A single named parameter entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterParameter {
    pub name: String,
    pub value: ParameterValue,
}

/// One validation problem found while configuring a filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigError {
    /// Offending parameter, if the problem is tied to one
    pub parameter: Option<String>,
    pub message: String,
}

impl ConfigError {
    pub fn missing(parameter: &str) -> Self {
        Self {
            parameter: Some(parameter.to_string()),
            message: "required parameter is missing".to_string(),
        }
    }

    pub fn wrong_type(parameter: &str, expected: &str, found: &str) -> Self {
        Self {
            parameter: Some(parameter.to_string()),
            message: format!("expected {}, found {}", expected, found),
        }
    }

    pub fn invalid(parameter: &str, message: impl Into<String>) -> Self {
        Self {
            parameter: Some(parameter.to_string()),
            message: message.into(),
        }
    }

    /// Problem not tied to one parameter
    pub fn general(message: impl Into<String>) -> Self {
        Self {
            parameter: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parameter {
            Some(name) => write!(f, "'{}': {}", name, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Declarative description of one pipeline stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterLink {
    /// Filter type to instantiate
    pub filter_id: Uuid,
    /// Ordered parameters
    #[serde(default)]
    pub parameters: Vec<FilterParameter>,
}

impl FilterLink {
    pub fn new(filter_id: Uuid) -> Self {
        Self {
            filter_id,
            parameters: Vec::new(),
        }
    }

    /// Builder style parameter append
    pub fn with(mut self, name: &str, value: impl Into<ParameterValue>) -> Self {
        self.set_parameter(name, value.into());
        self
    }

    /// Set a parameter, replacing an existing entry in place
    pub fn set_parameter(&mut self, name: &str, value: ParameterValue) {
        if let Some(existing) = self.parameters.iter_mut().find(|p| p.name == name) {
            existing.value = value;
        } else {
            self.parameters.push(FilterParameter {
                name: name.to_string(),
                value,
            });
        }
    }

    /// Get a parameter value
    pub fn get_parameter(&self, name: &str) -> Option<&ParameterValue> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }

    /// Get double parameter with default
    pub fn get_double(&self, name: &str, default: f64) -> f64 {
        self.get_parameter(name)
            .and_then(ParameterValue::as_double)
            .unwrap_or(default)
    }

    /// Get integer parameter with default
    pub fn get_int(&self, name: &str, default: i64) -> i64 {
        self.get_parameter(name)
            .and_then(ParameterValue::as_int)
            .unwrap_or(default)
    }

    /// Get boolean parameter with default
    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        self.get_parameter(name)
            .and_then(ParameterValue::as_bool)
            .unwrap_or(default)
    }

    /// Required GUID parameter
    pub fn require_guid(&self, name: &str) -> Result<Uuid, ConfigError> {
        let value = self.get_parameter(name).ok_or_else(|| ConfigError::missing(name))?;
        value
            .as_guid()
            .ok_or_else(|| ConfigError::wrong_type(name, "guid", value.type_name()))
    }

    /// Optional GUID parameter, `Ok(None)` when absent
    pub fn optional_guid(&self, name: &str) -> Result<Option<Uuid>, ConfigError> {
        match self.get_parameter(name) {
            None => Ok(None),
            Some(value) => value
                .as_guid()
                .map(Some)
                .ok_or_else(|| ConfigError::wrong_type(name, "guid", value.type_name())),
        }
    }

    /// Required string parameter
    pub fn require_str(&self, name: &str) -> Result<&str, ConfigError> {
        let value = self.get_parameter(name).ok_or_else(|| ConfigError::missing(name))?;
        value
            .as_str()
            .ok_or_else(|| ConfigError::wrong_type(name, "wstring", value.type_name()))
    }

    /// Required double parameter
    pub fn require_double(&self, name: &str) -> Result<f64, ConfigError> {
        let value = self.get_parameter(name).ok_or_else(|| ConfigError::missing(name))?;
        value
            .as_double()
            .ok_or_else(|| ConfigError::wrong_type(name, "double", value.type_name()))
    }
}

/// Ordered sequence of links, index 0 is the source side
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterChainConfiguration {
    pub links: Vec<FilterLink>,
}

impl FilterChainConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, link: FilterLink) -> &mut Self {
        self.links.push(link);
        self
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Clone the configuration with one parameter entry overwritten
    ///
    /// Used by parameter-search collaborators that evaluate many variants of
    /// one chain. The receiver is left untouched.
    pub fn with_parameter(
        &self,
        link_index: usize,
        name: &str,
        value: ParameterValue,
    ) -> DevflowResult<Self> {
        let mut variant = self.clone();
        let link = variant.links.get_mut(link_index).ok_or_else(|| {
            DevflowError::Configuration {
                link: link_index,
                filter: "<none>".to_string(),
                errors: vec![ConfigError::general(format!(
                    "chain has only {} links",
                    self.links.len()
                ))],
            }
        })?;
        link.set_parameter(name, value);
        Ok(variant)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPPING: Uuid = Uuid::from_u128(0xA1);

    #[test]
    fn test_link_parameters() {
        let link = FilterLink::new(MAPPING)
            .with("gain", 2.5)
            .with("window", 12i64)
            .with("enabled", true)
            .with("target", "6f2a0c6e-7cd3-4a53-9f15-4c1bd2b0a3d1");

        assert_eq!(link.get_double("gain", 0.0), 2.5);
        assert_eq!(link.get_int("window", 0), 12);
        assert!(link.get_bool("enabled", false));
        assert_eq!(link.get_double("missing", 1.0), 1.0);
        assert!(link.require_guid("target").is_ok());
    }

    #[test]
    fn test_required_parameter_errors_name_the_parameter() {
        let link = FilterLink::new(MAPPING).with("target", 3i64);

        let missing = link.require_str("name").unwrap_err();
        assert_eq!(missing.parameter.as_deref(), Some("name"));

        let mistyped = link.require_guid("target").unwrap_err();
        assert!(mistyped.to_string().contains("expected guid, found int64"));
    }

    #[test]
    fn test_set_parameter_keeps_order() {
        let mut link = FilterLink::new(MAPPING).with("a", 1.0).with("b", 2.0);
        link.set_parameter("a", ParameterValue::Double(3.0));
        let names: Vec<_> = link.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(link.get_double("a", 0.0), 3.0);
    }

    #[test]
    fn test_with_parameter_leaves_original_untouched() {
        let mut chain = FilterChainConfiguration::new();
        chain.push(FilterLink::new(MAPPING).with("gain", 1.0));

        let variant = chain.with_parameter(0, "gain", 4.0.into()).unwrap();
        assert_eq!(chain.links[0].get_double("gain", 0.0), 1.0);
        assert_eq!(variant.links[0].get_double("gain", 0.0), 4.0);

        assert!(chain.with_parameter(3, "gain", 4.0.into()).is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut chain = FilterChainConfiguration::new();
        chain.push(
            FilterLink::new(MAPPING)
                .with("factors", vec![1.0, 2.0])
                .with("signals", vec![Uuid::from_u128(1), Uuid::from_u128(2)]),
        );
        let json = serde_json::to_string(&chain).unwrap();
        let parsed: FilterChainConfiguration = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, chain);
    }
}
