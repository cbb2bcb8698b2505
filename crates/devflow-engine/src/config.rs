//! Engine settings and chain files

use crate::registry::FilterRegistry;
use devflow_core::{
    ConfigError, DevflowError, DevflowResult, FilterChainConfiguration, FilterLink, FilterParameter,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Largest queue a stage may ask for
const MAX_QUEUE_CAPACITY: usize = 1 << 16;

/// Engine-wide tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Capacity of every asynchronous stage's queue
    pub queue_capacity: usize,
    /// Deepest allowed synchronous nesting within one region
    pub max_sync_depth: usize,
    /// Directory scanned for filter plugins at startup
    pub plugin_dir: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 32,
            max_sync_depth: 64,
            plugin_dir: None,
        }
    }
}

impl EngineSettings {
    /// Validate settings ranges
    pub fn validate(&self) -> DevflowResult<()> {
        if self.queue_capacity == 0 {
            return Err(DevflowError::InvalidSettings {
                reason: "queue capacity must be greater than 0".to_string(),
            });
        }
        if self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(DevflowError::InvalidSettings {
                reason: format!("queue capacity must not exceed {}", MAX_QUEUE_CAPACITY),
            });
        }
        if self.max_sync_depth == 0 {
            return Err(DevflowError::InvalidSettings {
                reason: "synchronous nesting depth must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Reject a run of `stages` inline stages that could never pass an event
    ///
    /// Each inline stage of a region nests one level deeper into the region
    /// lock, so a region longer than `max_sync_depth` fails every push.
    pub fn check_sync_region(&self, stages: usize) -> DevflowResult<()> {
        if stages > self.max_sync_depth {
            return Err(DevflowError::InvalidSettings {
                reason: format!(
                    "synchronous region of {} stages exceeds max_sync_depth {}",
                    stages, self.max_sync_depth
                ),
            });
        }
        Ok(())
    }
}

/// One `[[filter]]` entry of a chain file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainFileEntry {
    /// Filter type GUID, or a descriptor name
    pub filter: String,
    #[serde(default)]
    pub parameters: Vec<FilterParameter>,
}

/// TOML chain file: engine settings plus an ordered list of filters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainFile {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default, rename = "filter")]
    pub filters: Vec<ChainFileEntry>,
}

impl ChainFile {
    pub fn from_toml_str(text: &str) -> DevflowResult<Self> {
        toml::from_str(text).map_err(|e| DevflowError::InvalidSettings {
            reason: format!("chain file: {}", e),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> DevflowResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| DevflowError::InvalidSettings {
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> DevflowResult<String> {
        toml::to_string_pretty(self).map_err(|e| DevflowError::InvalidSettings {
            reason: format!("chain file: {}", e),
        })
    }

    /// Resolve filter names against `registry` into a chain configuration
    pub fn to_configuration(&self, registry: &FilterRegistry) -> DevflowResult<FilterChainConfiguration> {
        let mut configuration = FilterChainConfiguration::new();
        for (index, entry) in self.filters.iter().enumerate() {
            let filter_id = match Uuid::parse_str(entry.filter.trim()) {
                Ok(id) => id,
                Err(_) => registry
                    .find_by_name(entry.filter.trim())
                    .map(|descriptor| descriptor.id)
                    .ok_or_else(|| DevflowError::Configuration {
                        link: index,
                        filter: entry.filter.clone(),
                        errors: vec![ConfigError::general(format!(
                            "no filter type named '{}'",
                            entry.filter
                        ))],
                    })?,
            };
            configuration.push(FilterLink {
                filter_id,
                parameters: entry.parameters.clone(),
            });
        }
        Ok(configuration)
    }
}

/// Export a chain configuration to JSON
pub fn configuration_to_json(configuration: &FilterChainConfiguration) -> DevflowResult<String> {
    serde_json::to_string_pretty(configuration).map_err(|e| DevflowError::InvalidSettings {
        reason: format!("failed to serialize chain configuration: {}", e),
    })
}

/// Import a chain configuration from JSON
pub fn configuration_from_json(json: &str) -> DevflowResult<FilterChainConfiguration> {
    serde_json::from_str(json).map_err(|e| DevflowError::InvalidSettings {
        reason: format!("failed to deserialize chain configuration: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{IDENTITY_ID, MASKING_ID};
    use devflow_core::ParameterValue;

    const CHAIN: &str = r#"
[engine]
queue_capacity = 8

[[filter]]
filter = "identity"

[[filter]]
filter = "masking"
parameters = [
    { name = "signal", value = { guid = "6f2a0c6e-7cd3-4a53-9f15-4c1bd2b0a3d1" } },
    { name = "bitmask", value = { wstring = "1101" } },
]

[[filter]]
filter = "c0a19f5e-3b2d-4e71-8a60-1d2c3b4a5e02"
"#;

    #[test]
    fn test_default_settings() {
        let settings = EngineSettings::default();
        assert_eq!(settings.queue_capacity, 32);
        assert_eq!(settings.max_sync_depth, 64);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = EngineSettings::default();
        settings.queue_capacity = 0;
        assert!(settings.validate().is_err());

        settings.queue_capacity = 4;
        settings.max_sync_depth = 0;
        assert!(matches!(
            settings.validate(),
            Err(DevflowError::InvalidSettings { .. })
        ));
    }

    #[test]
    fn test_sync_region_length_bounded_by_depth() {
        let settings = EngineSettings {
            max_sync_depth: 3,
            ..EngineSettings::default()
        };
        assert!(settings.check_sync_region(3).is_ok());
        let error = settings.check_sync_region(4).unwrap_err();
        assert!(matches!(error, DevflowError::InvalidSettings { .. }));
        assert!(error.to_string().contains("4 stages exceeds max_sync_depth 3"));
    }

    #[test]
    fn test_chain_file_resolves_names_and_guids() {
        let file = ChainFile::from_toml_str(CHAIN).unwrap();
        assert_eq!(file.engine.queue_capacity, 8);
        assert_eq!(file.engine.max_sync_depth, 64);

        let registry = FilterRegistry::with_builtin();
        let configuration = file.to_configuration(&registry).unwrap();
        assert_eq!(configuration.len(), 3);
        assert_eq!(configuration.links[0].filter_id, IDENTITY_ID);
        assert_eq!(configuration.links[1].filter_id, MASKING_ID);
        assert_eq!(
            configuration.links[1].get_parameter("bitmask"),
            Some(&ParameterValue::WString("1101".to_string()))
        );
        assert_eq!(configuration.links[2].filter_id, crate::filters::DECOUPLER_ID);
    }

    #[test]
    fn test_unknown_name_is_a_configuration_error() {
        let file = ChainFile::from_toml_str("[[filter]]\nfilter = \"kalman\"\n").unwrap();
        let error = file.to_configuration(&FilterRegistry::with_builtin()).unwrap_err();
        assert!(error.is_configuration());
        assert!(error.to_string().contains("kalman"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let file = ChainFile::from_toml_str(CHAIN).unwrap();
        let text = file.to_toml_string().unwrap();
        assert_eq!(ChainFile::from_toml_str(&text).unwrap(), file);
    }

    #[test]
    fn test_json_export_import() {
        let file = ChainFile::from_toml_str(CHAIN).unwrap();
        let configuration = file.to_configuration(&FilterRegistry::with_builtin()).unwrap();

        let json = configuration_to_json(&configuration).unwrap();
        assert!(json.contains("bitmask"));
        assert_eq!(configuration_from_json(&json).unwrap(), configuration);
        assert!(configuration_from_json("{ not json").is_err());
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.toml");
        std::fs::write(&path, CHAIN).unwrap();
        assert_eq!(ChainFile::load(&path).unwrap().filters.len(), 3);
        assert!(ChainFile::load(dir.path().join("missing.toml")).is_err());
    }
}
