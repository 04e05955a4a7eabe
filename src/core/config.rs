//! Gateway configuration
//!
//! A single TOML file holds generation defaults, per-provider model
//! policies, credential overrides for built-in providers, and user-added
//! custom providers. Loads fall back to defaults when the file is absent;
//! saves are atomic (write to a temp file, then persist into place).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::core::error::GatewayError;
use crate::core::provider::Provider;
use crate::core::selection::ModelPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationDefaults {
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f64 {
    0.7
}

fn default_top_p() -> f64 {
    1.0
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        GenerationDefaults {
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Effective generation parameters for one request: per-request overrides
/// on top of configured defaults, validated before dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
}

impl GenerationDefaults {
    pub fn materialize(
        &self,
        temperature: Option<f64>,
        top_p: Option<f64>,
        max_tokens: Option<u32>,
        presence_penalty: Option<f64>,
        frequency_penalty: Option<f64>,
    ) -> Result<GenerationParams, GatewayError> {
        let params = GenerationParams {
            temperature: temperature.unwrap_or(self.temperature),
            top_p: top_p.unwrap_or(self.top_p),
            max_tokens: max_tokens.unwrap_or(self.max_tokens),
            presence_penalty: presence_penalty.unwrap_or(0.0),
            frequency_penalty: frequency_penalty.unwrap_or(0.0),
        };

        if !(0.0..=2.0).contains(&params.temperature) {
            return Err(GatewayError::invalid_spec(format!(
                "temperature {} out of range 0.0..=2.0",
                params.temperature
            )));
        }
        if !(0.0..=1.0).contains(&params.top_p) {
            return Err(GatewayError::invalid_spec(format!(
                "top_p {} out of range 0.0..=1.0",
                params.top_p
            )));
        }
        if params.max_tokens == 0 {
            return Err(GatewayError::invalid_spec("max_tokens must be at least 1"));
        }
        for (name, value) in [
            ("presence_penalty", params.presence_penalty),
            ("frequency_penalty", params.frequency_penalty),
        ] {
            if !(-2.0..=2.0).contains(&value) {
                return Err(GatewayError::invalid_spec(format!(
                    "{name} {value} out of range -2.0..=2.0"
                )));
            }
        }

        Ok(params)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    pub default_provider: Option<String>,
    /// Conversation database location; defaults to the platform data dir.
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub defaults: GenerationDefaults,
    /// Per-provider model selection policies, keyed by provider name.
    #[serde(default)]
    pub policies: HashMap<String, ModelPolicy>,
    /// Credential overrides for built-in providers, keyed by provider name.
    /// Values may be `${VAR}` environment references.
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
    #[serde(default)]
    pub custom_providers: Vec<Provider>,
}

/// Errors that can occur when loading configuration from disk.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "Failed to read config at {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(
                    f,
                    "Failed to parse config at {}: {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl GatewayConfig {
    pub fn load_from_path(config_path: &Path) -> Result<GatewayConfig, ConfigError> {
        if config_path.exists() {
            let contents =
                fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
                    path: config_path.to_path_buf(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: config_path.to_path_buf(),
                source,
            })
        } else {
            Ok(GatewayConfig::default())
        }
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<(), Box<dyn StdError>> {
        let parent = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty());

        if let Some(dir) = parent {
            fs::create_dir_all(dir)?;
        }

        let contents = toml::to_string_pretty(self)?;
        let mut temp_file = match parent {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };

        temp_file.write_all(contents.as_bytes())?;
        temp_file.as_file_mut().sync_all()?;
        temp_file
            .persist(config_path)
            .map_err(|err| -> Box<dyn StdError> { Box::new(err) })?;
        Ok(())
    }

    pub fn default_config_path() -> PathBuf {
        let proj_dirs = directories::ProjectDirs::from("org", "permacommons", "passerelle")
            .expect("Failed to determine config directory");
        proj_dirs.config_dir().join("config.toml")
    }

    pub fn default_database_path() -> PathBuf {
        let proj_dirs = directories::ProjectDirs::from("org", "permacommons", "passerelle")
            .expect("Failed to determine data directory");
        proj_dirs.data_dir().join("conversations.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::load_from_path(&dir.path().join("config.toml")).unwrap();
        assert!(config.default_provider.is_none());
        assert_eq!(config.defaults.temperature, 0.7);
        assert_eq!(config.defaults.max_tokens, 4096);
        assert!(config.custom_providers.is_empty());
    }

    #[test]
    fn round_trips_policies_and_custom_providers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = GatewayConfig {
            default_provider: Some("openrouter".into()),
            ..GatewayConfig::default()
        };
        config.policies.insert(
            "openrouter".into(),
            ModelPolicy {
                free_only: true,
                auto_choose: false,
            },
        );
        config.api_keys.insert(
            "openrouter".into(),
            "${OPENROUTER_API_KEY}".into(),
        );
        config.custom_providers.push(Provider {
            name: "local".into(),
            display_name: "Local".into(),
            base_url: "http://localhost:8080/v1".into(),
            api_key: String::new(),
            default_model: "llama".into(),
            models: Vec::new(),
            mode: None,
            supports_vision: false,
            system_prompt_style: None,
            lists_models: true,
            free_model_suffix: None,
            auto_model: None,
            builtin: false,
        });

        config.save_to_path(&path).unwrap();
        let loaded = GatewayConfig::load_from_path(&path).unwrap();

        assert_eq!(loaded.default_provider.as_deref(), Some("openrouter"));
        assert!(loaded.policies["openrouter"].free_only);
        assert_eq!(loaded.api_keys["openrouter"], "${OPENROUTER_API_KEY}");
        assert_eq!(loaded.custom_providers.len(), 1);
        assert_eq!(loaded.custom_providers[0].name, "local");
        assert!(!loaded.custom_providers[0].builtin);
    }

    #[test]
    fn parse_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "default_provider = [not toml").unwrap();

        let err = GatewayConfig::load_from_path(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn materialize_applies_overrides_and_validates() {
        let defaults = GenerationDefaults::default();

        let params = defaults
            .materialize(Some(1.2), None, Some(64), None, Some(0.5))
            .unwrap();
        assert_eq!(params.temperature, 1.2);
        assert_eq!(params.top_p, 1.0);
        assert_eq!(params.max_tokens, 64);
        assert_eq!(params.frequency_penalty, 0.5);

        assert!(defaults
            .materialize(Some(3.0), None, None, None, None)
            .is_err());
        assert!(defaults
            .materialize(None, Some(1.5), None, None, None)
            .is_err());
        assert!(defaults
            .materialize(None, None, Some(0), None, None)
            .is_err());
        assert!(defaults
            .materialize(None, None, None, Some(-3.0), None)
            .is_err());
    }
}
