//! Provider registry
//!
//! Owns the set of configured backends: built-ins from the embedded table
//! plus user-added providers from config. The list is read-mostly — every
//! session snapshots the provider record it needs at start time, so CRUD
//! never disturbs a stream already in flight.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Instant;

use crate::api::models::fetch_models;
use crate::core::config::GatewayConfig;
use crate::core::constants::CONNECTIVITY_PROBE_TIMEOUT;
use crate::core::error::GatewayError;
use crate::core::provider::{load_builtin_providers, Provider};

/// Provider record as echoed to callers: capability metadata and a masked
/// credential, never the credential itself.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderListing {
    pub name: String,
    pub display_name: String,
    pub base_url: String,
    pub api_key: String,
    pub default_model: String,
    pub models: Vec<String>,
    pub supports_vision: bool,
    pub builtin: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderUpdate {
    pub display_name: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub default_model: Option<String>,
}

/// Outcome of a connectivity probe. Failure is a normal result here, not
/// an error: probing a dead endpoint must never crash the caller.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityReport {
    pub success: bool,
    pub message: String,
    pub latency_ms: f64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CatalogRefresh {
    /// Catalog replaced; carries the new entry count.
    Updated(usize),
    /// The provider declares no model-listing endpoint.
    Unsupported,
}

pub struct ProviderRegistry {
    providers: RwLock<Vec<Provider>>,
    client: reqwest::Client,
    config_path: Option<PathBuf>,
}

impl ProviderRegistry {
    pub fn new(config: &GatewayConfig) -> Self {
        let mut providers = load_builtin_providers();

        for provider in providers.iter_mut() {
            if let Some(key) = config.api_keys.get(&provider.name) {
                provider.api_key = key.clone();
            }
        }

        for custom in &config.custom_providers {
            if providers
                .iter()
                .any(|p| p.name.eq_ignore_ascii_case(&custom.name))
            {
                tracing::warn!(
                    provider = %custom.name,
                    "ignoring custom provider shadowing an existing name"
                );
                continue;
            }
            let mut custom = custom.clone();
            custom.builtin = false;
            providers.push(custom);
        }

        ProviderRegistry {
            providers: RwLock::new(providers),
            client: reqwest::Client::new(),
            config_path: None,
        }
    }

    /// Persist user-added providers and credential overrides to this config
    /// file after each mutating operation.
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Built-ins first, then user-added providers in creation order.
    pub fn list(&self) -> Vec<ProviderListing> {
        let providers = self.providers.read().expect("provider lock poisoned");
        providers
            .iter()
            .map(|provider| ProviderListing {
                name: provider.name.clone(),
                display_name: provider.display_name.clone(),
                base_url: provider.base_url.clone(),
                api_key: provider.masked_api_key(),
                default_model: provider.default_model.clone(),
                models: provider.models.clone(),
                supports_vision: provider.supports_vision,
                builtin: provider.builtin,
            })
            .collect()
    }

    /// Snapshot of a provider record, for sessions to capture at start.
    pub fn get(&self, name: &str) -> Option<Provider> {
        let providers = self.providers.read().expect("provider lock poisoned");
        providers
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn require(&self, name: &str) -> Result<Provider, GatewayError> {
        self.get(name)
            .ok_or_else(|| GatewayError::UnknownProvider(name.to_string()))
    }

    pub fn add(&self, mut provider: Provider) -> Result<(), GatewayError> {
        validate_spec(&provider)?;
        provider.builtin = false;

        {
            let mut providers = self.providers.write().expect("provider lock poisoned");
            if providers
                .iter()
                .any(|p| p.name.eq_ignore_ascii_case(&provider.name))
            {
                return Err(GatewayError::Conflict(provider.name));
            }
            providers.push(provider);
        }

        self.persist();
        Ok(())
    }

    pub fn update(&self, name: &str, update: ProviderUpdate) -> Result<(), GatewayError> {
        if let Some(base_url) = &update.base_url {
            if base_url.trim().is_empty() {
                return Err(GatewayError::invalid_spec("endpoint must not be empty"));
            }
        }

        {
            let mut providers = self.providers.write().expect("provider lock poisoned");
            let provider = providers
                .iter_mut()
                .find(|p| p.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| GatewayError::NotFound(format!("Provider '{name}'")))?;

            if let Some(display_name) = update.display_name {
                provider.display_name = display_name;
            }
            if let Some(base_url) = update.base_url {
                provider.base_url = base_url;
            }
            if let Some(api_key) = update.api_key {
                provider.api_key = api_key;
            }
            if let Some(default_model) = update.default_model {
                provider.default_model = default_model;
            }
        }

        self.persist();
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<(), GatewayError> {
        {
            let mut providers = self.providers.write().expect("provider lock poisoned");
            let index = providers
                .iter()
                .position(|p| p.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| GatewayError::NotFound(format!("Provider '{name}'")))?;
            if providers[index].builtin {
                return Err(GatewayError::Protected(name.to_string()));
            }
            providers.remove(index);
        }

        self.persist();
        Ok(())
    }

    /// Probe the provider's model-listing endpoint with a bounded timeout.
    pub async fn test_connectivity(&self, name: &str) -> Result<ConnectivityReport, GatewayError> {
        let provider = self
            .get(name)
            .ok_or_else(|| GatewayError::NotFound(format!("Provider '{name}'")))?;

        let adapter = crate::core::adapter::adapter_for(&provider);
        let request = adapter
            .apply_auth(
                self.client
                    .get(adapter.models_endpoint(&provider.base_url))
                    .timeout(CONNECTIVITY_PROBE_TIMEOUT),
                &provider.resolved_api_key(),
            )
            .header("Content-Type", "application/json");

        let start = Instant::now();
        let outcome = request.send().await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let report = match outcome {
            Ok(response) if response.status().is_success() => ConnectivityReport {
                success: true,
                message: "Connected successfully".to_string(),
                latency_ms,
            },
            Ok(response) => ConnectivityReport {
                success: false,
                message: format!("Connection failed: status {}", response.status()),
                latency_ms,
            },
            Err(e) => ConnectivityReport {
                success: false,
                message: format!("Connection failed: {e}"),
                latency_ms,
            },
        };
        Ok(report)
    }

    /// Replace the cached catalog from the provider's listing endpoint. On
    /// failure the previous catalog stays untouched.
    pub async fn refresh_model_catalog(
        &self,
        name: &str,
    ) -> Result<CatalogRefresh, GatewayError> {
        let provider = self
            .get(name)
            .ok_or_else(|| GatewayError::NotFound(format!("Provider '{name}'")))?;

        if !provider.lists_models {
            return Ok(CatalogRefresh::Unsupported);
        }

        let models = fetch_models(&self.client, &provider).await?;
        let ids: Vec<String> = models.into_iter().map(|m| m.id).collect();
        let count = ids.len();

        {
            let mut providers = self.providers.write().expect("provider lock poisoned");
            if let Some(entry) = providers
                .iter_mut()
                .find(|p| p.name.eq_ignore_ascii_case(name))
            {
                entry.models = ids;
            }
        }

        tracing::debug!(provider = %name, count, "model catalog refreshed");
        Ok(CatalogRefresh::Updated(count))
    }

    /// Best-effort write-through of registry state to the config file. The
    /// in-memory registry stays authoritative for the process lifetime.
    fn persist(&self) {
        let Some(path) = &self.config_path else {
            return;
        };

        let mut config = match GatewayConfig::load_from_path(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "could not reload config for persistence");
                return;
            }
        };

        let providers = self.providers.read().expect("provider lock poisoned");
        config.custom_providers = providers.iter().filter(|p| !p.builtin).cloned().collect();
        config.api_keys = providers
            .iter()
            .filter(|p| p.builtin && !p.api_key.is_empty())
            .map(|p| (p.name.clone(), p.api_key.clone()))
            .collect();
        drop(providers);

        if let Err(e) = config.save_to_path(path) {
            tracing::warn!(error = %e, "could not persist provider changes");
        }
    }
}

fn validate_spec(provider: &Provider) -> Result<(), GatewayError> {
    let name = provider.name.trim();
    if name.is_empty() {
        return Err(GatewayError::invalid_spec("provider name must not be empty"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(GatewayError::invalid_spec(
            "provider name must not contain whitespace",
        ));
    }
    let base_url = provider.base_url.trim();
    if base_url.is_empty() {
        return Err(GatewayError::invalid_spec("endpoint must not be empty"));
    }
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(GatewayError::invalid_spec(format!(
            "endpoint '{base_url}' must be an http(s) URL"
        )));
    }
    Ok(())
}
