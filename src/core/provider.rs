//! Provider records and capability metadata
//!
//! Built-in providers load from the embedded `builtin_providers.toml`;
//! user-added providers are deserialized from the config file. Capability
//! flags (wire dialect, vision support, system-prompt placement) drive the
//! per-provider adapters so the relay itself stays provider-agnostic.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemPromptStyle {
    /// The provider accepts a dedicated `system` role message.
    Role,
    /// The provider takes the system prompt as a top-level request field.
    TopLevel,
    /// No system support; the prompt is prepended to the first user turn.
    MergeFirstUser,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    pub display_name: String,
    pub base_url: String,
    /// Credential, possibly a `${VAR}` environment reference. Resolved at
    /// use, never echoed back through the registry surface.
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub default_model: String,
    /// Cached model catalog. Possibly empty; replaced by catalog refresh.
    #[serde(default)]
    pub models: Vec<String>,
    /// Wire dialect: "openai" (default) or "anthropic".
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default)]
    pub system_prompt_style: Option<SystemPromptStyle>,
    /// Whether the provider exposes a model-listing endpoint.
    #[serde(default = "default_true")]
    pub lists_models: bool,
    /// Naming convention marking free-tier catalog entries, e.g. ":free".
    #[serde(default)]
    pub free_model_suffix: Option<String>,
    /// The provider's automatic-routing alias, if it has one.
    #[serde(default)]
    pub auto_model: Option<String>,
    /// Built-in providers cannot be deleted, only overridden.
    #[serde(skip)]
    pub builtin: bool,
}

fn default_true() -> bool {
    true
}

impl Provider {
    pub fn auth_mode(&self) -> &str {
        self.mode.as_deref().unwrap_or("openai")
    }

    pub fn is_anthropic_mode(&self) -> bool {
        self.auth_mode() == "anthropic"
    }

    /// Effective system-prompt placement, defaulting by wire dialect.
    pub fn effective_system_prompt_style(&self) -> SystemPromptStyle {
        match self.system_prompt_style {
            Some(style) => style,
            None if self.is_anthropic_mode() => SystemPromptStyle::TopLevel,
            None => SystemPromptStyle::Role,
        }
    }

    /// Resolve the stored credential, expanding a `${VAR}` reference from
    /// the environment. An unset variable resolves to an empty key, which
    /// upstream requests will reject with a normal auth failure.
    pub fn resolved_api_key(&self) -> String {
        resolve_credential(&self.api_key)
    }

    /// Credential as echoed by the registry surface: enough to recognize,
    /// never enough to reuse.
    pub fn masked_api_key(&self) -> String {
        mask_credential(&self.api_key)
    }
}

pub(crate) fn resolve_credential(reference: &str) -> String {
    let trimmed = reference.trim();
    if let Some(var) = trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        match std::env::var(var) {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(variable = var, "credential reference is unset");
                String::new()
            }
        }
    } else {
        trimmed.to_string()
    }
}

fn mask_credential(key: &str) -> String {
    if key.is_empty() || key.starts_with("${") {
        return key.to_string();
    }
    if key.len() > 12 {
        let head = &key[..8];
        let tail = &key[key.len() - 4..];
        format!("{head}{}{tail}", "•".repeat(key.len() - 12))
    } else {
        "••••••••".to_string()
    }
}

#[derive(Debug, Deserialize)]
struct BuiltinProvidersFile {
    providers: Vec<Provider>,
}

/// Load the built-in providers embedded in the binary.
pub fn load_builtin_providers() -> Vec<Provider> {
    const FILE: &str = include_str!("../builtin_providers.toml");

    let parsed: BuiltinProvidersFile =
        toml::from_str(FILE).expect("Failed to parse builtin_providers.toml");

    parsed
        .providers
        .into_iter()
        .map(|mut provider| {
            provider.builtin = true;
            provider
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::sample_provider;

    #[test]
    fn builtin_providers_load_with_expected_capabilities() {
        let providers = load_builtin_providers();
        assert!(!providers.is_empty());
        assert!(providers.iter().all(|p| p.builtin));

        let names: Vec<&str> = providers.iter().map(|p| p.name.as_str()).collect();
        assert!(names.contains(&"openai"));
        assert!(names.contains(&"anthropic"));
        assert!(names.contains(&"openrouter"));

        let anthropic = providers.iter().find(|p| p.name == "anthropic").unwrap();
        assert!(anthropic.is_anthropic_mode());
        assert_eq!(
            anthropic.effective_system_prompt_style(),
            SystemPromptStyle::TopLevel
        );

        let openai = providers.iter().find(|p| p.name == "openai").unwrap();
        assert!(!openai.is_anthropic_mode());
        assert_eq!(
            openai.effective_system_prompt_style(),
            SystemPromptStyle::Role
        );

        let openrouter = providers.iter().find(|p| p.name == "openrouter").unwrap();
        assert_eq!(openrouter.free_model_suffix.as_deref(), Some(":free"));
        assert_eq!(openrouter.auto_model.as_deref(), Some("openrouter/auto"));
    }

    #[test]
    fn credential_references_resolve_from_environment() {
        std::env::set_var("PASSERELLE_TEST_KEY", "sk-resolved");
        assert_eq!(resolve_credential("${PASSERELLE_TEST_KEY}"), "sk-resolved");
        std::env::remove_var("PASSERELLE_TEST_KEY");

        assert_eq!(resolve_credential("${PASSERELLE_UNSET_KEY}"), "");
        assert_eq!(resolve_credential("sk-literal"), "sk-literal");
    }

    #[test]
    fn masking_keeps_recognizable_ends_only() {
        let provider = Provider {
            api_key: "sk-abcdefghijklmnop".into(),
            ..sample_provider()
        };
        let masked = provider.masked_api_key();
        assert!(masked.starts_with("sk-abcde"));
        assert!(masked.ends_with("mnop"));
        assert!(masked.contains('•'));

        let short = Provider {
            api_key: "tiny".into(),
            ..sample_provider()
        };
        assert_eq!(short.masked_api_key(), "••••••••");

        let reference = Provider {
            api_key: "${SOME_VAR}".into(),
            ..sample_provider()
        };
        assert_eq!(reference.masked_api_key(), "${SOME_VAR}");
    }
}
