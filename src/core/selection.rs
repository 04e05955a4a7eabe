//! Model selection policy
//!
//! Computes the effective provider+model for a request from the caller's
//! explicit choice, the stored per-provider policy, and the live model
//! catalog. Auto-choose delegates to the provider's own routing alias and
//! takes precedence over the free-only filter.

use serde::{Deserialize, Serialize};

use crate::core::provider::Provider;

const DEFAULT_FREE_SUFFIX: &str = ":free";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelPolicy {
    #[serde(default)]
    pub free_only: bool,
    #[serde(default)]
    pub auto_choose: bool,
}

/// The resolved target of one request, computed fresh each time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveSelection {
    pub provider: String,
    pub model: String,
    pub free_only_applied: bool,
    pub auto_choose_applied: bool,
}

/// Free-tier entries of a provider's catalog, per its naming convention.
pub fn free_models<'a>(provider: &'a Provider) -> Vec<&'a str> {
    let suffix = provider
        .free_model_suffix
        .as_deref()
        .unwrap_or(DEFAULT_FREE_SUFFIX);
    provider
        .models
        .iter()
        .filter(|id| id.ends_with(suffix))
        .map(String::as_str)
        .collect()
}

pub fn resolve_selection(
    provider: &Provider,
    policy: ModelPolicy,
    requested: Option<&str>,
) -> EffectiveSelection {
    if policy.auto_choose {
        if let Some(alias) = provider.auto_model.as_deref() {
            return EffectiveSelection {
                provider: provider.name.clone(),
                model: alias.to_string(),
                free_only_applied: false,
                auto_choose_applied: true,
            };
        }
        tracing::debug!(
            provider = %provider.name,
            "auto-choose requested but provider has no routing alias"
        );
    }

    if policy.free_only {
        let candidates = free_models(provider);
        let model = match requested {
            Some(choice) if candidates.contains(&choice) => choice.to_string(),
            _ => candidates
                .first()
                .map(|id| id.to_string())
                .unwrap_or_else(|| provider.default_model.clone()),
        };
        return EffectiveSelection {
            provider: provider.name.clone(),
            model,
            free_only_applied: true,
            auto_choose_applied: false,
        };
    }

    EffectiveSelection {
        provider: provider.name.clone(),
        model: requested
            .filter(|choice| !choice.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| provider.default_model.clone()),
        free_only_applied: false,
        auto_choose_applied: false,
    }
}
