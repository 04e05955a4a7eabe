use crate::api::{ModelInfo, ModelsResponse};
use crate::core::adapter::adapter_for;
use crate::core::error::GatewayError;
use crate::core::provider::Provider;

/// Query a provider's model-listing endpoint. Authentication and endpoint
/// shape follow the provider's wire dialect.
pub async fn fetch_models(
    client: &reqwest::Client,
    provider: &Provider,
) -> Result<Vec<ModelInfo>, GatewayError> {
    let adapter = adapter_for(provider);
    let request = adapter.apply_auth(
        client
            .get(adapter.models_endpoint(&provider.base_url))
            .header("Content-Type", "application/json"),
        &provider.resolved_api_key(),
    );

    let response = request
        .send()
        .await
        .map_err(|e| GatewayError::UpstreamUnavailable(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(GatewayError::UpstreamProtocolError(format!(
            "model listing failed with status {status}: {error_text}"
        )));
    }

    let mut models = response
        .json::<ModelsResponse>()
        .await
        .map_err(|e| GatewayError::UpstreamProtocolError(e.to_string()))?
        .data;
    sort_models(&mut models);
    Ok(models)
}

/// Sort models newest first, falling back to reverse id order. Providers
/// disagree on which creation field they populate, so both are consulted.
pub fn sort_models(models: &mut [ModelInfo]) {
    models.sort_by(|a, b| {
        match (&a.created, &b.created, &a.created_at, &b.created_at) {
            (Some(a_created), Some(b_created), _, _) => b_created.cmp(a_created),
            (Some(_), None, _, _) => std::cmp::Ordering::Less,
            (None, Some(_), _, _) => std::cmp::Ordering::Greater,
            (None, None, Some(a_created_at), Some(b_created_at)) => {
                b_created_at.cmp(a_created_at)
            }
            (None, None, Some(_), None) => std::cmp::Ordering::Less,
            (None, None, None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None, None, None) => b.id.cmp(&a.id),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, created: Option<u64>, created_at: Option<&str>) -> ModelInfo {
        ModelInfo {
            id: id.to_string(),
            created,
            created_at: created_at.map(str::to_string),
            owned_by: None,
            display_name: None,
        }
    }

    #[test]
    fn sorts_by_creation_then_id() {
        let mut models = vec![
            info("old", Some(100), None),
            info("new", Some(300), None),
            info("mid", Some(200), None),
        ];
        sort_models(&mut models);
        let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn dated_models_sort_before_undated() {
        let mut models = vec![
            info("undated", None, None),
            info("dated", None, Some("2024-06-01")),
        ];
        sort_models(&mut models);
        assert_eq!(models[0].id, "dated");
    }
}
