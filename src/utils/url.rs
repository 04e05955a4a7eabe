//! URL helpers for building provider endpoints
//!
//! Provider base addresses come from user config and may or may not carry
//! trailing slashes; these helpers keep endpoint construction consistent.

/// Remove trailing slashes from a provider base address.
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Join a provider base address and an endpoint path without doubling
/// slashes.
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{normalized_base}/{endpoint}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_trailing_slashes() {
        assert_eq!(
            normalize_base_url("https://api.example.com/v1"),
            "https://api.example.com/v1"
        );
        assert_eq!(
            normalize_base_url("https://api.example.com/v1///"),
            "https://api.example.com/v1"
        );
    }

    #[test]
    fn joins_base_and_endpoint_cleanly() {
        assert_eq!(
            construct_api_url("https://api.example.com/v1/", "chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            construct_api_url("https://api.example.com/v1", "/models"),
            "https://api.example.com/v1/models"
        );
    }
}
