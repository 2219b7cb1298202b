//! Ollama reachability probe and model listing (`GET /api/tags`).

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// Names of the models pulled into the Ollama instance at `base_url`.
pub fn list_models(base_url: &str) -> Result<Vec<String>, String> {
    let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .map_err(|e| format!("HTTP client setup failed: {e}"))?;

    let response = client
        .get(&url)
        .send()
        .map_err(|e| format!("Ollama unreachable at {url}: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("Ollama returned HTTP {}", response.status()));
    }
    let tags: TagsResponse = response
        .json()
        .map_err(|e| format!("Failed to parse Ollama response: {e}"))?;
    Ok(parse_names(tags))
}

fn parse_names(tags: TagsResponse) -> Vec<String> {
    let mut names: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();
    names.sort();
    names
}

/// Whether `model` (with or without a `:latest` tag) is among `available`.
pub fn has_model(available: &[String], model: &str) -> bool {
    available
        .iter()
        .any(|name| name == model || name.strip_suffix(":latest") == Some(model))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_response_parses_sorted_names() -> Result<(), Box<dyn std::error::Error>> {
        let raw = r#"{"models":[{"name":"qwen2.5:7b","size":1},{"name":"llama3:latest"}]}"#;
        let tags: TagsResponse = serde_json::from_str(raw)?;
        assert_eq!(parse_names(tags), vec!["llama3:latest", "qwen2.5:7b"]);

        let empty: TagsResponse = serde_json::from_str("{}")?;
        assert!(parse_names(empty).is_empty());
        Ok(())
    }

    #[test]
    fn latest_tag_is_optional() {
        let available = vec!["llama3:latest".to_string(), "qwen2.5:7b".to_string()];
        assert!(has_model(&available, "llama3"));
        assert!(has_model(&available, "qwen2.5:7b"));
        assert!(!has_model(&available, "qwen2.5"));
    }

    #[test]
    fn unreachable_server_is_an_error() {
        assert!(list_models("http://127.0.0.1:9").is_err());
    }
}
