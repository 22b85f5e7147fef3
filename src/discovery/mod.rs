//! Target discovery: ask the API which models exist and tag each one
//! with the capability that decides how it gets probed.

pub mod capability;

use std::collections::{BTreeMap, HashSet};
use tracing::info;

use crate::adapters::openai::OpenAiProber;
use crate::error::Result;
use crate::outcome::ProbeTarget;

pub use capability::{CapabilityRule, CapabilityRules};

/// List models and turn them into probe targets, keeping API order.
///
/// A non-2xx listing aborts with [`EngineError::Discovery`](crate::error::EngineError::Discovery):
/// if the key can't list models, probing them one by one is pointless.
pub async fn discover_targets(prober: &OpenAiProber, rules: &CapabilityRules) -> Result<Vec<ProbeTarget>> {
    let ids = prober.list_models().await?;
    let targets = tag_targets(ids, rules);

    let mut by_capability: BTreeMap<&str, usize> = BTreeMap::new();
    for t in &targets {
        *by_capability.entry(t.capability.as_str()).or_default() += 1;
    }
    info!(models = targets.len(), ?by_capability, "🔎 Discovered models");

    Ok(targets)
}

/// Tag ids, dropping repeats and blanks.
pub fn tag_targets(ids: Vec<String>, rules: &CapabilityRules) -> Vec<ProbeTarget> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .filter(|id| !id.trim().is_empty())
        .filter(|id| seen.insert(id.clone()))
        .map(|id| {
            let capability = rules.classify(&id);
            ProbeTarget::new(id, capability)
        })
        .collect()
}

/// Keep only targets listed in `failed`, preserving order.
pub fn retain_failed(targets: Vec<ProbeTarget>, failed: &[String]) -> Vec<ProbeTarget> {
    let failed: HashSet<&str> = failed.iter().map(String::as_str).collect();
    targets.into_iter().filter(|t| failed.contains(t.id.as_str())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiConfig, ProbeConfig};
    use crate::error::EngineError;
    use crate::outcome::Capability;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn prober(server: &MockServer) -> OpenAiProber {
        let api = ApiConfig { base_url: server.uri(), api_key: "sk-test".into(), ..ApiConfig::default() };
        OpenAiProber::new(&api, &ProbeConfig::default()).unwrap()
    }

    #[test]
    fn test_tag_targets_dedupes_in_order() {
        let ids = vec!["gpt-4o".into(), "whisper-1".into(), "gpt-4o".into(), " ".into()];
        let targets = tag_targets(ids, &CapabilityRules::default());
        assert_eq!(
            targets,
            vec![
                ProbeTarget::new("gpt-4o", Capability::Language),
                ProbeTarget::new("whisper-1", Capability::Audio),
            ]
        );
    }

    #[test]
    fn test_retain_failed_keeps_discovery_order() {
        let targets = tag_targets(
            vec!["gpt-4o".into(), "whisper-1".into(), "dall-e-3".into(), "gpt-3.5-turbo".into()],
            &CapabilityRules::default(),
        );
        // Cached failures that are no longer listed are ignored
        let failed = vec!["gpt-3.5-turbo".to_string(), "gpt-4o".to_string(), "retired-model".to_string()];
        let ids: Vec<String> = retain_failed(targets, &failed).into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["gpt-4o".to_string(), "gpt-3.5-turbo".to_string()]);
    }

    #[tokio::test]
    async fn test_discover_targets() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "gpt-4o"}, {"id": "text-embedding-3-large"}, {"id": "dall-e-3"}]
            })))
            .mount(&server)
            .await;

        let targets = discover_targets(&prober(&server), &CapabilityRules::default()).await.unwrap();
        let caps: Vec<_> = targets.iter().map(|t| t.capability).collect();
        assert_eq!(caps, vec![Capability::Language, Capability::Embedding, Capability::ImageGeneration]);
    }

    #[tokio::test]
    async fn test_discovery_failure_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = discover_targets(&prober(&server), &CapabilityRules::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Discovery { status: 503, .. }));
    }
}
