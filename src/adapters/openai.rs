//! OpenAI-compatible prober.
//!
//! Sends the cheapest request that proves a model actually answers:
//! a one-line chat for language models, a tiny image prompt for vision
//! models, and so on. Capabilities without a cheap request (or disabled
//! in config) get a `GET /v1/models/{id}` connectivity check instead.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::debug;
use zeroize::Zeroizing;

use super::{Prober, RawAttempt, TransportFailure, SNIPPET_MAX_CHARS};
use crate::config::{ApiConfig, ProbeConfig};
use crate::error::{EngineError, Result};
use crate::outcome::{truncate_chars, Capability, ProbeTarget};

/// 1x1 transparent PNG, enough for a vision model to accept the request.
const PROBE_IMAGE_URL: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

/// Which request a target gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeKind {
    Chat,
    VisionChat,
    Speech,
    Embedding,
    ImageGeneration,
    Connectivity,
}

pub struct OpenAiProber {
    client: reqwest::Client,
    base_url: String,
    api_key: Zeroizing<String>,
    test_message: String,
    probe: ProbeConfig,
}

impl OpenAiProber {
    pub fn new(api: &ApiConfig, probe: &ProbeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(api.timeout())
            .user_agent(concat!("modelprobe/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            api_key: Zeroizing::new(api.api_key.clone()),
            test_message: api.test_message.clone(),
            probe: probe.clone(),
        })
    }

    /// Model ids the API advertises, in the order it lists them.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/v1/models", self.base_url);
        let resp = self.authorize(self.client.get(&url)).send().await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Discovery {
                status,
                message: truncate_chars(&error_message(body.as_bytes()), SNIPPET_MAX_CHARS),
            });
        }

        let body: Value = resp.json().await?;
        let ids = body["data"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }

    fn probe_kind(&self, capability: Capability) -> ProbeKind {
        let p = &self.probe;
        match capability {
            Capability::Language => ProbeKind::Chat,
            Capability::Vision if !p.skip_vision => ProbeKind::VisionChat,
            Capability::Audio if !p.skip_audio => ProbeKind::Speech,
            Capability::Embedding if !p.skip_embedding => ProbeKind::Embedding,
            Capability::ImageGeneration if !p.skip_image_generation => ProbeKind::ImageGeneration,
            _ => ProbeKind::Connectivity,
        }
    }

    fn request(&self, kind: ProbeKind, model: &str) -> reqwest::RequestBuilder {
        let base = &self.base_url;
        let builder = match kind {
            ProbeKind::Chat => self
                .client
                .post(format!("{base}/v1/chat/completions"))
                .json(&json!({
                    "model": model,
                    "messages": [{"role": "user", "content": self.test_message}],
                    "max_tokens": 16,
                })),
            ProbeKind::VisionChat => self
                .client
                .post(format!("{base}/v1/chat/completions"))
                .json(&json!({
                    "model": model,
                    "messages": [{
                        "role": "user",
                        "content": [
                            {"type": "text", "text": "What is in this image?"},
                            {"type": "image_url", "image_url": {"url": PROBE_IMAGE_URL}},
                        ],
                    }],
                    "max_tokens": 16,
                })),
            ProbeKind::Speech => self
                .client
                .post(format!("{base}/v1/audio/speech"))
                .json(&json!({"model": model, "input": self.test_message, "voice": "alloy"})),
            ProbeKind::Embedding => self
                .client
                .post(format!("{base}/v1/embeddings"))
                .json(&json!({"model": model, "input": self.test_message})),
            ProbeKind::ImageGeneration => self
                .client
                .post(format!("{base}/v1/images/generations"))
                .json(&json!({"model": model, "prompt": "a red dot", "n": 1, "size": "256x256"})),
            ProbeKind::Connectivity => self.client.get(format!("{base}/v1/models/{model}")),
        };
        self.authorize(builder)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(self.api_key.as_str())
        }
    }
}

#[async_trait]
impl Prober for OpenAiProber {
    async fn probe(&self, target: &ProbeTarget) -> RawAttempt {
        let kind = self.probe_kind(target.capability);
        let started = Instant::now();

        let resp = match self.request(kind, &target.id).send().await {
            Ok(resp) => resp,
            Err(e) => return transport_attempt(&e, started),
        };
        let status = resp.status().as_u16();
        let retry_after = parse_retry_after(resp.headers());

        let body = match resp.bytes().await {
            Ok(body) => body,
            Err(e) => return transport_attempt(&e, started),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let mut attempt = if (200..300).contains(&status) {
            let (snippet, content_ok) = extract_content(kind, &body);
            RawAttempt::http(status, latency_ms, truncate_chars(&snippet, SNIPPET_MAX_CHARS), content_ok)
        } else {
            let message = error_message(&body);
            RawAttempt::http(status, latency_ms, truncate_chars(&message, SNIPPET_MAX_CHARS), false)
        };
        if let Some(hint) = retry_after {
            attempt = attempt.with_retry_after(hint);
        }

        debug!(target_id = %target.id, ?kind, status, latency_ms, "Probe attempt finished");
        attempt
    }
}

// ── Response parsing ────────────────────────────────────────────────

fn transport_attempt(e: &reqwest::Error, started: Instant) -> RawAttempt {
    let failure = if e.is_timeout() {
        TransportFailure::Timeout
    } else if e.is_connect() {
        TransportFailure::Connect
    } else {
        TransportFailure::Other
    };
    RawAttempt::transport(
        failure,
        started.elapsed().as_millis() as u64,
        truncate_chars(&e.to_string(), SNIPPET_MAX_CHARS),
    )
}

/// `Retry-After` in delta-seconds. HTTP-date values and anything that
/// doesn't fit a `Duration` are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    let secs: f64 = raw.parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// What a 2xx body says, and whether it actually carried an answer.
fn extract_content(kind: ProbeKind, body: &[u8]) -> (String, bool) {
    if kind == ProbeKind::Speech {
        return (format!("{} bytes of audio", body.len()), !body.is_empty());
    }

    let Ok(json) = serde_json::from_slice::<Value>(body) else {
        let text = String::from_utf8_lossy(body).trim().to_string();
        let ok = kind == ProbeKind::Connectivity && !text.is_empty();
        return (text, ok);
    };

    match kind {
        ProbeKind::Chat | ProbeKind::VisionChat => {
            let message = &json["choices"][0]["message"];
            let text = message["content"]
                .as_str()
                .or_else(|| message["reasoning_content"].as_str())
                .unwrap_or("")
                .trim()
                .to_string();
            let ok = !text.is_empty();
            (text, ok)
        }
        ProbeKind::Embedding => match json["data"][0]["embedding"].as_array() {
            Some(v) if !v.is_empty() => (format!("embedding with {} dimensions", v.len()), true),
            _ => (String::new(), false),
        },
        ProbeKind::ImageGeneration => {
            let item = &json["data"][0];
            match (item["url"].as_str(), item["b64_json"].as_str()) {
                (Some(url), _) => (url.to_string(), true),
                (None, Some(_)) => ("inline image".to_string(), true),
                _ => (String::new(), false),
            }
        }
        ProbeKind::Connectivity | ProbeKind::Speech => match json["id"].as_str() {
            Some(id) => (id.to_string(), true),
            None => (String::new(), !json.is_null()),
        },
    }
}

/// Provider error message, falling back to the raw body.
fn error_message(body: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<Value>(body) {
        if let Some(msg) = json["error"]["message"].as_str() {
            return msg.to_string();
        }
        if let Some(msg) = json["error"].as_str().or_else(|| json["message"].as_str()) {
            return msg.to_string();
        }
    }
    String::from_utf8_lossy(body).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn prober(server: &MockServer, probe: ProbeConfig) -> OpenAiProber {
        let api = ApiConfig {
            base_url: format!("{}/", server.uri()),
            api_key: "sk-test".into(),
            timeout_secs: 5,
            test_message: "hello".into(),
        };
        OpenAiProber::new(&api, &probe).unwrap()
    }

    #[tokio::test]
    async fn test_chat_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "Hello! How can I help?"}}]
            })))
            .mount(&server)
            .await;

        let attempt = prober(&server, ProbeConfig::default())
            .probe(&ProbeTarget::new("gpt-4o-mini", Capability::Language))
            .await;
        assert_eq!(attempt.status, Some(200));
        assert!(attempt.content_ok);
        assert_eq!(attempt.snippet, "Hello! How can I help?");
        assert_eq!(attempt.error_code(), "");
    }

    #[tokio::test]
    async fn test_empty_choice_is_not_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": ""}}]
            })))
            .mount(&server)
            .await;

        let attempt = prober(&server, ProbeConfig::default())
            .probe(&ProbeTarget::new("quiet-model", Capability::Language))
            .await;
        assert!(!attempt.content_ok);
        assert_eq!(attempt.error_code(), "NO_CONTENT");
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "3")
                    .set_body_json(json!({"error": {"message": "Rate limit reached for requests"}})),
            )
            .mount(&server)
            .await;

        let attempt = prober(&server, ProbeConfig::default())
            .probe(&ProbeTarget::new("gpt-4o", Capability::Language))
            .await;
        assert_eq!(attempt.status, Some(429));
        assert_eq!(attempt.retry_after, Some(Duration::from_secs(3)));
        assert_eq!(attempt.snippet, "Rate limit reached for requests");
    }

    #[tokio::test]
    async fn test_embedding_route() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"embedding": [0.1, 0.2, 0.3]}]
            })))
            .mount(&server)
            .await;

        let attempt = prober(&server, ProbeConfig::default())
            .probe(&ProbeTarget::new("text-embedding-3-small", Capability::Embedding))
            .await;
        assert!(attempt.content_ok);
        assert_eq!(attempt.snippet, "embedding with 3 dimensions");
    }

    #[tokio::test]
    async fn test_skipped_kind_falls_back_to_connectivity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models/gpt-4-vision"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "gpt-4-vision"})))
            .mount(&server)
            .await;

        let probe = ProbeConfig { skip_vision: true, ..ProbeConfig::default() };
        let attempt = prober(&server, probe)
            .probe(&ProbeTarget::new("gpt-4-vision", Capability::Vision))
            .await;
        assert!(attempt.content_ok);
        assert_eq!(attempt.snippet, "gpt-4-vision");
    }

    #[tokio::test]
    async fn test_error_message_is_extracted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models/rerank-v1"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"message": "The model `rerank-v1` does not exist"}
            })))
            .mount(&server)
            .await;

        let attempt = prober(&server, ProbeConfig::default())
            .probe(&ProbeTarget::new("rerank-v1", Capability::Reranker))
            .await;
        assert_eq!(attempt.error_code(), "HTTP_404");
        assert_eq!(attempt.snippet, "The model `rerank-v1` does not exist");
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_failure() {
        let api = ApiConfig {
            base_url: "http://127.0.0.1:1".into(),
            timeout_secs: 2,
            ..ApiConfig::default()
        };
        let prober = OpenAiProber::new(&api, &ProbeConfig::default()).unwrap();
        let attempt = prober.probe(&ProbeTarget::new("m", Capability::Language)).await;
        assert_eq!(attempt.status, None);
        assert!(attempt.failure.is_some());
        assert!(!attempt.content_ok);
    }

    #[tokio::test]
    async fn test_list_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "gpt-4o"}, {"id": "text-embedding-3-small"}, {"object": "junk"}]
            })))
            .mount(&server)
            .await;

        let ids = prober(&server, ProbeConfig::default()).list_models().await.unwrap();
        assert_eq!(ids, vec!["gpt-4o".to_string(), "text-embedding-3-small".to_string()]);
    }

    #[tokio::test]
    async fn test_list_models_rejects_bad_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Incorrect API key provided"}
            })))
            .mount(&server)
            .await;

        match prober(&server, ProbeConfig::default()).list_models().await {
            Err(EngineError::Discovery { status, message }) => {
                assert_eq!(status, 401);
                assert!(message.contains("Incorrect API key"));
            }
            other => panic!("expected discovery error, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, "2.5".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_millis(2_500)));
        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_parse_retry_after_out_of_range() {
        let mut headers = HeaderMap::new();
        for raw in ["1e20", "-1", "NaN", "inf"] {
            headers.insert(RETRY_AFTER, raw.parse().unwrap());
            assert_eq!(parse_retry_after(&headers), None, "{raw}");
        }
    }

    #[tokio::test]
    async fn test_huge_retry_after_is_ignored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "1e20")
                    .set_body_json(json!({"error": {"message": "slow down"}})),
            )
            .mount(&server)
            .await;

        let attempt = prober(&server, ProbeConfig::default())
            .probe(&ProbeTarget::new("gpt-4o", Capability::Language))
            .await;
        assert_eq!(attempt.status, Some(429));
        assert_eq!(attempt.retry_after, None);
        assert_eq!(attempt.error_code(), "HTTP_429");
    }
}
