//! Capability tagging from model ids.
//!
//! Model ids are matched against an ordered table of substring patterns.
//! The first rule whose patterns match (and whose exclusions don't) wins;
//! anything unmatched is treated as a language model.

use crate::outcome::Capability;

#[derive(Debug, Clone)]
pub struct CapabilityRule {
    pub capability: Capability,
    pub patterns: Vec<String>,
    pub exclude: Vec<String>,
}

impl CapabilityRule {
    pub fn new(capability: Capability, patterns: &[&str], exclude: &[&str]) -> Self {
        Self {
            capability,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            exclude: exclude.iter().map(|e| e.to_string()).collect(),
        }
    }

    fn matches(&self, lower_id: &str) -> bool {
        self.patterns.iter().any(|p| lower_id.contains(p.as_str()))
            && !self.exclude.iter().any(|e| lower_id.contains(e.as_str()))
    }
}

/// Ordered rule table. Order matters: an id like `flux-vl` is an image
/// generator, not a vision model.
#[derive(Debug, Clone)]
pub struct CapabilityRules {
    rules: Vec<CapabilityRule>,
}

impl Default for CapabilityRules {
    fn default() -> Self {
        Self::new(vec![
            CapabilityRule::new(
                Capability::ImageGeneration,
                &[
                    "dall-e", "flux", "stable-diffusion", "sdxl", "dreamshaper", "kolors",
                    "cogview", "seedream", "seededit", "gpt-image", "t2i", "i2i", "t2v", "i2v",
                ],
                &[],
            ),
            CapabilityRule::new(
                Capability::Audio,
                &[
                    "whisper", "tts", "speech", "audio", "cosyvoice", "sensevoice", "paraformer",
                    "gpt-sovits",
                ],
                &[],
            ),
            CapabilityRule::new(Capability::Embedding, &["embedding", "embed", "bge-m3", "bge-large"], &[]),
            CapabilityRule::new(Capability::Reranker, &["rerank"], &[]),
            CapabilityRule::new(Capability::Moderation, &["moderation"], &[]),
            CapabilityRule::new(
                Capability::Vision,
                &[
                    "-vl", "vision", "qwen-image", "internvl", "qvq", "glm-4v", "molmo", "llava",
                    "pixtral",
                ],
                &["embedding"],
            ),
        ])
    }
}

impl CapabilityRules {
    pub fn new(rules: Vec<CapabilityRule>) -> Self {
        Self { rules }
    }

    pub fn classify(&self, model_id: &str) -> Capability {
        let lower = model_id.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&lower))
            .map(|rule| rule.capability)
            .unwrap_or(Capability::Language)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let rules = CapabilityRules::default();
        let cases = [
            ("gpt-4o-mini", Capability::Language),
            ("deepseek-chat", Capability::Language),
            ("dall-e-3", Capability::ImageGeneration),
            ("black-forest-labs/FLUX.1-schnell", Capability::ImageGeneration),
            ("whisper-1", Capability::Audio),
            ("tts-1-hd", Capability::Audio),
            ("text-embedding-3-small", Capability::Embedding),
            ("BAAI/bge-m3", Capability::Embedding),
            ("BAAI/bge-reranker-v2-m3", Capability::Reranker),
            ("omni-moderation-latest", Capability::Moderation),
            ("Qwen/Qwen2.5-VL-72B-Instruct", Capability::Vision),
            ("llama-3.2-11b-vision", Capability::Vision),
        ];
        for (id, expected) in cases {
            assert_eq!(rules.classify(id), expected, "{}", id);
        }
    }

    #[test]
    fn test_exclusion_and_order() {
        let rules = CapabilityRules::default();
        // Embedding rule fires before vision; the vision exclusion is a second guard
        assert_eq!(rules.classify("jina-embeddings-v4-vl"), Capability::Embedding);
        // Image generation outranks vision
        assert_eq!(rules.classify("flux-vl-dev"), Capability::ImageGeneration);
    }

    #[test]
    fn test_custom_rules() {
        let rules = CapabilityRules::new(vec![CapabilityRule::new(
            Capability::Vision,
            &["eye"],
            &["blind"],
        )]);
        assert_eq!(rules.classify("big-eye-1"), Capability::Vision);
        assert_eq!(rules.classify("blind-eye"), Capability::Language);
        assert_eq!(rules.classify("dall-e-3"), Capability::Language);
    }
}
