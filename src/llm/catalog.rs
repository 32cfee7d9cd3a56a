//! Feature routing vocabulary and built-in default chains.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmFeature {
    GlobalDefault,
    BriefingNarrative,
    IntakeExtraction,
}

impl LlmFeature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GlobalDefault => "global_default",
            Self::BriefingNarrative => "briefing_narrative",
            Self::IntakeExtraction => "intake_extraction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "global_default" => Some(Self::GlobalDefault),
            "briefing_narrative" => Some(Self::BriefingNarrative),
            "intake_extraction" => Some(Self::IntakeExtraction),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    Openai,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Openai => "openai",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Some(Self::Anthropic),
            "openai" => Some(Self::Openai),
            _ => None,
        }
    }
}

/// Where a resolved model came from, recorded on every usage event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    FeatureOverride,
    GlobalDefault,
    Default,
}

impl ModelSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FeatureOverride => "feature_override",
            Self::GlobalDefault => "global_default",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEntry {
    pub provider: Provider,
    pub model_id: &'static str,
}

const NARRATIVE_CHAIN: &[ChainEntry] = &[
    ChainEntry {
        provider: Provider::Anthropic,
        model_id: "claude-3-5-haiku-latest",
    },
    ChainEntry {
        provider: Provider::Openai,
        model_id: "gpt-4o-mini",
    },
];

const EXTRACTION_CHAIN: &[ChainEntry] = &[
    ChainEntry {
        provider: Provider::Openai,
        model_id: "gpt-4o-mini",
    },
    ChainEntry {
        provider: Provider::Anthropic,
        model_id: "claude-3-5-haiku-latest",
    },
];

/// Built-in fallback chain per feature. `global_default` routes like the
/// narrative chain.
pub fn default_chain(feature: LlmFeature) -> &'static [ChainEntry] {
    match feature {
        LlmFeature::BriefingNarrative | LlmFeature::GlobalDefault => NARRATIVE_CHAIN,
        LlmFeature::IntakeExtraction => EXTRACTION_CHAIN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_round_trips() {
        for f in [
            LlmFeature::GlobalDefault,
            LlmFeature::BriefingNarrative,
            LlmFeature::IntakeExtraction,
        ] {
            assert_eq!(LlmFeature::parse(f.as_str()), Some(f));
        }
    }

    #[test]
    fn chains_cover_both_providers() {
        for feature in [LlmFeature::BriefingNarrative, LlmFeature::IntakeExtraction] {
            let chain = default_chain(feature);
            assert!(chain.len() >= 2);
            assert!(chain.iter().any(|c| c.provider == Provider::Anthropic));
            assert!(chain.iter().any(|c| c.provider == Provider::Openai));
        }
    }
}
