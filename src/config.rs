//! Tunables for the normalization core.
//!
//! Everything here is injected by the caller; the core never reads files or
//! environment variables. Defaults mirror observed provider behavior and can
//! be overridden wholesale via deserialization.

use serde::Deserialize;

use crate::types::{PrismError, Result, TargetVocabulary};

/// Policy for narrative text surrounding a tool call the fixer recovered from
/// a text block. Discarding avoids echoing planning narration to the end
/// user; keeping preserves everything the model said.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResidualTextPolicy {
    #[default]
    Discard,
    Keep,
}

/// One rung of the token-limit recovery ladder.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct LadderStep {
    /// Percent of conversation history (most recent first) to keep.
    pub history_retention_percent: u8,
    /// Swap the system prompt for the short fallback prompt.
    pub use_simplified_prompt: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    pub ladder: Vec<LadderStep>,
    /// Hard bound on recovery attempts per logical request.
    pub max_attempts: u32,
    /// A step is accepted when the reduced estimate is <= headroom * limit.
    pub headroom: f32,
    pub simplified_prompt: String,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            ladder: vec![
                LadderStep {
                    history_retention_percent: 80,
                    use_simplified_prompt: false,
                },
                LadderStep {
                    history_retention_percent: 60,
                    use_simplified_prompt: false,
                },
                LadderStep {
                    history_retention_percent: 40,
                    use_simplified_prompt: true,
                },
                LadderStep {
                    history_retention_percent: 20,
                    use_simplified_prompt: true,
                },
            ],
            max_attempts: 2,
            headroom: 0.8,
            simplified_prompt: "You are a helpful assistant. Use the provided tools when needed."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Rolling scan buffer size in characters.
    pub window_size: usize,
    /// Candidates at or above this confidence always force the terminal
    /// reason to tool-use.
    pub high_confidence: f32,
    /// Candidates at or above this confidence are extracted; below it they
    /// only flag a possible boundary split.
    pub medium_confidence: f32,
    pub residual_text: ResidualTextPolicy,
    pub target_vocabulary: TargetVocabulary,
    pub recovery: RecoveryConfig,
    /// Upper bound on SSE lines per stream before the request is aborted.
    pub max_stream_lines: usize,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            window_size: 2000,
            high_confidence: 0.7,
            medium_confidence: 0.3,
            residual_text: ResidualTextPolicy::Discard,
            target_vocabulary: TargetVocabulary::Anthropic,
            recovery: RecoveryConfig::default(),
            max_stream_lines: 100_000,
        }
    }
}

impl NormalizerConfig {
    /// Overlapping-window step. 75% overlap so no pattern shorter than
    /// `3 * window_size / 4` can fall entirely between two window starts.
    pub fn window_step(&self) -> usize {
        (self.window_size / 4).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size < 16 {
            return Err(
                PrismError::InvalidConfig("window_size must be at least 16".into()).into(),
            );
        }
        if !(0.0..=1.0).contains(&self.high_confidence)
            || !(0.0..=1.0).contains(&self.medium_confidence)
        {
            return Err(PrismError::InvalidConfig(
                "confidence thresholds must be within 0..=1".into(),
            )
            .into());
        }
        if self.medium_confidence > self.high_confidence {
            return Err(PrismError::InvalidConfig(
                "medium_confidence must not exceed high_confidence".into(),
            )
            .into());
        }
        if self.recovery.ladder.is_empty() {
            return Err(
                PrismError::InvalidConfig("recovery ladder must not be empty".into()).into(),
            );
        }
        if self
            .recovery
            .ladder
            .iter()
            .any(|s| s.history_retention_percent == 0 || s.history_retention_percent > 100)
        {
            return Err(PrismError::InvalidConfig(
                "ladder retention must be within 1..=100 percent".into(),
            )
            .into());
        }
        Ok(())
    }
}
