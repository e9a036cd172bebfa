//! Anti-silent-failure gate.
//!
//! Nothing structurally ambiguous passes through: empty content where content
//! was expected, sentinel fallback strings standing in for real values, and
//! zero-chunk sessions all become classified errors here instead of quietly
//! degrading downstream.

use crate::types::{ContentBlock, PrismError, ProviderChunk, ResponseEnvelope, Result};

/// Placeholder strings some upstreams emit instead of failing honestly.
const SENTINELS: &[&str] = &["unknown", "default"];

pub fn is_sentinel(value: &str) -> bool {
    value.is_empty() || SENTINELS.contains(&value.trim().to_lowercase().as_str())
}

pub fn validate_chunk(chunk: &ProviderChunk) -> Result<()> {
    if chunk.choices.is_empty() && chunk.usage.is_none() {
        return Err(PrismError::MalformedUnit(
            "chunk carries neither choices nor usage".into(),
        )
        .into());
    }
    for choice in &chunk.choices {
        if let Some(reason) = &choice.finish_reason {
            if is_sentinel(reason) {
                return Err(PrismError::SilentFailure(format!(
                    "sentinel finish_reason '{}' in chunk '{}'",
                    reason, chunk.id
                ))
                .into());
            }
        }
    }
    Ok(())
}

pub fn validate_envelope(envelope: &ResponseEnvelope) -> Result<()> {
    if envelope.content.is_empty() {
        return Err(PrismError::SilentFailure(
            "envelope has no content blocks".into(),
        )
        .into());
    }
    for block in &envelope.content {
        match block {
            ContentBlock::Text { text } => {
                if text.trim().is_empty() {
                    return Err(PrismError::SilentFailure(
                        "envelope contains an empty text block".into(),
                    )
                    .into());
                }
            }
            ContentBlock::ToolUse { id, name, input } => {
                if is_sentinel(id) || is_sentinel(name) {
                    return Err(PrismError::SilentFailure(format!(
                        "tool use with sentinel id '{}' or name '{}'",
                        id, name
                    ))
                    .into());
                }
                if !input.is_object() {
                    return Err(PrismError::MalformedUnit(format!(
                        "tool use '{}' input is not an object",
                        id
                    ))
                    .into());
                }
            }
        }
    }
    Ok(())
}

/// A streaming session that produced zero chunks is an upstream failure, not
/// an empty success.
pub fn validate_session(chunks_seen: usize) -> Result<()> {
    if chunks_seen == 0 {
        return Err(PrismError::SilentFailure(
            "stream ended without producing any chunks".into(),
        )
        .into());
    }
    Ok(())
}
