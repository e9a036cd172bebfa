//! Terminal-reason correction.
//!
//! Providers that emit tool calls as plain text also tend to declare a plain
//! `stop` finish reason for them. The decision table here is confidence
//! gated: high-confidence detections always win over the declared reason,
//! medium detections only override stop-like reasons, and low-confidence
//! flags never cause a correction.

use crate::config::NormalizerConfig;
use crate::types::{CorrectionResult, DetectionResult, PrismError, Result, StopReason};

pub fn correct(
    declared: Option<StopReason>,
    detection: &DetectionResult,
    config: &NormalizerConfig,
) -> Result<CorrectionResult> {
    let confidence = detection.confidence;

    let corrected = if confidence >= config.high_confidence {
        StopReason::ToolUse
    } else if confidence >= config.medium_confidence {
        match declared {
            // Medium confidence only overrides reasons that claim a clean
            // stop; an explicit tool-use, truncation, or filter verdict from
            // the provider stands.
            Some(r) if r.is_stop_like() => StopReason::ToolUse,
            Some(r) => r,
            None => StopReason::ToolUse,
        }
    } else {
        match declared {
            Some(r) => r,
            None if detection.has_tool_calls => StopReason::ToolUse,
            // No declared reason and nothing detected: the terminal state
            // was lost upstream. Fabricating a clean stop would mask it.
            None => {
                return Err(PrismError::SilentFailure(
                    "unit ended without a terminal reason and no tool calls were detected"
                        .into(),
                )
                .into())
            }
        }
    };

    let was_corrected = declared != Some(corrected);
    if was_corrected {
        tracing::warn!(
            target: "flight_recorder",
            original = ?declared,
            corrected = config.target_vocabulary.render(corrected),
            confidence,
            "[PROTOCOL MISMATCH] terminal reason corrected against detected tool calls"
        );
    }

    Ok(CorrectionResult {
        original: declared,
        corrected,
        was_corrected,
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(confidence: f32) -> DetectionResult {
        DetectionResult {
            has_tool_calls: confidence >= 0.3,
            candidates: Vec::new(),
            residual_text: Vec::new(),
            confidence,
        }
    }

    #[test]
    fn high_confidence_always_forces_tool_use() {
        let cfg = NormalizerConfig::default();
        for declared in [
            Some(StopReason::EndTurn),
            Some(StopReason::MaxTokens),
            Some(StopReason::ContentFilter),
            None,
        ] {
            let r = correct(declared, &detection(0.95), &cfg).unwrap();
            assert_eq!(r.corrected, StopReason::ToolUse);
        }
        let r = correct(Some(StopReason::EndTurn), &detection(0.95), &cfg).unwrap();
        assert!(r.was_corrected);
        let r = correct(Some(StopReason::ToolUse), &detection(0.95), &cfg).unwrap();
        assert!(!r.was_corrected);
    }

    #[test]
    fn medium_confidence_only_overrides_stop_like() {
        let cfg = NormalizerConfig::default();
        let r = correct(Some(StopReason::EndTurn), &detection(0.5), &cfg).unwrap();
        assert_eq!(r.corrected, StopReason::ToolUse);
        assert!(r.was_corrected);

        let r = correct(Some(StopReason::StopSequence), &detection(0.5), &cfg).unwrap();
        assert_eq!(r.corrected, StopReason::ToolUse);

        let r = correct(Some(StopReason::MaxTokens), &detection(0.5), &cfg).unwrap();
        assert_eq!(r.corrected, StopReason::MaxTokens);
        assert!(!r.was_corrected);

        let r = correct(Some(StopReason::ToolUse), &detection(0.5), &cfg).unwrap();
        assert!(!r.was_corrected);
    }

    #[test]
    fn low_confidence_never_corrects() {
        let cfg = NormalizerConfig::default();
        let r = correct(Some(StopReason::EndTurn), &detection(0.2), &cfg).unwrap();
        assert_eq!(r.corrected, StopReason::EndTurn);
        assert!(!r.was_corrected);
    }

    #[test]
    fn missing_reason_without_detection_is_a_silent_failure() {
        let cfg = NormalizerConfig::default();
        let err = correct(None, &detection(0.0), &cfg).unwrap_err();
        assert!(matches!(err.inner, PrismError::SilentFailure(_)));

        let r = correct(None, &detection(0.5), &cfg).unwrap();
        assert_eq!(r.corrected, StopReason::ToolUse);
    }
}
