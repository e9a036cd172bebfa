//! Buffered response fixer.
//!
//! Takes a fully-buffered envelope (or a raw provider response) and returns a
//! structurally valid envelope plus an audit trail of every fix applied.
//! Running the fixer on its own output applies no further fixes.

use std::collections::HashSet;

use serde_json::Value;

use crate::config::NormalizerConfig;
use crate::correction;
use crate::extract::{self, parse_arguments_with_repair};
use crate::gate;
use crate::patterns::{self, PatternLibrary};
use crate::types::{
    ContentBlock, PrismError, ProviderResponse, ResponseEnvelope, Result, StopReason, ToolUseId,
    Usage,
};

const DEFAULT_TOOL_NAME: &str = "unnamed_tool";

#[derive(Debug, Clone, PartialEq)]
pub enum AppliedFix {
    /// String-typed or empty tool input materialized into a JSON object.
    InputMaterialized { id: String },
    /// Input that failed every repair rung replaced with an empty object.
    InputEmptied { id: String },
    IdGenerated { name: String },
    NameDefaulted { id: String },
    DuplicateIdRegenerated { old: String, new: String },
    /// A tool call recovered out of a text block by the pattern library.
    ToolCallRecovered { name: String, method: String },
    EmptyTextDropped,
    TerminalReasonCorrected {
        from: Option<StopReason>,
        to: StopReason,
    },
}

#[derive(Debug, Clone)]
pub struct FixedEnvelope {
    pub envelope: ResponseEnvelope,
    pub fixes: Vec<AppliedFix>,
}

/// Normalize one buffered upstream response end to end: convert the wire
/// shape, then run the fix pass and the validation gate.
pub fn normalize_buffered(
    response: &ProviderResponse,
    config: &NormalizerConfig,
    library: &PatternLibrary,
) -> Result<FixedEnvelope> {
    let choice = response
        .choices
        .first()
        .ok_or_else(|| PrismError::MalformedUnit("response has no choices".into()))?;

    let mut content = Vec::new();
    if let Some(text) = &choice.message.content {
        if !text.is_empty() {
            content.push(ContentBlock::text(text.clone()));
        }
    }
    for call in &choice.message.tool_calls {
        let function = call.function.as_ref();
        content.push(ContentBlock::ToolUse {
            id: call.id.clone().unwrap_or_default(),
            name: function.and_then(|f| f.name.clone()).unwrap_or_default(),
            input: Value::String(
                function
                    .and_then(|f| f.arguments.clone())
                    .unwrap_or_default(),
            ),
        });
    }

    let declared = match &choice.finish_reason {
        Some(raw) => Some(StopReason::parse(raw)?),
        None => None,
    };

    let envelope = ResponseEnvelope {
        content,
        usage: response.usage.as_ref().map(Usage::from),
        terminal_reason: declared.unwrap_or(StopReason::EndTurn),
    };

    let fixed = fix_with_declared(envelope, declared, config, library)?;
    gate::validate_envelope(&fixed.envelope)?;
    Ok(fixed)
}

/// Fix an already-canonical envelope in place. Idempotent: a second pass over
/// the output applies no fixes.
pub fn fix(
    envelope: ResponseEnvelope,
    config: &NormalizerConfig,
    library: &PatternLibrary,
) -> Result<FixedEnvelope> {
    let declared = Some(envelope.terminal_reason);
    fix_with_declared(envelope, declared, config, library)
}

fn fix_with_declared(
    envelope: ResponseEnvelope,
    declared: Option<StopReason>,
    config: &NormalizerConfig,
    library: &PatternLibrary,
) -> Result<FixedEnvelope> {
    let mut fixes = Vec::new();
    let mut blocks: Vec<ContentBlock> = Vec::new();
    let mut recovered_confidence = 0.0_f32;

    for block in envelope.content {
        match block {
            ContentBlock::Text { text } => {
                if text.trim().is_empty() {
                    fixes.push(AppliedFix::EmptyTextDropped);
                    continue;
                }
                let candidates = library.find_candidates(&text);
                let detection =
                    patterns::build_detection(&text, candidates, config.medium_confidence);
                if detection.has_tool_calls {
                    recovered_confidence = recovered_confidence.max(detection.confidence);
                    let (mut replaced, failures) = extract::assemble_content(
                        &text,
                        &detection.candidates,
                        config.medium_confidence,
                        config.residual_text,
                    );
                    for block in &replaced {
                        if let ContentBlock::ToolUse { name, .. } = block {
                            let method = detection
                                .candidates
                                .iter()
                                .find(|c| c.name == *name)
                                .map(|c| c.method)
                                .unwrap_or("unknown_method");
                            fixes.push(AppliedFix::ToolCallRecovered {
                                name: name.clone(),
                                method: method.to_string(),
                            });
                        }
                    }
                    for failure in &failures {
                        tracing::warn!(
                            target: "prism::fixer",
                            name = %failure.name,
                            error = %failure.error,
                            "recovered candidate failed extraction; span kept as text"
                        );
                    }
                    blocks.append(&mut replaced);
                } else {
                    blocks.push(ContentBlock::text(text));
                }
            }
            ContentBlock::ToolUse { id, name, input } => {
                let mut fixed_id = id;
                let mut fixed_name = name;
                if fixed_id.is_empty() {
                    fixed_id = ToolUseId::generate().0;
                    fixes.push(AppliedFix::IdGenerated {
                        name: fixed_name.clone(),
                    });
                }
                if fixed_name.is_empty() {
                    fixed_name = DEFAULT_TOOL_NAME.to_string();
                    fixes.push(AppliedFix::NameDefaulted {
                        id: fixed_id.clone(),
                    });
                }
                let fixed_input = match input {
                    Value::Object(map) => Value::Object(map),
                    Value::String(raw) => match parse_arguments_with_repair(&raw) {
                        Ok(parsed) => {
                            fixes.push(AppliedFix::InputMaterialized {
                                id: fixed_id.clone(),
                            });
                            parsed
                        }
                        Err(error) => {
                            tracing::warn!(
                                target: "prism::fixer",
                                id = %fixed_id,
                                %error,
                                "tool input unparseable after repair; emptied"
                            );
                            fixes.push(AppliedFix::InputEmptied {
                                id: fixed_id.clone(),
                            });
                            Value::Object(serde_json::Map::new())
                        }
                    },
                    Value::Null => {
                        fixes.push(AppliedFix::InputMaterialized {
                            id: fixed_id.clone(),
                        });
                        Value::Object(serde_json::Map::new())
                    }
                    other => {
                        tracing::warn!(
                            target: "prism::fixer",
                            id = %fixed_id,
                            "non-object tool input {} replaced with empty object",
                            other
                        );
                        fixes.push(AppliedFix::InputEmptied {
                            id: fixed_id.clone(),
                        });
                        Value::Object(serde_json::Map::new())
                    }
                };
                blocks.push(ContentBlock::ToolUse {
                    id: fixed_id,
                    name: fixed_name,
                    input: fixed_input,
                });
            }
        }
    }

    // Duplicate tool ids break clients that key results by id.
    let mut seen: HashSet<String> = HashSet::new();
    for block in &mut blocks {
        if let ContentBlock::ToolUse { id, .. } = block {
            if !seen.insert(id.clone()) {
                let new_id = ToolUseId::generate().0;
                fixes.push(AppliedFix::DuplicateIdRegenerated {
                    old: id.clone(),
                    new: new_id.clone(),
                });
                seen.insert(new_id.clone());
                *id = new_id;
            }
        }
    }

    let has_tool_use = blocks
        .iter()
        .any(|b| matches!(b, ContentBlock::ToolUse { .. }));
    let detection_confidence = if !has_tool_use {
        0.0
    } else if recovered_confidence > 0.0 {
        recovered_confidence
    } else {
        // Structured tool calls that arrived pre-parsed are certain.
        1.0
    };
    let detection = crate::types::DetectionResult {
        has_tool_calls: has_tool_use,
        candidates: Vec::new(),
        residual_text: Vec::new(),
        confidence: detection_confidence,
    };
    let correction = correction::correct(declared, &detection, config)?;
    if correction.was_corrected {
        fixes.push(AppliedFix::TerminalReasonCorrected {
            from: correction.original,
            to: correction.corrected,
        });
    }

    Ok(FixedEnvelope {
        envelope: ResponseEnvelope {
            content: blocks,
            usage: envelope.usage,
            terminal_reason: correction.corrected,
        },
        fixes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::STANDARD_LIBRARY;
    use serde_json::json;

    fn cfg() -> NormalizerConfig {
        NormalizerConfig::default()
    }

    #[test]
    fn string_input_is_materialized() {
        let envelope = ResponseEnvelope {
            content: vec![ContentBlock::ToolUse {
                id: "call_1".into(),
                name: "get_weather".into(),
                input: Value::String(r#"{"city": "NYC"}"#.into()),
            }],
            usage: None,
            terminal_reason: StopReason::ToolUse,
        };
        let fixed = fix(envelope, &cfg(), &STANDARD_LIBRARY).unwrap();
        assert_eq!(
            fixed.envelope.content[0],
            ContentBlock::ToolUse {
                id: "call_1".into(),
                name: "get_weather".into(),
                input: json!({"city": "NYC"}),
            }
        );
        assert!(fixed
            .fixes
            .contains(&AppliedFix::InputMaterialized { id: "call_1".into() }));
    }

    #[test]
    fn missing_id_and_name_get_defaults() {
        let envelope = ResponseEnvelope {
            content: vec![ContentBlock::ToolUse {
                id: String::new(),
                name: String::new(),
                input: json!({}),
            }],
            usage: None,
            terminal_reason: StopReason::ToolUse,
        };
        let fixed = fix(envelope, &cfg(), &STANDARD_LIBRARY).unwrap();
        match &fixed.envelope.content[0] {
            ContentBlock::ToolUse { id, name, .. } => {
                assert!(id.starts_with("call_"));
                assert_eq!(name, DEFAULT_TOOL_NAME);
            }
            other => panic!("expected ToolUse, got {:?}", other),
        }
        assert_eq!(fixed.fixes.len(), 2);
    }

    #[test]
    fn embedded_tool_call_replaces_text_block() {
        let envelope = ResponseEnvelope {
            content: vec![ContentBlock::text(
                r#"Sure. Tool call: get_weather({"city": "NYC"})"#,
            )],
            usage: None,
            terminal_reason: StopReason::EndTurn,
        };
        let fixed = fix(envelope, &cfg(), &STANDARD_LIBRARY).unwrap();
        assert_eq!(fixed.envelope.content.len(), 1);
        assert!(matches!(
            fixed.envelope.content[0],
            ContentBlock::ToolUse { .. }
        ));
        assert_eq!(fixed.envelope.terminal_reason, StopReason::ToolUse);
        assert!(fixed.fixes.iter().any(|f| matches!(
            f,
            AppliedFix::ToolCallRecovered { name, .. } if name == "get_weather"
        )));
        assert!(fixed.fixes.iter().any(|f| matches!(
            f,
            AppliedFix::TerminalReasonCorrected { .. }
        )));
    }

    #[test]
    fn duplicate_ids_are_regenerated() {
        let envelope = ResponseEnvelope {
            content: vec![
                ContentBlock::ToolUse {
                    id: "call_dup".into(),
                    name: "a".into(),
                    input: json!({}),
                },
                ContentBlock::ToolUse {
                    id: "call_dup".into(),
                    name: "b".into(),
                    input: json!({}),
                },
            ],
            usage: None,
            terminal_reason: StopReason::ToolUse,
        };
        let fixed = fix(envelope, &cfg(), &STANDARD_LIBRARY).unwrap();
        let ids: Vec<&str> = fixed
            .envelope
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn fixer_is_idempotent() {
        let envelope = ResponseEnvelope {
            content: vec![
                ContentBlock::text(r#"Tool call: get_weather({"city": "NYC"}) done"#),
                ContentBlock::ToolUse {
                    id: String::new(),
                    name: "grep".into(),
                    input: Value::String(r#"{"pattern": "x"}"#.into()),
                },
            ],
            usage: None,
            terminal_reason: StopReason::EndTurn,
        };
        let once = fix(envelope, &cfg(), &STANDARD_LIBRARY).unwrap();
        assert!(!once.fixes.is_empty());
        let twice = fix(once.envelope.clone(), &cfg(), &STANDARD_LIBRARY).unwrap();
        assert!(twice.fixes.is_empty(), "second pass applied {:?}", twice.fixes);
        assert_eq!(twice.envelope, once.envelope);
    }

    #[test]
    fn empty_text_blocks_are_dropped() {
        let envelope = ResponseEnvelope {
            content: vec![ContentBlock::text("  \n "), ContentBlock::text("real")],
            usage: None,
            terminal_reason: StopReason::EndTurn,
        };
        let fixed = fix(envelope, &cfg(), &STANDARD_LIBRARY).unwrap();
        assert_eq!(fixed.envelope.content, vec![ContentBlock::text("real")]);
        assert!(fixed.fixes.contains(&AppliedFix::EmptyTextDropped));
    }

    #[test]
    fn missing_finish_reason_without_tools_is_a_silent_failure() {
        let raw = r#"{
            "id": "resp_2",
            "model": "m",
            "choices": [{
                "message": {"content": "All done.", "tool_calls": []},
                "finish_reason": null
            }]
        }"#;
        let response: ProviderResponse = serde_json::from_str(raw).unwrap();
        let err = normalize_buffered(&response, &cfg(), &STANDARD_LIBRARY).unwrap_err();
        assert!(matches!(err.inner, PrismError::SilentFailure(_)));
    }

    #[test]
    fn missing_finish_reason_with_structured_tools_corrects_to_tool_use() {
        let raw = r#"{
            "id": "resp_3",
            "model": "m",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_7",
                        "function": {"name": "grep", "arguments": "{}"}
                    }]
                },
                "finish_reason": null
            }]
        }"#;
        let response: ProviderResponse = serde_json::from_str(raw).unwrap();
        let fixed = normalize_buffered(&response, &cfg(), &STANDARD_LIBRARY).unwrap();
        assert_eq!(fixed.envelope.terminal_reason, StopReason::ToolUse);
    }

    #[test]
    fn normalize_buffered_converts_wire_shape() {
        let raw = r#"{
            "id": "resp_1",
            "model": "m",
            "choices": [{
                "message": {
                    "content": "On it.",
                    "tool_calls": [{
                        "id": "call_9",
                        "function": {"name": "grep", "arguments": "{\"pattern\": \"fn\"}"}
                    }]
                },
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12}
        }"#;
        let response: ProviderResponse = serde_json::from_str(raw).unwrap();
        let fixed = normalize_buffered(&response, &cfg(), &STANDARD_LIBRARY).unwrap();
        assert_eq!(fixed.envelope.terminal_reason, StopReason::ToolUse);
        assert_eq!(fixed.envelope.content.len(), 2);
        assert_eq!(
            fixed.envelope.usage,
            Some(Usage {
                input_tokens: 5,
                output_tokens: 7
            })
        );
    }
}
