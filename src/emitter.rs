//! Canonical output event family and the per-request emitter that enforces
//! its state machine.
//!
//! Every downstream consumer sees the same event grammar regardless of what
//! the upstream dialect looked like: exactly one `MessageStart`, each content
//! block bracketed by start/stop with deltas in between, one `MessageDelta`
//! carrying the corrected terminal reason and usage, and a `MessageStop` only
//! when the turn did not end in tool use (a tool-use turn continues after the
//! client executes the tools).

use serde::{Deserialize, Serialize};

use crate::types::{
    ContentBlock, PrismError, ResponseEnvelope, Result, StopReason, Usage,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        id: String,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        stop_reason: StopReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    MessageStop,
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        remediation: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Started,
    Stopped,
}

/// Per-request emitter. Constructed fresh for every request; aborting drops
/// all state.
pub struct EventEmitter {
    message_started: bool,
    blocks: Vec<BlockState>,
    delta_sent: bool,
    finished: bool,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            message_started: false,
            blocks: Vec::new(),
            delta_sent: false,
            finished: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.finished {
            return Err(
                PrismError::MalformedUnit("event emitted after message completion".into()).into(),
            );
        }
        Ok(())
    }

    pub fn message_start(&mut self, id: impl Into<String>) -> Result<StreamEvent> {
        self.check_open()?;
        if self.message_started {
            return Err(PrismError::MalformedUnit("duplicate message_start".into()).into());
        }
        self.message_started = true;
        Ok(StreamEvent::MessageStart { id: id.into() })
    }

    /// Opens the next content block, returning its index alongside the event.
    pub fn block_start(&mut self, content_block: ContentBlock) -> Result<(usize, StreamEvent)> {
        self.check_open()?;
        if !self.message_started {
            return Err(
                PrismError::MalformedUnit("content block before message_start".into()).into(),
            );
        }
        if self.blocks.last() == Some(&BlockState::Started) {
            return Err(PrismError::MalformedUnit(
                "content block started while previous block is open".into(),
            )
            .into());
        }
        let index = self.blocks.len();
        self.blocks.push(BlockState::Started);
        Ok((
            index,
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            },
        ))
    }

    pub fn block_delta(&mut self, index: usize, delta: BlockDelta) -> Result<StreamEvent> {
        self.check_open()?;
        if self.blocks.get(index) != Some(&BlockState::Started) {
            return Err(PrismError::MalformedUnit(format!(
                "delta for block {} which is not open",
                index
            ))
            .into());
        }
        Ok(StreamEvent::ContentBlockDelta { index, delta })
    }

    pub fn block_stop(&mut self, index: usize) -> Result<StreamEvent> {
        self.check_open()?;
        if self.blocks.get(index) != Some(&BlockState::Started) {
            return Err(PrismError::MalformedUnit(format!(
                "stop for block {} which is not open",
                index
            ))
            .into());
        }
        self.blocks[index] = BlockState::Stopped;
        Ok(StreamEvent::ContentBlockStop { index })
    }

    /// Emits the terminal metadata and, unless the turn ended in tool use,
    /// the closing `MessageStop`. Consumes the emitter's open state.
    pub fn message_end(
        &mut self,
        stop_reason: StopReason,
        usage: Option<Usage>,
    ) -> Result<Vec<StreamEvent>> {
        self.check_open()?;
        if !self.message_started {
            return Err(
                PrismError::MalformedUnit("message_delta before message_start".into()).into(),
            );
        }
        if self.delta_sent {
            return Err(PrismError::MalformedUnit("duplicate message_delta".into()).into());
        }
        if self.blocks.iter().any(|b| *b == BlockState::Started) {
            return Err(PrismError::MalformedUnit(
                "message completed with an open content block".into(),
            )
            .into());
        }
        self.delta_sent = true;
        self.finished = true;
        let mut events = vec![StreamEvent::MessageDelta { stop_reason, usage }];
        if !stop_reason.is_tool_use() {
            events.push(StreamEvent::MessageStop);
        }
        Ok(events)
    }

    /// Terminal error event. The emitter is unusable afterwards.
    pub fn abort(&mut self, error: &PrismError) -> StreamEvent {
        self.finished = true;
        StreamEvent::Error {
            code: error.code().to_string(),
            message: error.to_string(),
            remediation: error.remediation().map(str::to_string),
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a buffered envelope as the equivalent event sequence.
pub fn emit_envelope(id: &str, envelope: &ResponseEnvelope) -> Result<Vec<StreamEvent>> {
    let mut emitter = EventEmitter::new();
    let mut events = vec![emitter.message_start(id)?];

    for block in &envelope.content {
        match block {
            ContentBlock::Text { text } => {
                let (index, start) = emitter.block_start(ContentBlock::text(""))?;
                events.push(start);
                events.push(emitter.block_delta(
                    index,
                    BlockDelta::TextDelta { text: text.clone() },
                )?);
                events.push(emitter.block_stop(index)?);
            }
            ContentBlock::ToolUse { id, name, input } => {
                let (index, start) = emitter.block_start(ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: serde_json::Value::Object(serde_json::Map::new()),
                })?;
                events.push(start);
                let partial_json = serde_json::to_string(input).map_err(PrismError::from)?;
                events.push(emitter.block_delta(index, BlockDelta::InputJsonDelta { partial_json })?);
                events.push(emitter.block_stop(index)?);
            }
        }
    }

    events.extend(emitter.message_end(envelope.terminal_reason, envelope.usage)?);
    Ok(events)
}

impl ResponseEnvelope {
    /// Reassemble an envelope from a canonical event sequence, validating the
    /// grammar along the way. The inverse of [`emit_envelope`].
    pub fn from_events(events: &[StreamEvent]) -> Result<Self> {
        let mut started = false;
        let mut blocks: Vec<(ContentBlock, bool)> = Vec::new();
        let mut terminal: Option<(StopReason, Option<Usage>)> = None;
        let mut stopped = false;

        for event in events {
            if stopped {
                return Err(
                    PrismError::MalformedUnit("event after message_stop".into()).into(),
                );
            }
            match event {
                StreamEvent::MessageStart { .. } => {
                    if started {
                        return Err(
                            PrismError::MalformedUnit("duplicate message_start".into()).into(),
                        );
                    }
                    started = true;
                }
                StreamEvent::ContentBlockStart {
                    index,
                    content_block,
                } => {
                    if !started || *index != blocks.len() {
                        return Err(PrismError::MalformedUnit(format!(
                            "block {} started out of order",
                            index
                        ))
                        .into());
                    }
                    blocks.push((content_block.clone(), true));
                }
                StreamEvent::ContentBlockDelta { index, delta } => {
                    let (block, open) = blocks.get_mut(*index).ok_or_else(|| {
                        PrismError::MalformedUnit(format!("delta for unknown block {}", index))
                    })?;
                    if !*open {
                        return Err(PrismError::MalformedUnit(format!(
                            "delta for closed block {}",
                            index
                        ))
                        .into());
                    }
                    match (block, delta) {
                        (ContentBlock::Text { text }, BlockDelta::TextDelta { text: d }) => {
                            text.push_str(d);
                        }
                        (
                            ContentBlock::ToolUse { input, .. },
                            BlockDelta::InputJsonDelta { partial_json },
                        ) => {
                            // Accumulate partial JSON as a string until stop.
                            let joined = match input {
                                serde_json::Value::String(s) => format!("{}{}", s, partial_json),
                                _ => partial_json.clone(),
                            };
                            *input = serde_json::Value::String(joined);
                        }
                        _ => {
                            return Err(PrismError::MalformedUnit(format!(
                                "delta kind mismatch for block {}",
                                index
                            ))
                            .into());
                        }
                    }
                }
                StreamEvent::ContentBlockStop { index } => {
                    let (block, open) = blocks.get_mut(*index).ok_or_else(|| {
                        PrismError::MalformedUnit(format!("stop for unknown block {}", index))
                    })?;
                    if !*open {
                        return Err(PrismError::MalformedUnit(format!(
                            "duplicate stop for block {}",
                            index
                        ))
                        .into());
                    }
                    if let ContentBlock::ToolUse { input, .. } = block {
                        let raw = match &*input {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        *input = if raw.trim().is_empty() || raw == "{}" {
                            serde_json::Value::Object(serde_json::Map::new())
                        } else {
                            serde_json::from_str(&raw).map_err(PrismError::from)?
                        };
                    }
                    *open = false;
                }
                StreamEvent::MessageDelta { stop_reason, usage } => {
                    if terminal.is_some() {
                        return Err(
                            PrismError::MalformedUnit("duplicate message_delta".into()).into(),
                        );
                    }
                    if blocks.iter().any(|(_, open)| *open) {
                        return Err(PrismError::MalformedUnit(
                            "message_delta with an open content block".into(),
                        )
                        .into());
                    }
                    terminal = Some((*stop_reason, *usage));
                }
                StreamEvent::MessageStop => {
                    match terminal {
                        Some((reason, _)) if !reason.is_tool_use() => stopped = true,
                        Some(_) => {
                            return Err(PrismError::MalformedUnit(
                                "message_stop on a tool-use turn".into(),
                            )
                            .into());
                        }
                        None => {
                            return Err(PrismError::MalformedUnit(
                                "message_stop before message_delta".into(),
                            )
                            .into());
                        }
                    }
                }
                StreamEvent::Error { code, message, .. } => {
                    return Err(PrismError::MalformedUnit(format!(
                        "stream aborted: {} ({})",
                        message, code
                    ))
                    .into());
                }
            }
        }

        let (terminal_reason, usage) = terminal.ok_or_else(|| {
            PrismError::MalformedUnit("event sequence ended without message_delta".into())
        })?;
        if !started {
            return Err(
                PrismError::MalformedUnit("event sequence without message_start".into()).into(),
            );
        }
        Ok(ResponseEnvelope {
            content: blocks.into_iter().map(|(b, _)| b).collect(),
            usage,
            terminal_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_envelope() -> ResponseEnvelope {
        ResponseEnvelope {
            content: vec![
                ContentBlock::text("Checking the weather."),
                ContentBlock::ToolUse {
                    id: "call_abc123".to_string(),
                    name: "get_weather".to_string(),
                    input: json!({"city": "NYC"}),
                },
            ],
            usage: Some(Usage {
                input_tokens: 12,
                output_tokens: 34,
            }),
            terminal_reason: StopReason::ToolUse,
        }
    }

    #[test]
    fn envelope_round_trips_through_events() {
        let envelope = sample_envelope();
        let events = emit_envelope("msg_1", &envelope).unwrap();
        let back = ResponseEnvelope::from_events(&events).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn tool_use_turn_omits_message_stop() {
        let events = emit_envelope("msg_1", &sample_envelope()).unwrap();
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::MessageStop)));

        let mut end_turn = sample_envelope();
        end_turn.content.truncate(1);
        end_turn.terminal_reason = StopReason::EndTurn;
        let events = emit_envelope("msg_2", &end_turn).unwrap();
        assert!(matches!(events.last(), Some(StreamEvent::MessageStop)));
    }

    #[test]
    fn emitter_rejects_delta_on_closed_block() {
        let mut emitter = EventEmitter::new();
        emitter.message_start("m").unwrap();
        let (index, _) = emitter.block_start(ContentBlock::text("")).unwrap();
        emitter.block_stop(index).unwrap();
        assert!(emitter
            .block_delta(index, BlockDelta::TextDelta { text: "x".into() })
            .is_err());
    }

    #[test]
    fn emitter_rejects_end_with_open_block() {
        let mut emitter = EventEmitter::new();
        emitter.message_start("m").unwrap();
        emitter.block_start(ContentBlock::text("")).unwrap();
        assert!(emitter.message_end(StopReason::EndTurn, None).is_err());
    }

    #[test]
    fn emitter_rejects_duplicate_message_start() {
        let mut emitter = EventEmitter::new();
        emitter.message_start("m").unwrap();
        assert!(emitter.message_start("m").is_err());
    }

    #[test]
    fn abort_event_carries_code_and_remediation() {
        let mut emitter = EventEmitter::new();
        let event = emitter.abort(&PrismError::UnrecoverableTokenLimit { attempts: 2 });
        match event {
            StreamEvent::Error {
                code, remediation, ..
            } => {
                assert_eq!(code, "UNRECOVERABLE_TOKEN_LIMIT");
                assert!(remediation.is_some());
            }
            other => panic!("expected Error, got {:?}", other),
        }
        assert!(emitter.message_start("m").is_err());
    }

    #[test]
    fn tool_block_without_input_delta_closes_as_empty_object() {
        let events = vec![
            StreamEvent::MessageStart { id: "m".into() },
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlock::ToolUse {
                    id: "call_1".into(),
                    name: "noop".into(),
                    input: json!({}),
                },
            },
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageDelta {
                stop_reason: StopReason::ToolUse,
                usage: None,
            },
        ];
        let envelope = ResponseEnvelope::from_events(&events).unwrap();
        match &envelope.content[0] {
            ContentBlock::ToolUse { input, .. } => {
                assert!(input.as_object().map(|m| m.is_empty()).unwrap_or(false));
            }
            other => panic!("expected ToolUse, got {:?}", other),
        }
    }

    #[test]
    fn from_events_rejects_out_of_order_blocks() {
        let events = vec![
            StreamEvent::MessageStart { id: "m".into() },
            StreamEvent::ContentBlockStart {
                index: 1,
                content_block: ContentBlock::text(""),
            },
        ];
        assert!(ResponseEnvelope::from_events(&events).is_err());
    }
}
