//! Per-request streaming pipeline.
//!
//! One `RequestNormalizer` is constructed per upstream stream and dropped
//! with it. It frames SSE lines off the transport, feeds free text through
//! the sliding-window scanner while forwarding it live, accumulates
//! structured tool-call deltas by index, and at end of stream runs the
//! mandatory tail scan, extraction, terminal-reason correction, and the
//! validation gate before closing the canonical event sequence.

use std::collections::BTreeMap;
use std::io;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::config::NormalizerConfig;
use crate::correction;
use crate::emitter::{BlockDelta, EventEmitter, StreamEvent};
use crate::extract::{self, parse_arguments_with_repair};
use crate::gate;
use crate::logging::StreamMetrics;
use crate::patterns::{self, PatternLibrary};
use crate::scanner::SlidingWindowScanner;
use crate::types::{
    ContentBlock, LineEvent, ObservedError, PrismError, ProviderChunk, RequestId,
    ResponseEnvelope, Result, StopReason, ToolCallDelta, ToolUseId, Usage, MAX_LINE_BYTES,
};

/// Structured tool-call fragments accumulated by choice-reported index.
#[derive(Debug, Default)]
struct PendingCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

pub struct RequestNormalizer<'a> {
    request_id: RequestId,
    config: NormalizerConfig,
    scanner: SlidingWindowScanner<'a>,
    emitter: EventEmitter,
    metrics: StreamMetrics,
    text: String,
    text_block: Option<usize>,
    pending_calls: BTreeMap<u32, PendingCall>,
    declared_reason: Option<StopReason>,
    usage: Option<Usage>,
    message_id: Option<String>,
    message_started: bool,
    chunks_seen: usize,
}

impl<'a> RequestNormalizer<'a> {
    pub fn new(
        request_id: RequestId,
        config: NormalizerConfig,
        library: &'a PatternLibrary,
    ) -> Result<Self> {
        config.validate()?;
        let scanner = SlidingWindowScanner::new(library, config.clone());
        let metrics = StreamMetrics::new(request_id.clone());
        Ok(Self {
            request_id,
            config,
            scanner,
            emitter: EventEmitter::new(),
            metrics,
            text: String::new(),
            text_block: None,
            pending_calls: BTreeMap::new(),
            declared_reason: None,
            usage: None,
            message_id: None,
            message_started: false,
            chunks_seen: 0,
        })
    }

    /// Drive the stream to completion: read framed SSE lines from `reader`,
    /// send canonical events over `tx`, and return the buffered envelope.
    /// Any failure emits a terminal `Error` event before returning.
    pub async fn run<R>(
        mut self,
        reader: R,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<ResponseEnvelope>
    where
        R: AsyncRead + Unpin,
    {
        match self.drive(reader, &tx).await {
            Ok(envelope) => {
                self.metrics.log_summary("ok");
                Ok(envelope)
            }
            Err(err) => {
                let event = self.emitter.abort(&err.inner);
                // Best effort: the receiver may already be gone.
                let _ = tx.send(event).await;
                self.metrics.log_summary(err.inner.code());
                Err(err)
            }
        }
    }

    async fn drive<R>(
        &mut self,
        reader: R,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<ResponseEnvelope>
    where
        R: AsyncRead + Unpin,
    {
        let mut framed = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let mut lines_seen = 0usize;

        while let Some(line) = framed.next().await {
            let line = line.map_err(codec_error)?;
            lines_seen += 1;
            if lines_seen > self.config.max_stream_lines {
                return Err(PrismError::MalformedUnit(format!(
                    "stream exceeded {} lines",
                    self.config.max_stream_lines
                ))
                .into());
            }

            let Some(data) = line.strip_prefix("data:") else {
                // SSE comments, event names, and keep-alive blank lines.
                continue;
            };
            match crate::types::parse_upstream_line(data.trim()) {
                LineEvent::Done => break,
                LineEvent::Unknown(_) => continue,
                LineEvent::Error(err) => {
                    return Err(PrismError::MalformedUnit(format!(
                        "upstream error: {}",
                        err.error.message
                    ))
                    .into());
                }
                LineEvent::Chunk(chunk) => {
                    self.ingest_chunk(chunk, tx).await?;
                }
            }
        }

        gate::validate_session(self.chunks_seen)?;
        self.finalize(tx).await
    }

    async fn ingest_chunk(
        &mut self,
        chunk: ProviderChunk,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<()> {
        gate::validate_chunk(&chunk)?;
        self.chunks_seen += 1;
        self.metrics.chunks += 1;
        if self.message_id.is_none() && !chunk.id.is_empty() {
            self.message_id = Some(chunk.id.clone());
        }
        if let Some(usage) = &chunk.usage {
            self.usage = Some(Usage::from(usage));
        }

        for choice in chunk.choices {
            if let Some(raw) = &choice.finish_reason {
                self.declared_reason = Some(StopReason::parse(raw)?);
            }
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    self.ingest_text(&content, tx).await?;
                }
            }
            if let Some(deltas) = choice.delta.tool_calls {
                for delta in deltas {
                    self.ingest_tool_delta(delta);
                }
            }
        }
        Ok(())
    }

    async fn ingest_text(&mut self, content: &str, tx: &mpsc::Sender<StreamEvent>) -> Result<()> {
        self.ensure_message_started(tx).await?;
        let index = match self.text_block {
            Some(index) => index,
            None => {
                let (index, event) = self.emitter.block_start(ContentBlock::text(""))?;
                send(tx, event).await?;
                self.text_block = Some(index);
                index
            }
        };
        let event = self.emitter.block_delta(
            index,
            BlockDelta::TextDelta {
                text: content.to_string(),
            },
        )?;
        send(tx, event).await?;

        self.metrics.text_chars += content.chars().count();
        let detection = self.scanner.update(content);
        if detection.has_tool_calls {
            self.metrics.detections += detection
                .candidates
                .iter()
                .filter(|c| !c.name.is_empty())
                .count();
        }
        self.text.push_str(content);
        Ok(())
    }

    fn ingest_tool_delta(&mut self, delta: ToolCallDelta) {
        let pending = self.pending_calls.entry(delta.index).or_default();
        if let Some(id) = delta.id {
            if !id.is_empty() {
                pending.id = Some(id);
            }
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                pending.name.push_str(&name);
            }
            if let Some(arguments) = function.arguments {
                pending.arguments.push_str(&arguments);
            }
        }
    }

    async fn ensure_message_started(&mut self, tx: &mpsc::Sender<StreamEvent>) -> Result<()> {
        if self.message_started {
            return Ok(());
        }
        let id = self
            .message_id
            .clone()
            .unwrap_or_else(|| self.request_id.0.clone());
        let event = self.emitter.message_start(id)?;
        send(tx, event).await?;
        self.message_started = true;
        Ok(())
    }

    async fn finalize(&mut self, tx: &mpsc::Sender<StreamEvent>) -> Result<ResponseEnvelope> {
        self.ensure_message_started(tx).await?;
        self.scanner.finish();
        if let Some(index) = self.text_block.take() {
            let event = self.emitter.block_stop(index)?;
            send(tx, event).await?;
        }

        let candidates = self.scanner.candidates().to_vec();
        let mut detection =
            patterns::build_detection(&self.text, candidates, self.config.medium_confidence);

        // Structured tool-call deltas, ordered by their reported index.
        let mut structured: Vec<ContentBlock> = Vec::new();
        for (_, pending) in std::mem::take(&mut self.pending_calls) {
            if pending.name.is_empty() {
                tracing::warn!(
                    target: "prism::streaming",
                    request = self.request_id.short(),
                    "structured tool-call delta never received a name; dropped"
                );
                continue;
            }
            let input = match parse_arguments_with_repair(&pending.arguments) {
                Ok(v) => v,
                Err(error) => {
                    tracing::warn!(
                        target: "prism::streaming",
                        request = self.request_id.short(),
                        name = %pending.name,
                        %error,
                        "structured arguments unparseable after repair; emptied"
                    );
                    serde_json::Value::Object(serde_json::Map::new())
                }
            };
            structured.push(ContentBlock::ToolUse {
                id: pending.id.unwrap_or_else(|| ToolUseId::generate().0),
                name: pending.name,
                input,
            });
        }
        if !structured.is_empty() {
            detection.has_tool_calls = true;
            detection.confidence = 1.0;
        }

        let correction = correction::correct(self.declared_reason, &detection, &self.config)?;
        if correction.was_corrected {
            self.metrics.corrections += 1;
        }

        let (mut content, failures) = extract::assemble_content(
            &self.text,
            &detection.candidates,
            self.config.medium_confidence,
            self.config.residual_text,
        );
        for failure in &failures {
            tracing::warn!(
                target: "prism::streaming",
                request = self.request_id.short(),
                name = %failure.name,
                error = %failure.error,
                "candidate failed extraction at end of stream; kept as text"
            );
        }
        content.append(&mut structured);

        // Recovered and structured tool calls are new information for the
        // client; the text itself already streamed live.
        for block in &content {
            if let ContentBlock::ToolUse { id, name, input } = block {
                self.metrics.recovered_tools.push(name.clone());
                let (index, start) = self.emitter.block_start(ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: serde_json::Value::Object(serde_json::Map::new()),
                })?;
                send(tx, start).await?;
                let partial_json = serde_json::to_string(input).map_err(PrismError::from)?;
                let event = self
                    .emitter
                    .block_delta(index, BlockDelta::InputJsonDelta { partial_json })?;
                send(tx, event).await?;
                let event = self.emitter.block_stop(index)?;
                send(tx, event).await?;
            }
        }

        let envelope = ResponseEnvelope {
            content,
            usage: self.usage,
            terminal_reason: correction.corrected,
        };
        gate::validate_envelope(&envelope)?;

        for event in self.emitter.message_end(correction.corrected, self.usage)? {
            send(tx, event).await?;
        }
        Ok(envelope)
    }
}

/// Wrap the receiving half of the event channel as a `Stream` for callers
/// that forward events with stream combinators.
pub fn event_stream(
    rx: mpsc::Receiver<StreamEvent>,
) -> tokio_stream::wrappers::ReceiverStream<StreamEvent> {
    tokio_stream::wrappers::ReceiverStream::new(rx)
}

async fn send(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> Result<()> {
    tx.send(event).await.map_err(|_| {
        ObservedError::from(PrismError::Transport(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "event receiver dropped",
        )))
    })
}

fn codec_error(err: LinesCodecError) -> ObservedError {
    match err {
        LinesCodecError::Io(io_err) => PrismError::Transport(io_err).into(),
        LinesCodecError::MaxLineLengthExceeded => {
            PrismError::MalformedUnit("SSE line exceeded maximum length".into()).into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::STANDARD_LIBRARY;

    async fn run_stream(
        body: &str,
        config: NormalizerConfig,
    ) -> (Result<ResponseEnvelope>, Vec<StreamEvent>) {
        let normalizer = RequestNormalizer::new(
            RequestId::from("req-test".to_string()),
            config,
            &STANDARD_LIBRARY,
        )
        .unwrap();
        let (tx, mut rx) = mpsc::channel(256);
        let result = normalizer.run(body.as_bytes(), tx).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (result, events)
    }

    fn chunk_line(content: &str, finish: Option<&str>) -> String {
        let chunk = serde_json::json!({
            "id": "chunk_1",
            "model": "m",
            "choices": [{
                "delta": {"content": content},
                "finish_reason": finish,
            }],
            "usage": null,
        });
        format!("data: {}\n", chunk)
    }

    #[tokio::test]
    async fn plain_text_stream_passes_through() {
        let body = format!(
            "{}{}data: [DONE]\n",
            chunk_line("Hello ", None),
            chunk_line("world.", Some("stop")),
        );
        let (result, events) = run_stream(&body, NormalizerConfig::default()).await;
        let envelope = result.unwrap();
        assert_eq!(envelope.terminal_reason, StopReason::EndTurn);
        assert_eq!(envelope.content, vec![ContentBlock::text("Hello world.")]);
        assert!(matches!(events.first(), Some(StreamEvent::MessageStart { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::MessageStop)));
    }

    #[tokio::test]
    async fn embedded_tool_call_split_across_chunks_is_recovered() {
        let body = format!(
            "{}{}{}data: [DONE]\n",
            chunk_line("Tool call: get_w", None),
            chunk_line("eather({\"city\": ", None),
            chunk_line("\"NYC\"})", Some("stop")),
        );
        let (result, events) = run_stream(&body, NormalizerConfig::default()).await;
        let envelope = result.unwrap();
        assert_eq!(envelope.terminal_reason, StopReason::ToolUse);
        assert_eq!(envelope.content.len(), 1);
        match &envelope.content[0] {
            ContentBlock::ToolUse { name, input, .. } => {
                assert_eq!(name, "get_weather");
                assert_eq!(input["city"], "NYC");
            }
            other => panic!("expected ToolUse, got {:?}", other),
        }
        // No MessageStop on a tool-use turn.
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::MessageStop)));
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::ContentBlockStart { content_block: ContentBlock::ToolUse { .. }, .. }
        )));
    }

    #[tokio::test]
    async fn structured_tool_deltas_are_accumulated() {
        let first = serde_json::json!({
            "id": "chunk_1",
            "choices": [{
                "delta": {"tool_calls": [{
                    "index": 0,
                    "id": "call_s1",
                    "function": {"name": "grep", "arguments": "{\"pat"}
                }]},
                "finish_reason": null,
            }],
            "usage": null,
        });
        let second = serde_json::json!({
            "id": "chunk_1",
            "choices": [{
                "delta": {"tool_calls": [{
                    "index": 0,
                    "function": {"arguments": "tern\": \"fn main\"}"}
                }]},
                "finish_reason": "tool_calls",
            }],
            "usage": null,
        });
        let body = format!("data: {}\ndata: {}\ndata: [DONE]\n", first, second);
        let (result, _) = run_stream(&body, NormalizerConfig::default()).await;
        let envelope = result.unwrap();
        assert_eq!(envelope.terminal_reason, StopReason::ToolUse);
        assert_eq!(
            envelope.content,
            vec![ContentBlock::ToolUse {
                id: "call_s1".into(),
                name: "grep".into(),
                input: serde_json::json!({"pattern": "fn main"}),
            }]
        );
    }

    #[tokio::test]
    async fn unknown_finish_reason_aborts_with_error_event() {
        let body = format!(
            "{}data: [DONE]\n",
            chunk_line("hello", Some("finished_probably"))
        );
        let (result, events) = run_stream(&body, NormalizerConfig::default()).await;
        let err = result.unwrap_err();
        assert!(matches!(err.inner, PrismError::MalformedUnit(_)));
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error { code, .. }) if code == "MALFORMED_UNIT"
        ));
    }

    #[tokio::test]
    async fn stream_ending_without_finish_reason_is_a_silent_failure() {
        let body = format!(
            "{}{}data: [DONE]\n",
            chunk_line("Hello ", None),
            chunk_line("world.", None),
        );
        let (result, events) = run_stream(&body, NormalizerConfig::default()).await;
        let err = result.unwrap_err();
        assert!(matches!(err.inner, PrismError::SilentFailure(_)));
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error { code, .. }) if code == "SILENT_FAILURE"
        ));
    }

    #[tokio::test]
    async fn zero_chunk_stream_is_a_silent_failure() {
        let body = "data: [DONE]\n";
        let (result, events) = run_stream(body, NormalizerConfig::default()).await;
        let err = result.unwrap_err();
        assert!(matches!(err.inner, PrismError::SilentFailure(_)));
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
    }

    #[tokio::test]
    async fn upstream_error_line_aborts() {
        let body = "data: {\"error\":{\"message\":\"overloaded\",\"code\":529}}\n";
        let (result, _) = run_stream(body, NormalizerConfig::default()).await;
        let err = result.unwrap_err();
        assert!(err.inner.to_string().contains("overloaded"));
    }
}
