use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

/// --- IDENTIFIERS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ToolUseId(pub String);

impl ToolUseId {
    pub fn generate() -> Self {
        Self(format!("call_{}", Uuid::new_v4().simple()))
    }
}

impl Default for ToolUseId {
    fn default() -> Self {
        Self::generate()
    }
}

impl From<String> for ToolUseId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ToolUseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// --- ERRORS ---

#[derive(Error, Debug)]
pub enum PrismError {
    /// A chunk or response failed basic structural shape checks. Fatal.
    #[error("Malformed unit: {0}")]
    MalformedUnit(String),

    /// Empty content, missing terminal reason, or a sentinel fallback value
    /// where a real value was required. Fatal; this is the core guarantee.
    #[error("Silent failure detected: {0}")]
    SilentFailure(String),

    /// A candidate tool call could not be parsed even after repair.
    /// Recovered locally (degrade to text); never surfaced to the caller.
    #[error("Extraction failed: {0}")]
    Extraction(String),

    /// Upstream reported a token-limit truncation; recoverable via the ladder.
    #[error("Token limit exceeded: estimated {estimated} tokens against limit {limit}")]
    TokenLimit { estimated: usize, limit: usize },

    /// The recovery ladder was exhausted.
    #[error(
        "Token limit unrecoverable after {attempts} attempt(s): \
         reduce input length or increase the token limit"
    )]
    UnrecoverableTokenLimit { attempts: u32 },

    /// Passed through from the transport collaborator unchanged.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PrismError {
    /// Stable machine-readable classification code, surfaced on error events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedUnit(_) => "MALFORMED_UNIT",
            Self::SilentFailure(_) => "SILENT_FAILURE",
            Self::Extraction(_) => "EXTRACTION_FAILURE",
            Self::TokenLimit { .. } => "TOKEN_LIMIT",
            Self::UnrecoverableTokenLimit { .. } => "UNRECOVERABLE_TOKEN_LIMIT",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
        }
    }

    /// Remediation hint shown to the client where one exists.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Self::UnrecoverableTokenLimit { .. } | Self::TokenLimit { .. } => {
                Some("reduce input length or increase the token limit")
            }
            _ => None,
        }
    }
}

/// An error annotated with the span trace captured at creation.
#[derive(Debug)]
pub struct ObservedError {
    pub inner: PrismError,
    pub span_trace: SpanTrace,
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<PrismError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- TERMINAL REASONS ---

/// Abstract terminal-state vocabulary. Provider-specific spellings are mapped
/// in and out explicitly; an unknown spelling is a classified error, never a
/// guess.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    ContentFilter,
}

impl StopReason {
    /// Total mapping from known provider spellings.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "stop" | "end_turn" | "completed" | "done" => Ok(Self::EndTurn),
            "tool_calls" | "tool_use" | "function_call" => Ok(Self::ToolUse),
            "length" | "max_tokens" | "max_output_tokens" | "token_limit" => Ok(Self::MaxTokens),
            "stop_sequence" => Ok(Self::StopSequence),
            "content_filter" | "safety" => Ok(Self::ContentFilter),
            other => Err(PrismError::MalformedUnit(format!(
                "unknown terminal reason '{}'",
                other
            ))
            .into()),
        }
    }

    pub fn is_stop_like(&self) -> bool {
        matches!(self, Self::EndTurn | Self::StopSequence)
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse)
    }
}

/// Downstream dialect a terminal reason must be rendered into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetVocabulary {
    #[default]
    Anthropic,
    OpenAi,
}

impl TargetVocabulary {
    pub fn render(&self, reason: StopReason) -> &'static str {
        match self {
            Self::Anthropic => match reason {
                StopReason::EndTurn => "end_turn",
                StopReason::ToolUse => "tool_use",
                StopReason::MaxTokens => "max_tokens",
                StopReason::StopSequence => "stop_sequence",
                StopReason::ContentFilter => "content_filter",
            },
            Self::OpenAi => match reason {
                StopReason::EndTurn => "stop",
                StopReason::ToolUse => "tool_calls",
                StopReason::MaxTokens => "length",
                StopReason::StopSequence => "stop",
                StopReason::ContentFilter => "content_filter",
            },
        }
    }

    pub fn tool_use_value(&self) -> &'static str {
        self.render(StopReason::ToolUse)
    }
}

/// --- CANONICAL OUTPUT MODEL ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// `input` is always a materialized JSON object in final output; the
    /// fixer normalizes string-typed or empty inputs before anything leaves
    /// the core.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

impl ContentBlock {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text { text: s.into() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// The canonical buffered output of the core. Content ordering matches the
/// original text order: recovered tool calls replace the span they were
/// extracted from and surrounding text order is preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub terminal_reason: StopReason,
}

/// --- DETECTION MODEL ---

/// One pattern match inside a text unit. Spans are byte offsets into the
/// logical full text of the response (absolute across chunk boundaries).
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallCandidate {
    pub start: usize,
    pub end: usize,
    pub name: String,
    pub raw_arguments: String,
    pub confidence: f32,
    pub method: &'static str,
}

impl ToolCallCandidate {
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end
    }
}

/// Result of scanning one text unit (a chunk, or the full buffer).
#[derive(Debug, Clone, Default)]
pub struct DetectionResult {
    pub has_tool_calls: bool,
    pub candidates: Vec<ToolCallCandidate>,
    pub residual_text: Vec<String>,
    /// Max confidence across surviving candidates after exclusion filtering.
    pub confidence: f32,
}

/// Outcome of the terminal-reason correction pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrectionResult {
    pub original: Option<StopReason>,
    pub corrected: StopReason,
    pub was_corrected: bool,
    pub confidence: f32,
}

/// --- OUTBOUND REQUEST MODEL (recovery input) ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// The request shape the recovery ladder reduces. The transport layer owns
/// issuing it; this core only rewrites it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// --- UPSTREAM WIRE TYPES ---

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ProviderChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    pub usage: Option<ProviderUsage>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ChunkChoice {
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: u32,
    pub id: Option<String>,
    pub function: Option<DeltaFunction>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DeltaFunction {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ProviderUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl From<&ProviderUsage> for Usage {
    fn from(u: &ProviderUsage) -> Self {
        Self {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }
    }
}

/// A fully-buffered (non-streaming) upstream response.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ProviderResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ResponseChoice>,
    pub usage: Option<ProviderUsage>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ResponseChoice {
    pub message: ResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ResponseMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ResponseToolCall>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ResponseToolCall {
    pub id: Option<String>,
    pub function: Option<DeltaFunction>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct UpstreamError {
    pub error: UpstreamErrorDetails,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct UpstreamErrorDetails {
    pub message: String,
    pub code: Option<u16>,
}

/// One parsed SSE data line from the upstream stream.
#[derive(Debug)]
pub enum LineEvent {
    Chunk(ProviderChunk),
    Error(UpstreamError),
    Done,
    Unknown(String),
}

/// Upper bound on a single upstream SSE line, shared by the line classifier
/// and the streaming codec.
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

pub fn parse_upstream_line(data: &str) -> LineEvent {
    if data == "[DONE]" {
        return LineEvent::Done;
    }
    if data.len() > MAX_LINE_BYTES {
        return LineEvent::Error(UpstreamError {
            error: UpstreamErrorDetails {
                message: format!("chunk too large: {} bytes", data.len()),
                code: Some(413),
            },
        });
    }
    // Error first: it is the more specific shape (requires an "error" key).
    if let Ok(err) = serde_json::from_str::<UpstreamError>(data) {
        return LineEvent::Error(err);
    }
    if let Ok(chunk) = serde_json::from_str::<ProviderChunk>(data) {
        if !chunk.choices.is_empty() || chunk.usage.is_some() {
            return LineEvent::Chunk(chunk);
        }
    }
    let snippet = crate::str_utils::prefix_chars(data, 200);
    tracing::debug!(target: "prism::ingest", "unknown line format: {}", snippet);
    LineEvent::Unknown(data.to_string())
}
