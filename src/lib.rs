//! Response normalization core for a chat-completion protocol gateway.
//!
//! Upstream providers disagree about how tool calls and terminal reasons are
//! spelled, and some emit tool calls as plain prose inside the text stream.
//! This crate turns that heterogeneous output, streaming or buffered, into
//! one canonical event family and envelope: tool calls are recovered out of
//! free text across chunk boundaries, terminal reasons are corrected against
//! what was actually detected, token-limit truncations are retried down a
//! reduction ladder, and structurally ambiguous output is rejected instead
//! of passed through.
//!
//! Transport, auth, retry policy, and persistence live in the surrounding
//! gateway; this crate only consumes readers and produces events.

pub mod config;
pub mod correction;
pub mod emitter;
pub mod extract;
pub mod fixer;
pub mod gate;
pub mod logging;
pub mod patterns;
pub mod recovery;
pub mod scanner;
pub mod str_utils;
pub mod streaming;
pub mod token_estimate;
pub mod types;

pub use config::{NormalizerConfig, RecoveryConfig, ResidualTextPolicy};
pub use emitter::{EventEmitter, StreamEvent};
pub use fixer::{fix, normalize_buffered, FixedEnvelope};
pub use patterns::{PatternLibrary, STANDARD_LIBRARY};
pub use scanner::SlidingWindowScanner;
pub use streaming::RequestNormalizer;
pub use types::{
    ContentBlock, ObservedError, PrismError, RequestId, ResponseEnvelope, Result, StopReason,
    TargetVocabulary, Usage,
};
