//! Observability helpers.
//!
//! Structured `tracing` only; there is no metrics backend. Each request
//! carries a `StreamMetrics` record that is written to the flight recorder
//! when the stream finishes, successfully or not.

use std::time::Instant;

use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::types::RequestId;

/// Install the global subscriber. Intended for binaries and integration
/// tests; library callers bring their own subscriber.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(ErrorLayer::default())
        .try_init();
}

/// Per-request counters for the end-of-stream summary line.
#[derive(Debug)]
pub struct StreamMetrics {
    pub request_id: RequestId,
    pub chunks: usize,
    pub text_chars: usize,
    pub detections: usize,
    pub corrections: usize,
    pub recovered_tools: Vec<String>,
    started: Instant,
}

impl StreamMetrics {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            chunks: 0,
            text_chars: 0,
            detections: 0,
            corrections: 0,
            recovered_tools: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn log_summary(&self, outcome: &str) {
        tracing::info!(
            target: "flight_recorder",
            request = self.request_id.short(),
            outcome,
            chunks = self.chunks,
            text_chars = self.text_chars,
            detections = self.detections,
            corrections = self.corrections,
            recovered = ?self.recovered_tools,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "stream summary"
        );
    }
}
