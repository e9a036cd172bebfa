//! Max-tokens recovery ladder.
//!
//! When the upstream reports a token-limit truncation, the ladder rewrites
//! the outbound request into progressively smaller variants: trim the oldest
//! conversation history first, then additionally swap the system prompt for
//! a short fallback. The first variant whose estimate fits under the limit
//! with headroom wins. The ladder never loops: attempts are bounded by
//! caller-owned per-request state.

use crate::config::{LadderStep, RecoveryConfig};
use crate::token_estimate::estimate_request_tokens;
use crate::types::{Message, OutboundRequest, PrismError, Result, Role};

const PRUNING_MARKER: &str =
    "[earlier conversation pruned to fit the model's context window]";

/// Caller-owned per-request attempt state. Never shared across requests.
#[derive(Debug, Default)]
pub struct RecoveryAttempts {
    calls: u32,
    next_step: usize,
}

impl RecoveryAttempts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn used(&self) -> u32 {
        self.calls
    }
}

#[derive(Debug, Clone)]
pub struct TruncationResult {
    pub request: OutboundRequest,
    pub step_index: usize,
    pub step: LadderStep,
    pub estimated_tokens: usize,
}

/// Produce the next reduced request for a limit-hit retry. Steps already
/// tried by earlier calls on the same `attempts` state are skipped, so a
/// second limit hit continues down the ladder rather than repeating.
pub fn recover(
    request: &OutboundRequest,
    limit: usize,
    config: &RecoveryConfig,
    attempts: &mut RecoveryAttempts,
) -> Result<TruncationResult> {
    if attempts.calls >= config.max_attempts {
        return Err(PrismError::UnrecoverableTokenLimit {
            attempts: attempts.calls,
        }
        .into());
    }
    attempts.calls += 1;

    // Round to the nearest whole token so a fractional headroom does not
    // reject an estimate sitting exactly on the boundary.
    let budget = (limit as f32 * config.headroom).round() as usize;
    let original_estimate = estimate_request_tokens(request);

    for (index, step) in config.ladder.iter().enumerate().skip(attempts.next_step) {
        let reduced = apply_step(request, step, config);
        let estimated = estimate_request_tokens(&reduced);
        tracing::info!(
            target: "prism::recovery",
            step = index,
            retention = step.history_retention_percent,
            simplified = step.use_simplified_prompt,
            original = original_estimate,
            estimated,
            budget,
            "recovery ladder step evaluated"
        );
        if estimated <= budget {
            attempts.next_step = index + 1;
            return Ok(TruncationResult {
                request: reduced,
                step_index: index,
                step: *step,
                estimated_tokens: estimated,
            });
        }
    }

    attempts.next_step = config.ladder.len();
    Err(PrismError::UnrecoverableTokenLimit {
        attempts: attempts.calls,
    }
    .into())
}

fn apply_step(request: &OutboundRequest, step: &LadderStep, config: &RecoveryConfig) -> OutboundRequest {
    let mut reduced = request.clone();

    let keep = ((request.messages.len() * step.history_retention_percent as usize) / 100).max(1);
    if keep < request.messages.len() {
        let dropped = request.messages.len() - keep;
        let mut messages = Vec::with_capacity(keep + 1);
        messages.push(Message {
            role: Role::System,
            content: PRUNING_MARKER.to_string(),
        });
        messages.extend(request.messages[dropped..].iter().cloned());
        reduced.messages = messages;
    }

    if step.use_simplified_prompt {
        reduced.system = Some(config.simplified_prompt.clone());
    }

    reduced
}
