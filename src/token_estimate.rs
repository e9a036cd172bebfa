//! Heuristic token estimation.
//!
//! An input signal for the recovery ladder only, never a billing figure.
//! Roughly four characters per token for mixed prose and code, plus a small
//! per-message framing overhead.

use crate::types::OutboundRequest;

const CHARS_PER_TOKEN: usize = 4;
const PER_MESSAGE_OVERHEAD: usize = 4;

pub fn estimate_text_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    chars.div_ceil(CHARS_PER_TOKEN)
}

pub fn estimate_request_tokens(request: &OutboundRequest) -> usize {
    let mut total = 0usize;
    if let Some(system) = &request.system {
        total += estimate_text_tokens(system) + PER_MESSAGE_OVERHEAD;
    }
    for message in &request.messages {
        total += estimate_text_tokens(&message.content) + PER_MESSAGE_OVERHEAD;
    }
    for tool in &request.tools {
        // Tool definitions are sent as serialized JSON schemas.
        let schema_len = serde_json::to_string(&tool.input_schema)
            .map(|s| s.len())
            .unwrap_or(0);
        total += estimate_text_tokens(&tool.name)
            + tool
                .description
                .as_deref()
                .map(estimate_text_tokens)
                .unwrap_or(0)
            + schema_len.div_ceil(CHARS_PER_TOKEN)
            + PER_MESSAGE_OVERHEAD;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, Role};

    #[test]
    fn text_estimate_is_about_four_chars_per_token() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abcd"), 1);
        assert_eq!(estimate_text_tokens("abcde"), 2);
        assert_eq!(estimate_text_tokens(&"x".repeat(4000)), 1000);
    }

    #[test]
    fn request_estimate_counts_all_parts() {
        let request = OutboundRequest {
            model: "m".into(),
            system: Some("x".repeat(400)),
            messages: vec![
                Message {
                    role: Role::User,
                    content: "y".repeat(400),
                },
                Message {
                    role: Role::Assistant,
                    content: "z".repeat(400),
                },
            ],
            tools: Vec::new(),
            max_tokens: None,
        };
        // 3 * (100 + 4)
        assert_eq!(estimate_request_tokens(&request), 312);
    }
}
