//! Candidate extraction and JSON argument repair.
//!
//! Providers that emit tool calls as prose rarely emit clean JSON with them.
//! The repair ladder here is ordered from least to most invasive and the
//! parse is retried after every rung. When every rung fails the candidate
//! degrades to plain text and the failure is recorded, never dropped.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::ResidualTextPolicy;
use crate::str_utils;
use crate::types::{ContentBlock, ToolCallCandidate, ToolUseId};

/// Byte offset one past the closing brace of the JSON object opening at
/// `open`, tracking string literals and escapes. None when the object never
/// closes within `text`.
pub fn balanced_object_end(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(open) != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if *b == b'\\' {
                escaped = true;
            } else if *b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Escape raw control characters that appear inside string literals. Models
/// frequently emit literal newlines inside argument strings.
fn escape_control_chars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in input.chars() {
        if in_string {
            if escaped {
                out.push(ch);
                escaped = false;
                continue;
            }
            match ch {
                '\\' => {
                    out.push(ch);
                    escaped = true;
                }
                '"' => {
                    out.push(ch);
                    in_string = false;
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 => {
                    out.push_str(&format!("\\u{:04x}", c as u32));
                }
                c => out.push(c),
            }
        } else {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
        }
    }
    out
}

/// Rewrite language-native literals to their JSON spellings outside string
/// literals: `True`/`False`/`None`/`undefined`, and single-quoted strings.
fn rewrite_language_literals(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_double = false;
    let mut escaped = false;
    while let Some(ch) = chars.next() {
        if in_double {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_double = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_double = true;
                out.push(ch);
            }
            '\'' => {
                // Single-quoted string: re-emit double-quoted.
                out.push('"');
                let mut inner_escaped = false;
                for c in chars.by_ref() {
                    if inner_escaped {
                        if c == '\'' {
                            out.push('\'');
                        } else {
                            out.push('\\');
                            out.push(c);
                        }
                        inner_escaped = false;
                    } else if c == '\\' {
                        inner_escaped = true;
                    } else if c == '\'' {
                        break;
                    } else if c == '"' {
                        out.push_str("\\\"");
                    } else {
                        out.push(c);
                    }
                }
                out.push('"');
            }
            c if c.is_ascii_alphabetic() => {
                let mut word = String::new();
                word.push(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.as_str() {
                    "True" => out.push_str("true"),
                    "False" => out.push_str("false"),
                    "None" | "undefined" => out.push_str("null"),
                    other => out.push_str(other),
                }
            }
            c => out.push(c),
        }
    }
    out
}

/// Close unterminated strings and unmatched braces/brackets by appending the
/// missing closers in stack order.
fn balance_delimiters(input: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in input.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }
    let mut out = input.trim_end().to_string();
    if in_string {
        out.push('"');
    }
    // Dangling key or comma before closure parses as nothing useful; drop it.
    while out.ends_with(',') || out.ends_with(':') {
        out.pop();
        while out.ends_with(char::is_whitespace) {
            out.pop();
        }
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// Parse `raw` as a JSON object, applying the repair ladder on failure. Each
/// rung builds on the previous one and the parse is retried after each.
pub fn parse_arguments_with_repair(raw: &str) -> std::result::Result<Value, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    let mut current = trimmed.to_string();
    let mut last_err = String::new();

    for step in 0..=3 {
        match serde_json::from_str::<Value>(&current) {
            Ok(v @ Value::Object(_)) => return Ok(v),
            Ok(other) => {
                last_err = format!("arguments parsed to non-object: {}", other);
            }
            Err(e) => last_err = e.to_string(),
        }
        current = match step {
            0 => escape_control_chars(&current),
            1 => rewrite_language_literals(&current),
            2 => balance_delimiters(&current),
            _ => break,
        };
    }
    Err(last_err)
}

/// Audit record for a candidate that survived detection but failed every
/// repair rung.
#[derive(Debug, Clone)]
pub struct ExtractionFailureRecord {
    pub at: DateTime<Utc>,
    pub name: String,
    pub snippet: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    ToolUse(ContentBlock),
    Text(String),
}

/// Turn a surviving candidate into a content block. Extraction failure is
/// recoverable: the raw span is preserved as text and a failure record is
/// returned for the audit log.
pub fn extract(
    candidate: &ToolCallCandidate,
    raw_span: &str,
) -> (Extracted, Option<ExtractionFailureRecord>) {
    match parse_arguments_with_repair(&candidate.raw_arguments) {
        Ok(input) => (
            Extracted::ToolUse(ContentBlock::ToolUse {
                id: ToolUseId::generate().0,
                name: candidate.name.clone(),
                input,
            }),
            None,
        ),
        Err(error) => {
            let record = ExtractionFailureRecord {
                at: Utc::now(),
                name: candidate.name.clone(),
                snippet: str_utils::first_n_chars_lossy(&candidate.raw_arguments, 120).into_owned(),
                error: error.clone(),
            };
            tracing::warn!(
                target: "prism::extract",
                name = %candidate.name,
                method = candidate.method,
                error = %error,
                "tool call extraction failed after repair; degrading to text"
            );
            (Extracted::Text(raw_span.to_string()), Some(record))
        }
    }
}

/// Assemble ordered content blocks from the full response text and the
/// surviving candidates. Tool calls replace the span they were extracted
/// from; surrounding text keeps its original order. Spans that fail
/// extraction are always kept as text regardless of policy.
pub fn assemble_content(
    text: &str,
    candidates: &[ToolCallCandidate],
    medium_confidence: f32,
    policy: ResidualTextPolicy,
) -> (Vec<ContentBlock>, Vec<ExtractionFailureRecord>) {
    let mut extractable: Vec<&ToolCallCandidate> = candidates
        .iter()
        .filter(|c| c.confidence >= medium_confidence && !c.name.is_empty())
        .collect();
    extractable.sort_by_key(|c| c.start);

    // The residual policy governs narrative around recovered calls only;
    // text with nothing to recover passes through whole.
    if extractable.is_empty() {
        let blocks = if text.trim().is_empty() {
            Vec::new()
        } else {
            vec![ContentBlock::text(text)]
        };
        return (blocks, Vec::new());
    }

    let mut blocks = Vec::new();
    let mut failures = Vec::new();
    let mut cursor = 0usize;

    let push_text = |blocks: &mut Vec<ContentBlock>, seg: &str, forced: bool| {
        if seg.trim().is_empty() {
            return;
        }
        if forced || policy == ResidualTextPolicy::Keep {
            blocks.push(ContentBlock::text(seg));
        }
    };

    for cand in extractable {
        if cand.start > cursor {
            if let Some(seg) = str_utils::slice_bytes_safe(text, cursor, cand.start) {
                push_text(&mut blocks, seg, false);
            }
        }
        let raw_span = str_utils::slice_bytes_safe(text, cand.start, cand.end)
            .unwrap_or(cand.raw_arguments.as_str());
        match extract(cand, raw_span) {
            (Extracted::ToolUse(block), _) => blocks.push(block),
            (Extracted::Text(seg), failure) => {
                push_text(&mut blocks, &seg, true);
                failures.extend(failure);
            }
        }
        cursor = cursor.max(cand.end);
    }
    if cursor < text.len() {
        if let Some(seg) = str_utils::slice_bytes_safe(text, cursor, text.len()) {
            push_text(&mut blocks, seg, false);
        }
    }

    (blocks, failures)
}
