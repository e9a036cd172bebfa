//! Tool-call pattern library.
//!
//! An ordered, data-driven list of (pattern, name, confidence) recognizers for
//! tool-call syntax embedded in free text, plus a second-pass exclusion filter
//! list that suppresses likely false positives. The library is immutable after
//! construction and shared read-only across concurrent requests; all mutable
//! scan state lives in the per-request scanner.

use lazy_static::lazy_static;
use regex::Regex;

use crate::extract::balanced_object_end;
use crate::str_utils;
use crate::types::{DetectionResult, PrismError, Result, ToolCallCandidate};

/// How a matched anchor is turned into a candidate span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// Match starts at the opening brace of a JSON object that carries the
    /// tool name; the span is the balanced outer object.
    JsonBlock,
    /// `name({...})`-style call syntax; the span runs from the anchor through
    /// the balanced argument object and an optional closing paren.
    CallSyntax,
    /// Like `CallSyntax` but only trusted when the argument keys look like
    /// common tool-argument fields.
    FunctionShaped,
    /// Truncated prefix anchored at the end of the text unit. Exists to flag
    /// a pattern split across a chunk boundary; never extracted directly.
    Partial,
}

#[derive(Debug, Clone)]
pub struct PatternSpec {
    /// Method label recorded on candidates (`ToolCallCandidate::method`).
    pub method: &'static str,
    pub regex: &'static str,
    pub confidence: f32,
    pub kind: PatternKind,
}

#[derive(Debug, Clone)]
pub enum ExclusionRule {
    /// JSON argument objects that look like personal-data records rather
    /// than tool arguments.
    PersonalRecord { min_hits: usize },
    /// Explicit "this is not a tool call" phrasing near the match.
    ContextPhrase {
        phrases: &'static [&'static str],
        lookbehind: usize,
    },
    /// Single-letter math-function notation like `f({..})` descriptions.
    MathFunction,
}

struct CompiledPattern {
    method: &'static str,
    re: Regex,
    confidence: f32,
    kind: PatternKind,
}

pub struct PatternLibrary {
    patterns: Vec<CompiledPattern>,
    exclusions: Vec<ExclusionRule>,
}

/// Argument keys that make a bare `name({...})` look like a genuine tool call.
const COMMON_ARG_KEYS: &[&str] = &[
    "task",
    "query",
    "path",
    "file_path",
    "content",
    "command",
    "pattern",
    "url",
    "city",
    "location",
    "text",
    "input",
];

/// Keys typical of personal-data records, not tool arguments.
const PERSONAL_RECORD_KEYS: &[&str] = &[
    "first_name",
    "last_name",
    "full_name",
    "email",
    "age",
    "phone",
    "address",
    "birthday",
];

const MATH_NAMES: &[&str] = &["f", "g", "h", "sin", "cos", "tan", "log", "exp", "sqrt"];

pub fn standard_patterns() -> Vec<PatternSpec> {
    vec![
        // High tier: unambiguous structured markers.
        PatternSpec {
            method: "tool_use_tag",
            regex: r#"\{\s*"type"\s*:\s*"tool_use"\s*,\s*"name"\s*:\s*"(?P<name>[A-Za-z_][\w.-]*)"\s*,\s*"input"\s*:\s*(?P<args>\{)"#,
            confidence: 0.95,
            kind: PatternKind::JsonBlock,
        },
        PatternSpec {
            method: "json_tool_block",
            regex: r#"\{\s*"name"\s*:\s*"(?P<name>[A-Za-z_][\w.-]*)"\s*,\s*"(?:arguments|parameters|input)"\s*:\s*(?P<args>\{)"#,
            confidence: 0.9,
            kind: PatternKind::JsonBlock,
        },
        PatternSpec {
            method: "tool_call_prefix",
            regex: r#"Tool call:\s*(?P<name>[A-Za-z_][\w.-]*)\s*\(\s*(?P<args>\{)"#,
            confidence: 0.95,
            kind: PatternKind::CallSyntax,
        },
        PatternSpec {
            method: "call_id_prefix",
            regex: r#"\bcall_[A-Za-z0-9]{4,}\s*:\s*(?P<name>[A-Za-z_][\w.-]*)\s*\(\s*(?P<args>\{)"#,
            confidence: 0.9,
            kind: PatternKind::CallSyntax,
        },
        // Medium tier: localized spellings and function-shaped text.
        PatternSpec {
            method: "localized_tool_call",
            regex: r#"(?:工具调用|调用工具|ツール呼び出し|Appel d'outil)\s*[:：]\s*(?P<name>[A-Za-z_][\w.-]*)\s*\(\s*(?P<args>\{)"#,
            confidence: 0.8,
            kind: PatternKind::CallSyntax,
        },
        PatternSpec {
            method: "function_shaped",
            regex: r#"\b(?P<name>[A-Za-z_]\w*)\s*\(\s*(?P<args>\{)"#,
            confidence: 0.6,
            kind: PatternKind::FunctionShaped,
        },
        // Low tier: truncated prefixes at the end of a unit. These mark a
        // possible boundary split for the sliding window; extraction ignores
        // them.
        PatternSpec {
            method: "partial_json_tool",
            regex: r#"\{\s*"name"\s*:\s*"[\w.-]*\z"#,
            confidence: 0.4,
            kind: PatternKind::Partial,
        },
        PatternSpec {
            method: "partial_tool_call_prefix",
            regex: r#"(?:Tool call|工具调用|调用工具)\s*[:：]?\s*[\w.(-]*\z"#,
            confidence: 0.35,
            kind: PatternKind::Partial,
        },
    ]
}

pub fn standard_exclusions() -> Vec<ExclusionRule> {
    vec![
        ExclusionRule::PersonalRecord { min_hits: 2 },
        ExclusionRule::ContextPhrase {
            phrases: &[
                "not a tool call",
                "not an actual tool call",
                "plain text, not",
                "for example only",
                "just an example",
            ],
            lookbehind: 120,
        },
        ExclusionRule::MathFunction,
    ]
}

lazy_static! {
    /// Shared read-only default library. Safe to reference from any number of
    /// concurrent requests.
    pub static ref STANDARD_LIBRARY: PatternLibrary = PatternLibrary::standard();
}

impl PatternLibrary {
    pub fn new(specs: Vec<PatternSpec>, exclusions: Vec<ExclusionRule>) -> Result<Self> {
        let mut patterns = Vec::with_capacity(specs.len());
        for spec in specs {
            let re = Regex::new(spec.regex).map_err(|e| {
                PrismError::InvalidConfig(format!("pattern '{}' failed to compile: {}", spec.method, e))
            })?;
            if !(0.0..=1.0).contains(&spec.confidence) {
                return Err(PrismError::InvalidConfig(format!(
                    "pattern '{}' confidence {} out of range",
                    spec.method, spec.confidence
                ))
                .into());
            }
            patterns.push(CompiledPattern {
                method: spec.method,
                re,
                confidence: spec.confidence,
                kind: spec.kind,
            });
        }
        Ok(Self {
            patterns,
            exclusions,
        })
    }

    pub fn standard() -> Self {
        match Self::new(standard_patterns(), standard_exclusions()) {
            Ok(lib) => lib,
            // The builtin set is constant; a compile failure is a programming
            // error caught by the unit tests below.
            Err(e) => panic!("builtin pattern set failed to compile: {}", e),
        }
    }

    /// Run every recognizer over `text`, deduplicate overlapping matches
    /// (highest confidence wins), then apply the exclusion filters.
    /// Returned spans are byte offsets into `text`, sorted by start.
    pub fn find_candidates(&self, text: &str) -> Vec<ToolCallCandidate> {
        let mut raw: Vec<ToolCallCandidate> = Vec::new();
        for pattern in &self.patterns {
            for m in pattern.re.find_iter(text) {
                if let Some(candidate) = self.derive_candidate(pattern, text, m.start()) {
                    raw.push(candidate);
                }
            }
        }

        // Overlap dedup: prefer higher confidence, then earlier start.
        raw.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.start.cmp(&b.start))
        });
        let mut kept: Vec<ToolCallCandidate> = Vec::new();
        for cand in raw {
            if !kept.iter().any(|k| k.overlaps(cand.start, cand.end)) {
                kept.push(cand);
            }
        }

        kept.retain(|c| match self.excluded_by(c, text) {
            Some(rule) => {
                tracing::debug!(
                    target: "prism::patterns",
                    "suppressed candidate '{}' ({}) by exclusion {}",
                    c.name,
                    c.method,
                    rule
                );
                false
            }
            None => true,
        });

        kept.sort_by_key(|c| c.start);
        kept
    }

    fn derive_candidate(
        &self,
        pattern: &CompiledPattern,
        text: &str,
        match_start: usize,
    ) -> Option<ToolCallCandidate> {
        let caps = pattern.re.captures(&text[match_start..])?;
        let whole = caps.get(0)?;

        if pattern.kind == PatternKind::Partial {
            // Partial prefixes are only meaningful at the very end of the unit.
            let end = match_start + whole.end();
            if end != text.len() {
                return None;
            }
            return Some(ToolCallCandidate {
                start: match_start + whole.start(),
                end,
                name: String::new(),
                raw_arguments: String::new(),
                confidence: pattern.confidence,
                method: pattern.method,
            });
        }

        let name = caps.name("name")?.as_str().to_string();
        let args_open = match_start + caps.name("args")?.start();
        let args_end = balanced_object_end(text, args_open)?;
        let raw_arguments = text.get(args_open..args_end)?.to_string();

        let (start, end) = match pattern.kind {
            PatternKind::JsonBlock => {
                // The span is the whole enclosing JSON object.
                let outer_end = balanced_object_end(text, match_start + whole.start())?;
                (match_start + whole.start(), outer_end.max(args_end))
            }
            PatternKind::CallSyntax | PatternKind::FunctionShaped => {
                let mut end = args_end;
                let rest = text.get(end..).unwrap_or_default();
                let trailing = rest.len() - rest.trim_start().len();
                if rest.trim_start().starts_with(')') {
                    end += trailing + 1;
                }
                (match_start + whole.start(), end)
            }
            PatternKind::Partial => unreachable!("handled above"),
        };

        if pattern.kind == PatternKind::FunctionShaped && !has_common_arg_key(&raw_arguments) {
            return None;
        }

        Some(ToolCallCandidate {
            start,
            end,
            name,
            raw_arguments,
            confidence: pattern.confidence,
            method: pattern.method,
        })
    }

    fn excluded_by(&self, candidate: &ToolCallCandidate, text: &str) -> Option<&'static str> {
        for rule in &self.exclusions {
            match rule {
                ExclusionRule::PersonalRecord { min_hits } => {
                    if candidate.raw_arguments.is_empty() {
                        continue;
                    }
                    if let Ok(serde_json::Value::Object(map)) =
                        serde_json::from_str::<serde_json::Value>(&candidate.raw_arguments)
                    {
                        let hits = map
                            .keys()
                            .filter(|k| PERSONAL_RECORD_KEYS.contains(&k.as_str()))
                            .count();
                        let tool_like = map
                            .keys()
                            .any(|k| COMMON_ARG_KEYS.contains(&k.as_str()));
                        if hits >= *min_hits && !tool_like {
                            return Some("personal_record");
                        }
                    }
                }
                ExclusionRule::ContextPhrase {
                    phrases,
                    lookbehind,
                } => {
                    let from =
                        str_utils::floor_char_boundary(text, candidate.start.saturating_sub(*lookbehind));
                    let context = text.get(from..candidate.start).unwrap_or_default().to_lowercase();
                    if phrases.iter().any(|p| context.contains(p)) {
                        return Some("context_phrase");
                    }
                }
                ExclusionRule::MathFunction => {
                    if candidate.method == "function_shaped"
                        && MATH_NAMES.contains(&candidate.name.as_str())
                    {
                        return Some("math_function");
                    }
                }
            }
        }
        None
    }
}

fn has_common_arg_key(raw_arguments: &str) -> bool {
    match serde_json::from_str::<serde_json::Value>(raw_arguments) {
        Ok(serde_json::Value::Object(map)) => {
            map.keys().any(|k| COMMON_ARG_KEYS.contains(&k.as_str()))
        }
        // Unparsed arguments get the benefit of the doubt here; the repair
        // ladder decides later whether they survive.
        _ => COMMON_ARG_KEYS
            .iter()
            .any(|k| raw_arguments.contains(&format!("\"{}\"", k))),
    }
}

/// Build a `DetectionResult` for one text unit from surviving candidates.
/// Residual segments are the stretches of text not covered by any candidate
/// at or above the extraction threshold.
pub fn build_detection(
    text: &str,
    candidates: Vec<ToolCallCandidate>,
    medium_confidence: f32,
) -> DetectionResult {
    let confidence = candidates
        .iter()
        .map(|c| c.confidence)
        .fold(0.0_f32, f32::max);
    let extractable: Vec<&ToolCallCandidate> = candidates
        .iter()
        .filter(|c| c.confidence >= medium_confidence && !c.name.is_empty())
        .collect();

    let mut residual_text = Vec::new();
    let mut cursor = 0usize;
    for cand in &extractable {
        if cand.start > cursor {
            if let Some(seg) = str_utils::slice_bytes_safe(text, cursor, cand.start) {
                if !seg.trim().is_empty() {
                    residual_text.push(seg.to_string());
                }
            }
        }
        cursor = cursor.max(cand.end);
    }
    if cursor < text.len() {
        if let Some(seg) = str_utils::slice_bytes_safe(text, cursor, text.len()) {
            if !seg.trim().is_empty() {
                residual_text.push(seg.to_string());
            }
        }
    }

    DetectionResult {
        has_tool_calls: !extractable.is_empty(),
        candidates,
        residual_text,
        confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_set_compiles() {
        let lib = PatternLibrary::standard();
        assert!(!lib.patterns.is_empty());
    }

    #[test]
    fn detects_tool_call_prefix() {
        let text = r#"Tool call: get_weather({"city": "NYC"})"#;
        let found = STANDARD_LIBRARY.find_candidates(text);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "get_weather");
        assert_eq!(found[0].raw_arguments, r#"{"city": "NYC"}"#);
        assert_eq!(found[0].method, "tool_call_prefix");
        assert!(found[0].confidence >= 0.9);
        assert_eq!(found[0].end, text.len());
    }

    #[test]
    fn detects_json_tool_block() {
        let text = r#"Sure, here you go: {"name": "read_file", "arguments": {"path": "src/main.rs"}} done"#;
        let found = STANDARD_LIBRARY.find_candidates(text);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "read_file");
        assert_eq!(found[0].raw_arguments, r#"{"path": "src/main.rs"}"#);
    }

    #[test]
    fn detects_tool_use_tagged_block() {
        let text = r#"{"type": "tool_use", "name": "grep", "input": {"pattern": "fn main"}}"#;
        let found = STANDARD_LIBRARY.find_candidates(text);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].method, "tool_use_tag");
        assert_eq!(found[0].name, "grep");
    }

    #[test]
    fn detects_localized_variant() {
        let text = r#"工具调用: web_search({"query": "天气"})"#;
        let found = STANDARD_LIBRARY.find_candidates(text);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "web_search");
        assert_eq!(found[0].method, "localized_tool_call");
    }

    #[test]
    fn function_shaped_requires_common_keys() {
        let hit = STANDARD_LIBRARY.find_candidates(r#"run_search({"query": "rust"})"#);
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].method, "function_shaped");

        let miss = STANDARD_LIBRARY.find_candidates(r#"weird({"zzz": 1})"#);
        assert!(miss.is_empty());
    }

    #[test]
    fn partial_prefix_only_matches_at_end() {
        let tail = r#"Let me check. {"name": "get_w"#;
        let found = STANDARD_LIBRARY.find_candidates(tail);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].method, "partial_json_tool");
        assert!(found[0].name.is_empty());

        let middle = r#"{"name": "get_w and then more prose follows here"#;
        let found = STANDARD_LIBRARY.find_candidates(middle);
        assert!(found.iter().all(|c| c.method != "partial_json_tool"));
    }

    #[test]
    fn personal_record_is_excluded() {
        let text = r#"record({"first_name": "Ada", "last_name": "Lovelace", "email": "a@b.c"})"#;
        let found = STANDARD_LIBRARY.find_candidates(text);
        assert!(found.is_empty());
    }

    #[test]
    fn disclaimer_context_is_excluded() {
        let text = r#"This is plain text, not a tool call: Tool call: fake({"task": "x"})"#;
        let found = STANDARD_LIBRARY.find_candidates(text);
        assert!(found.is_empty());
    }

    #[test]
    fn math_function_is_excluded() {
        let text = r#"Consider f({"input": 3}) as a mapping."#;
        let found = STANDARD_LIBRARY.find_candidates(text);
        assert!(found.is_empty());
    }

    #[test]
    fn overlapping_matches_keep_highest_confidence() {
        // The prefix syntax also matches the bare function-shaped pattern.
        let text = r#"Tool call: get_weather({"city": "NYC"})"#;
        let found = STANDARD_LIBRARY.find_candidates(text);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].method, "tool_call_prefix");
    }

    #[test]
    fn residual_segments_preserve_surrounding_text() {
        let text = r#"Before. Tool call: get_weather({"city": "NYC"}) After."#;
        let cands = STANDARD_LIBRARY.find_candidates(text);
        let det = build_detection(text, cands, 0.3);
        assert!(det.has_tool_calls);
        assert_eq!(det.residual_text.len(), 2);
        assert!(det.residual_text[0].contains("Before."));
        assert!(det.residual_text[1].contains("After."));
    }

    #[test]
    fn unit_confidence_is_max_of_survivors() {
        let text = r#"run_search({"query": "a"}) and Tool call: grep({"pattern": "b"})"#;
        let cands = STANDARD_LIBRARY.find_candidates(text);
        let det = build_detection(text, cands, 0.3);
        assert!((det.confidence - 0.95).abs() < 1e-6);
    }
}
