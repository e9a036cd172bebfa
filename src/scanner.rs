//! Cross-chunk sliding-window scanner.
//!
//! Streaming providers split text at arbitrary byte positions, so a tool-call
//! pattern can straddle any number of chunk boundaries. The scanner keeps a
//! rolling buffer of the most recent `window_size` characters, rescans it with
//! 75%-overlapping windows plus a full-buffer pass on every update, and
//! deduplicates matches by their absolute span so a pattern seen by several
//! overlapping windows is reported exactly once.

use crate::config::NormalizerConfig;
use crate::patterns::PatternLibrary;
use crate::str_utils;
use crate::types::{DetectionResult, ToolCallCandidate};

pub struct SlidingWindowScanner<'a> {
    library: &'a PatternLibrary,
    config: NormalizerConfig,
    /// Rolling tail of the logical response text.
    buffer: String,
    /// Absolute byte offset of `buffer[0]` within the logical full text.
    base_offset: usize,
    /// Absolute spans already reported, in start order.
    emitted: Vec<(usize, usize)>,
    /// Complete candidates reported over the life of this scanner.
    collected: Vec<ToolCallCandidate>,
    detection_count: usize,
}

impl<'a> SlidingWindowScanner<'a> {
    pub fn new(library: &'a PatternLibrary, config: NormalizerConfig) -> Self {
        Self {
            library,
            config,
            buffer: String::new(),
            base_offset: 0,
            emitted: Vec::new(),
            collected: Vec::new(),
            detection_count: 0,
        }
    }

    /// Feed the next chunk of text. Returns the candidates newly discovered
    /// by this update with absolute spans. Residual text is not computed per
    /// chunk; callers assemble it from the full text at finalization.
    pub fn update(&mut self, chunk: &str) -> DetectionResult {
        self.buffer.push_str(chunk);
        let result = self.scan(false);
        self.trim_buffer();
        result
    }

    /// Mandatory end-of-stream pass over the unconsumed tail. A candidate
    /// that was only ever a partial prefix is reported here if its completion
    /// arrived, or surfaces as a final partial flag if it never did.
    pub fn finish(&mut self) -> DetectionResult {
        self.scan(true)
    }

    /// All complete candidates reported so far, in absolute-span order.
    pub fn candidates(&self) -> &[ToolCallCandidate] {
        &self.collected
    }

    pub fn detection_count(&self) -> usize {
        self.detection_count
    }

    fn scan(&mut self, is_final: bool) -> DetectionResult {
        let mut found: Vec<ToolCallCandidate> = Vec::new();

        for (window_start, window) in self.windows() {
            let window_abs_end = self.base_offset + window_start + window.len();
            for mut cand in self.library.find_candidates(window) {
                cand.start += self.base_offset + window_start;
                cand.end += self.base_offset + window_start;
                let partial = cand.name.is_empty();
                // A partial prefix is only meaningful at the true end of the
                // buffered text, not at an interior window edge.
                if partial
                    && (window_abs_end != self.buffer_abs_end()
                        || cand.end != self.buffer_abs_end())
                {
                    continue;
                }
                // A complete match touching the edge of the window that
                // produced it may have been truncated by that edge (a
                // trailing close-paren, an enclosing object). Defer it until
                // more text arrives or the final full-buffer pass runs.
                if !partial
                    && cand.end == window_abs_end
                    && !(is_final && window_abs_end == self.buffer_abs_end())
                {
                    continue;
                }
                if self.span_already_emitted(cand.start, cand.end) {
                    continue;
                }
                if found.iter().any(|f| f.overlaps(cand.start, cand.end)) {
                    continue;
                }
                found.push(cand);
            }
        }

        found.sort_by_key(|c| c.start);
        let confidence = found.iter().map(|c| c.confidence).fold(0.0_f32, f32::max);
        let mut complete: Vec<ToolCallCandidate> = Vec::new();
        for cand in &found {
            if cand.name.is_empty() {
                continue;
            }
            if cand.confidence >= self.config.medium_confidence {
                self.emitted.push((cand.start, cand.end));
            }
            complete.push(cand.clone());
        }
        if !complete.is_empty() {
            self.detection_count += complete.len();
            self.collected.extend(complete.iter().cloned());
            tracing::debug!(
                target: "prism::scanner",
                count = complete.len(),
                is_final,
                "window scan reported new candidates"
            );
        }

        DetectionResult {
            has_tool_calls: complete
                .iter()
                .any(|c| c.confidence >= self.config.medium_confidence),
            candidates: found,
            residual_text: Vec::new(),
            confidence,
        }
    }

    /// Scan ranges over the current buffer: the full buffer first, then
    /// overlapping fixed windows at `window_step` character stride. The full
    /// pass comes first so that a window edge slicing through a pattern can
    /// never outrank the complete match with a partial artifact.
    fn windows(&self) -> Vec<(usize, &str)> {
        let char_count = self.buffer.chars().count();
        let window_chars = self.config.window_size;
        let step = self.config.window_step();
        let mut out = vec![(0, self.buffer.as_str())];

        if char_count > window_chars {
            let boundaries: Vec<usize> = self
                .buffer
                .char_indices()
                .map(|(i, _)| i)
                .chain(std::iter::once(self.buffer.len()))
                .collect();
            let mut start_char = 0usize;
            while start_char + window_chars < char_count {
                let start = boundaries[start_char];
                let end = boundaries[start_char + window_chars];
                out.push((start, &self.buffer[start..end]));
                start_char += step;
            }
        }
        out
    }

    fn buffer_abs_end(&self) -> usize {
        self.base_offset + self.buffer.len()
    }

    fn span_already_emitted(&self, start: usize, end: usize) -> bool {
        self.emitted.iter().any(|&(s, e)| start < e && s < end)
    }

    /// Keep only the most recent `window_size` characters, advancing the
    /// absolute base offset past the dropped prefix.
    fn trim_buffer(&mut self) {
        let char_count = self.buffer.chars().count();
        if char_count <= self.config.window_size {
            return;
        }
        let drop_chars = char_count - self.config.window_size;
        let keep_from = str_utils::prefix_chars(&self.buffer, drop_chars).len();
        self.base_offset += keep_from;
        self.buffer.drain(..keep_from);
    }
}
