//! [`OutputLineAssembler`] – console chunks to a bounded line buffer.
//!
//! Chunks are handled in arrival order:
//!
//! 1. If the previous chunk ended in `\r` and this one has no `\n`, it
//!    replaces the last buffered entry (progress lines overwrite in place).
//! 2. Right after a prompt, a chunk that is exactly `"\n"` is the echo of the
//!    prompt line ending; it is swallowed.
//! 3. A chunk matching `N.SESSION>` (optionally preceded by newlines) arms
//!    rule 2 for the next chunk.
//! 4. The chunk is appended; the oldest entries are evicted past the
//!    maximum length.
//! 5. The appended chunk is returned so the caller can emit it as an
//!    incremental change event.
//!
//! Numbers are rendered right-justified in 12 columns and end the line.
//! Floats always show a fractional part (`3.0`, not `3`).

use std::collections::VecDeque;
use std::sync::OnceLock;

use regex::Regex;
use tangospec_session::OutputChunk;

fn prompt_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            // `\n*` leading blank lines, then `<line number>.<session>>`
            Regex::new(r"^\n*(\d+)\.(\w+)>\s*").ok()
        })
        .as_ref()
}

/// Render one raw chunk as text.
pub fn render_chunk(chunk: OutputChunk) -> String {
    match chunk {
        OutputChunk::Integer(n) => format!("{n:>12}\n"),
        OutputChunk::Number(n) => format!("{:>12}\n", format!("{n:?}")),
        OutputChunk::Text(s) => s,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OutputLineAssembler
// ─────────────────────────────────────────────────────────────────────────────

pub struct OutputLineAssembler {
    max_len: usize,
    buffer: VecDeque<String>,
    replace_last: bool,
    awaiting_prompt_echo: bool,
}

impl OutputLineAssembler {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            buffer: VecDeque::new(),
            replace_last: false,
            awaiting_prompt_echo: false,
        }
    }

    /// Feed one chunk.  Returns the text appended to the buffer, `None` when
    /// the chunk was swallowed.
    pub fn push(&mut self, chunk: OutputChunk) -> Option<String> {
        let text = render_chunk(chunk);

        if self.replace_last {
            self.replace_last = false;
            if !text.contains('\n') {
                self.buffer.pop_back();
            }
        }

        if self.awaiting_prompt_echo && text == "\n" {
            self.awaiting_prompt_echo = false;
            return None;
        }

        self.awaiting_prompt_echo = prompt_pattern().is_some_and(|p| p.is_match(&text));

        if text.ends_with('\r') {
            self.replace_last = true;
        }

        self.buffer.push_back(text.clone());
        self.evict();
        Some(text)
    }

    /// The whole buffer concatenated.
    pub fn contents(&self) -> String {
        self.buffer.iter().map(String::as_str).collect()
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<String> {
        self.buffer.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn set_max_len(&mut self, max_len: usize) {
        self.max_len = max_len;
        self.evict();
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.replace_last = false;
        self.awaiting_prompt_echo = false;
    }

    fn evict(&mut self) {
        while self.buffer.len() > self.max_len {
            self.buffer.pop_front();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> OutputChunk {
        OutputChunk::Text(s.to_string())
    }

    #[test]
    fn carriage_return_coalesces_progress_lines() {
        let mut out = OutputLineAssembler::new(10);
        out.push(text("10%\r"));
        out.push(text("20%\r"));
        out.push(text("30%"));
        assert_eq!(out.entries(), vec!["30%"]);
    }

    #[test]
    fn carriage_return_then_newline_appends() {
        let mut out = OutputLineAssembler::new(10);
        out.push(text("10%\r"));
        out.push(text("done\n"));
        assert_eq!(out.entries(), vec!["10%\r", "done\n"]);
    }

    #[test]
    fn newline_after_prompt_is_swallowed_once() {
        assert!(prompt_pattern().is_some());
        let mut out = OutputLineAssembler::new(10);
        assert!(out.push(text("\n12.FOURC> ")).is_some());
        assert_eq!(out.push(text("\n")), None);
        assert_eq!(out.push(text("\n")).as_deref(), Some("\n"));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn non_prompt_text_does_not_arm_swallowing() {
        let mut out = OutputLineAssembler::new(10);
        out.push(text("FOURC> "));
        assert!(out.push(text("\n")).is_some());
    }

    #[test]
    fn numbers_are_right_justified() {
        let mut out = OutputLineAssembler::new(10);
        let appended = out.push(OutputChunk::Number(3.5)).unwrap();
        assert_eq!(appended, "         3.5\n");
        assert_eq!(appended.len(), 13);
    }

    #[test]
    fn whole_floats_keep_their_decimal() {
        assert_eq!(render_chunk(OutputChunk::Number(3.0)), "         3.0\n");
        assert_eq!(render_chunk(OutputChunk::Integer(3)), "           3\n");
        assert_eq!(render_chunk(OutputChunk::Number(-0.25)), "       -0.25\n");
    }

    #[test]
    fn buffer_never_exceeds_maximum() {
        let mut out = OutputLineAssembler::new(3);
        for i in 0..10 {
            out.push(text(&format!("line {i}\n")));
            assert!(out.len() <= 3);
        }
        assert_eq!(out.contents(), "line 7\nline 8\nline 9\n");
    }

    #[test]
    fn push_returns_only_the_new_chunk() {
        let mut out = OutputLineAssembler::new(10);
        out.push(text("first\n"));
        assert_eq!(out.push(text("second\n")).as_deref(), Some("second\n"));
    }
}
