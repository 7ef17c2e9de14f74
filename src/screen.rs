//! Screen decoding: ANSI stripping, line splitting, and the in-memory
//! ring buffer of recent output.

use regex::Regex;
use std::collections::VecDeque;
use std::sync::OnceLock;

/// Hard cap on the ring buffer; oldest lines are evicted beyond this.
pub const RING_CAP: usize = 1000;

/// Cap on a partial (unterminated) line held by the decoder.
const PARTIAL_MAX: usize = 8192;

static ANSI_PATTERN: OnceLock<Regex> = OnceLock::new();

fn ansi_pattern() -> &'static Regex {
    ANSI_PATTERN.get_or_init(|| {
        Regex::new(r"\x1B\[[0-9;?]*[A-Za-z]|\x1B\].*?(?:\x07|\x1B\\)|\x1B[()][0-9A-B]").unwrap()
    })
}

/// Strip ANSI escape sequences from text.
pub fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").to_string()
}

/// Find the nearest character boundary at or before the given byte index.
/// Needed because slicing a UTF-8 string at an arbitrary byte position can
/// panic in the middle of a multi-byte character.
pub fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Incremental decoder that turns raw PTY chunks into complete lines.
///
/// Splits on both `\n` and `\r` (a `\r\n` pair counts once, even when the
/// pair straddles a chunk boundary); a trailing partial line is buffered
/// until the next chunk. Emitted lines are escape-stripped.
#[derive(Default)]
pub struct LineDecoder {
    partial: String,
    /// The previous chunk ended on a bare `\r`; a leading `\n` in the next
    /// chunk completes that pair and must not produce an empty line.
    last_was_cr: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw chunk, returning any newly completed lines.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(chunk);
        let mut input = text.as_ref();
        if self.last_was_cr {
            if let Some(rest) = input.strip_prefix('\n') {
                input = rest;
            }
            self.last_was_cr = false;
        }
        self.partial.push_str(input);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find(['\n', '\r']) {
            let line = self.partial[..pos].to_string();
            let terminator = self.partial.as_bytes()[pos];
            let mut rest = pos + 1;
            if terminator == b'\r' {
                match self.partial.as_bytes().get(rest) {
                    Some(&b'\n') => rest += 1,
                    None => self.last_was_cr = true,
                    Some(_) => {}
                }
            }
            self.partial = self.partial.split_off(rest);
            lines.push(strip_ansi(&line));
        }

        // An unterminated line cannot grow without bound.
        if self.partial.len() > PARTIAL_MAX {
            let start = floor_char_boundary(&self.partial, self.partial.len() - PARTIAL_MAX);
            self.partial = self.partial.split_off(start);
        }

        lines
    }

    /// The buffered partial line, escape-stripped.
    pub fn partial(&self) -> String {
        strip_ansi(&self.partial)
    }
}

/// Bounded in-memory tail of the most recent decoded lines.
pub struct RingBuffer {
    lines: VecDeque<String>,
    cap: usize,
}

impl RingBuffer {
    pub fn new() -> Self {
        Self::with_cap(RING_CAP)
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(cap.min(RING_CAP)),
            cap,
        }
    }

    /// Append a line, evicting the oldest when over capacity.
    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The retained lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1B[31mRed text\x1B[0m"), "Red text");
        assert_eq!(strip_ansi("\x1B]0;title\x07plain"), "plain");
        assert_eq!(strip_ansi("\x1B[2J\x1B[1;1HClear"), "Clear");
    }

    #[test]
    fn test_decoder_splits_lines() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.feed(b"one\ntwo\nthree");
        assert_eq!(lines, vec!["one", "two"]);
        let lines = decoder.feed(b" more\n");
        assert_eq!(lines, vec!["three more"]);
    }

    #[test]
    fn test_decoder_crlf_counts_once() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.feed(b"a\r\nb\rc\n");
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_decoder_crlf_split_across_chunks() {
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.feed(b"a\r"), vec!["a"]);
        // The \n completing the pair arrives in the next chunk and must not
        // produce an empty line.
        assert_eq!(decoder.feed(b"\nb\n"), vec!["b"]);
    }

    #[test]
    fn test_decoder_bare_cr_then_plain_chunk() {
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.feed(b"a\r"), vec!["a"]);
        // No leading \n: the \r stood alone and the next chunk is unrelated.
        assert_eq!(decoder.feed(b"b\n"), vec!["b"]);
    }

    #[test]
    fn test_decoder_cr_cr_lf_across_chunks() {
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.feed(b"a\r"), vec!["a"]);
        // Only the \n directly completing the first \r is absorbed; the
        // second \r terminates an empty line as it would within one chunk.
        assert_eq!(decoder.feed(b"\rc\n"), vec!["", "c"]);
    }

    #[test]
    fn test_decoder_strips_escapes() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.feed(b"\x1B[32mgreen\x1B[0m line\n");
        assert_eq!(lines, vec!["green line"]);
    }

    #[test]
    fn test_ring_buffer_bound() {
        let mut ring = RingBuffer::new();
        for i in 0..1500 {
            ring.push(format!("line-{}", i));
        }
        assert_eq!(ring.len(), RING_CAP);
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.first().unwrap(), "line-500");
        assert_eq!(snapshot.last().unwrap(), "line-1499");
    }

    #[test]
    fn test_ring_buffer_under_cap() {
        let mut ring = RingBuffer::new();
        for i in 0..10 {
            ring.push(format!("line-{}", i));
        }
        assert_eq!(ring.len(), 10);
        assert_eq!(ring.snapshot()[0], "line-0");
    }

    #[test]
    fn test_floor_char_boundary() {
        let s = "Hello 世界";
        assert_eq!(floor_char_boundary(s, 0), 0);
        assert_eq!(floor_char_boundary(s, 6), 6);
        assert_eq!(floor_char_boundary(s, 7), 6);
        assert_eq!(floor_char_boundary(s, 8), 6);
        assert_eq!(floor_char_boundary(s, 100), 12);
    }
}
