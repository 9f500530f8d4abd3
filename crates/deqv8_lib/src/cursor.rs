//! Line cursor over a pre-tokenized disassembly dump.
//!
//! Blank lines are dropped up front and every remaining line is trimmed. The
//! cursor offers exactly one line of lookahead through [`LineCursor::push_back`]:
//! the next call to [`LineCursor::next_line`] repeats the line returned last.

use std::fmt::Write as _;

#[derive(Debug, Clone)]
struct SourceLine {
    number: usize,
    text: String,
}

#[derive(Debug, Clone)]
pub struct LineCursor {
    lines: Vec<SourceLine>,
    /// Index of the line handed out by the last `next_line` call.
    current: Option<usize>,
    repeat: bool,
    raw: Vec<String>,
}

impl LineCursor {
    pub fn new(text: &str) -> Self {
        let raw: Vec<String> = text.lines().map(|l| l.trim_end().to_string()).collect();
        let lines = raw
            .iter()
            .enumerate()
            .filter_map(|(i, l)| {
                let t = l.trim();
                (!t.is_empty()).then(|| SourceLine { number: i + 1, text: t.to_string() })
            })
            .collect();
        Self { lines, current: None, repeat: false, raw }
    }

    /// Returns the next non-blank line, or `None` at end of input.
    pub fn next_line(&mut self) -> Option<&str> {
        if self.repeat {
            self.repeat = false;
            return self.current.map(|i| self.lines[i].text.as_str());
        }
        let next = self.current.map_or(0, |i| i + 1);
        if next >= self.lines.len() {
            self.current = Some(self.lines.len());
            return None;
        }
        self.current = Some(next);
        Some(self.lines[next].text.as_str())
    }

    /// Hands the last line out again on the next call. A second push back
    /// before that call is a no-op.
    pub fn push_back(&mut self) {
        if matches!(self.current, Some(i) if i < self.lines.len()) {
            self.repeat = true;
        }
    }

    /// 1-based source line number of the last line handed out.
    pub fn line_number(&self) -> usize {
        match self.current {
            Some(i) if i < self.lines.len() => self.lines[i].number,
            Some(_) => self.raw.len(),
            None => 0,
        }
    }

    /// A window of two lines around the current position, the current line
    /// marked with `>>>`.
    pub fn context(&self) -> String {
        let current = self.line_number();
        if current == 0 || self.raw.is_empty() {
            return String::new();
        }
        let start = current.saturating_sub(2).max(1);
        let end = (current + 2).min(self.raw.len());
        let mut out = String::new();
        for n in start..=end {
            let prefix = if n == current { ">>> " } else { "    " };
            let _ = writeln!(out, "{prefix}{n:4}: {}", self.raw[n - 1]);
        }
        out
    }

    /// Skips forward past the `End <kind>` marker matching the block opened
    /// by the last line, honouring nested blocks of the same kind.
    pub fn skip_block(&mut self, kind: &str) {
        let start = format!("Start {kind}");
        let end = format!("End {kind}");
        let mut depth = 1usize;
        while let Some(line) = self.next_line() {
            if line == start {
                depth += 1;
            } else if line == end {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
        }
    }
}
