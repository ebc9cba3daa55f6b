use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_TAIL_LINES: usize = 16;

/// Bounded ring of the most recent lines written by one child.
pub struct LineRing {
    max_lines: usize,
    lines: Mutex<VecDeque<String>>,
}

impl LineRing {
    pub fn new(max_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            max_lines,
            lines: Mutex::new(VecDeque::with_capacity(max_lines)),
        }
    }

    /// Append a line, dropping the oldest if over capacity.
    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.push_back(line);
        while lines.len() > self.max_lines {
            lines.pop_front();
        }
    }

    /// Most recent non-blank line, if any.
    pub fn last(&self) -> Option<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines
            .iter()
            .rev()
            .find(|line| !line.trim().is_empty())
            .cloned()
    }

    /// Copy of every retained line, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }
}

impl Default for LineRing {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_LINES)
    }
}
