/// Default number of characters of worker stderr kept for diagnostics.
pub const DEFAULT_DIAGNOSTIC_CAPACITY: usize = 2000;

/// Last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    let start = text
        .char_indices()
        .nth(total - max_chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    &text[start..]
}

/// Bounded tail of the worker's error stream.
///
/// Capacity is counted in characters, not bytes. Writing past capacity drops
/// the oldest characters first, so the buffer always holds the most recent
/// output and never grows past `capacity`.
#[derive(Debug, Clone)]
pub struct DiagnosticBuffer {
    capacity: usize,
    text: String,
    chars: usize,
}

impl DiagnosticBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            text: String::new(),
            chars: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.chars
    }

    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }

    pub fn push(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.text.push_str(chunk);
        self.chars += chunk.chars().count();

        if self.chars > self.capacity {
            let overflow = self.chars - self.capacity;
            let cut = self
                .text
                .char_indices()
                .nth(overflow)
                .map(|(idx, _)| idx)
                .unwrap_or(self.text.len());
            self.text.drain(..cut);
            self.chars = self.capacity;
        }
    }

    /// Append raw stream bytes. Invalid UTF-8 is replaced, never rejected.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.push(&String::from_utf8_lossy(bytes));
    }

    pub fn snapshot(&self) -> String {
        self.text.clone()
    }
}

impl Default for DiagnosticBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_DIAGNOSTIC_CAPACITY)
    }
}
