//! Running text and reasoning buffers for one stream.

/// Reconstructs the answer text and the current reasoning block from deltas
/// that may arrive twice: once incrementally and once as a complete block.
#[derive(Debug, Default)]
pub struct Accumulator {
    text: String,
    text_done: bool,
    reasoning: String,
    reasoning_done: bool,
}

impl Accumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a text chunk and returns it for emission as a delta.
    ///
    /// Returns `None` for empty chunks and for chunks the buffer already ends
    /// with.
    pub fn append_text(&mut self, chunk: &str) -> Option<String> {
        append_deduplicated(&mut self.text, chunk)
    }

    /// Appends a reasoning chunk with the same duplicate rule as text.
    pub fn append_reasoning(&mut self, chunk: &str) -> Option<String> {
        let appended = append_deduplicated(&mut self.reasoning, chunk);
        if appended.is_some() {
            self.reasoning_done = false;
        }
        appended
    }

    /// Clears the reasoning buffer at the start of a new reasoning block.
    pub fn start_reasoning_block(&mut self) {
        self.reasoning.clear();
        self.reasoning_done = false;
    }

    /// Returns the full text exactly once; later calls return `None`.
    pub fn finalize(&mut self) -> Option<String> {
        if self.text_done {
            return None;
        }
        self.text_done = true;
        Some(self.text.clone())
    }

    /// Returns the current reasoning block once, if it has any content.
    pub fn finish_reasoning(&mut self) -> Option<String> {
        if self.reasoning_done || self.reasoning.is_empty() {
            return None;
        }
        self.reasoning_done = true;
        Some(self.reasoning.clone())
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }
}

fn append_deduplicated(buffer: &mut String, chunk: &str) -> Option<String> {
    if chunk.is_empty() || buffer.ends_with(chunk) {
        return None;
    }
    buffer.push_str(chunk);
    Some(chunk.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deltas_concatenate_in_order() {
        let mut acc = Accumulator::new();
        let emitted: Vec<_> = ["Hel", "lo", " world"]
            .iter()
            .filter_map(|d| acc.append_text(d))
            .collect();

        assert_eq!(emitted, vec!["Hel", "lo", " world"]);
        assert_eq!(acc.finalize().as_deref(), Some("Hello world"));
    }

    #[test]
    fn test_complete_block_after_deltas_is_suppressed() {
        let mut acc = Accumulator::new();
        acc.append_text("Hello");
        acc.append_text(" world");

        assert_eq!(acc.append_text("Hello world"), None);
        assert_eq!(acc.text(), "Hello world");
    }

    #[test]
    fn test_empty_chunk_is_ignored() {
        let mut acc = Accumulator::new();
        assert_eq!(acc.append_text(""), None);
        assert_eq!(acc.finalize().as_deref(), Some(""));
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut acc = Accumulator::new();
        acc.append_text("done");

        assert_eq!(acc.finalize().as_deref(), Some("done"));
        assert_eq!(acc.finalize(), None);
        assert_eq!(acc.finalize(), None);
    }

    #[test]
    fn test_reasoning_block_reset() {
        let mut acc = Accumulator::new();
        acc.append_reasoning("first thought");
        assert_eq!(acc.finish_reasoning().as_deref(), Some("first thought"));
        assert_eq!(acc.finish_reasoning(), None);

        acc.start_reasoning_block();
        assert_eq!(acc.reasoning(), "");
        assert_eq!(
            acc.append_reasoning("second").as_deref(),
            Some("second")
        );
        assert_eq!(acc.finish_reasoning().as_deref(), Some("second"));
    }

    #[test]
    fn test_reasoning_duplicate_suppressed() {
        let mut acc = Accumulator::new();
        acc.append_reasoning("let me think");
        assert_eq!(acc.append_reasoning("let me think"), None);
        assert_eq!(acc.reasoning(), "let me think");
    }
}
