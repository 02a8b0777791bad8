//! Sentence-sized chunking of streamed reply text
//!
//! Tokens are buffered until a sentence boundary (`". "`, `"? "`, `"! "` or a
//! newline) arrives, so speech synthesis can start on the first sentence while
//! the model is still generating. Long run-on text without punctuation is cut
//! once it exceeds a word budget.

/// Sentence boundaries, the trailing space included
const BOUNDARIES: [&str; 4] = [". ", "? ", "! ", "\n"];

#[derive(Clone, Debug)]
pub struct PhraseChunker {
    buffer: String,
    max_words: usize,
}

impl Default for PhraseChunker {
    fn default() -> Self {
        Self::new(18)
    }
}

impl PhraseChunker {
    pub fn new(max_words: usize) -> Self {
        Self {
            buffer: String::new(),
            max_words: max_words.max(1),
        }
    }

    /// Feed a text delta and take every phrase that is now complete
    pub fn feed(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);
        let mut phrases = Vec::new();

        while let Some(end) = self.next_boundary() {
            let phrase: String = self.buffer.drain(..end).collect();
            if let Some(phrase) = speakable(&phrase) {
                phrases.push(phrase);
            }
        }

        if let Some(cut) = self.word_cut() {
            let phrase: String = self.buffer.drain(..cut).collect();
            if let Some(phrase) = speakable(&phrase) {
                phrases.push(phrase);
            }
        }

        phrases
    }

    /// Take whatever is left at the end of the reply
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        speakable(&rest)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Byte offset just past the earliest sentence boundary
    fn next_boundary(&self) -> Option<usize> {
        BOUNDARIES
            .iter()
            .filter_map(|sep| self.buffer.find(sep).map(|idx| idx + sep.len()))
            .min()
    }

    /// Byte offset of the first word past the budget. Only cuts once the next
    /// word has started, so a word still being streamed is never split.
    fn word_cut(&self) -> Option<usize> {
        let mut words = 0;
        let mut in_word = false;
        for (idx, ch) in self.buffer.char_indices() {
            if ch.is_whitespace() {
                in_word = false;
            } else if !in_word {
                in_word = true;
                if words == self.max_words {
                    return Some(idx);
                }
                words += 1;
            }
        }
        None
    }
}

/// Trimmed phrase, or None when there is nothing to pronounce
fn speakable(phrase: &str) -> Option<String> {
    let phrase = phrase.trim();
    phrase
        .chars()
        .any(char::is_alphanumeric)
        .then(|| phrase.to_string())
}
