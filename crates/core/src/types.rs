//! Decoded output types

use serde::{Deserialize, Serialize};

/// A decoded hypothesis for one utterance.
///
/// `score` is the acoustic log probability of the hypothesis; after
/// language-model rescoring it is the combined score
/// `acoustic + alpha * lm + beta * word_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    /// Decoded text
    pub text: String,
    /// Token id sequence (blank and repeats already collapsed)
    pub tokens: Vec<u32>,
    /// Log-probability score
    pub score: f32,
}

impl Hypothesis {
    pub fn new(text: impl Into<String>, tokens: Vec<u32>, score: f32) -> Self {
        Self {
            text: text.into(),
            tokens,
            score,
        }
    }

    /// Empty hypothesis with zero score
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            tokens: Vec::new(),
            score: 0.0,
        }
    }

    /// Number of whitespace-separated words in the decoded text
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_count() {
        let hyp = Hypothesis::new("hello world", vec![1, 2], -1.5);
        assert_eq!(hyp.word_count(), 2);
        assert_eq!(Hypothesis::empty().word_count(), 0);
    }
}
