//! External language-model scorer seam
//!
//! The toolkit never implements n-gram/trie scoring itself. Beam decoding
//! accepts any scorer behind this trait; the binary trie/n-gram artifact is
//! consumed by whichever implementation the embedder attaches.

/// Opaque language-model scoring capability.
///
/// Implementations return the language-model log probability of a full
/// candidate sentence. Beam search combines it with the acoustic score as
/// `acoustic + alpha * lm + beta * word_count`, with alpha/beta taken from
/// the decoder configuration.
pub trait ExternalScorer: Send + Sync {
    /// Log probability of `sentence` under the language model
    fn score(&self, sentence: &str) -> f32;
}
