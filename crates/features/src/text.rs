//! Text featurizer / vocabulary
//!
//! Maps tokens to integer ids and back over a fixed vocabulary. The CTC
//! blank occupies index 0 (`blank_at_zero`) or `num_classes - 1`; it never
//! appears in encoded output. An external language-model scorer can be
//! attached once; beam decoding picks it up when rescoring is requested.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use ctc_asr_config::DecoderConfig;
use ctc_asr_core::{Error, ExternalScorer, Result};

/// Vocabulary bijection plus the CTC blank and optional scorer.
pub struct TextFeaturizer {
    config: DecoderConfig,
    /// All class labels including the blank slot, indexed by id
    table: Vec<String>,
    /// Token -> id, excluding the blank
    index: HashMap<String, u32>,
    /// Longest token length in characters, for greedy matching
    max_token_chars: usize,
    blank: u32,
    scorer: OnceCell<Arc<dyn ExternalScorer>>,
}

const BLANK_LABEL: &str = "<blank>";

impl TextFeaturizer {
    /// Load the vocabulary file referenced by the decoder configuration.
    ///
    /// File format: one token per line, line index = token id (offset by the
    /// blank when `blank_at_zero`). Empty lines and `#` comments ignored.
    pub fn new(config: &DecoderConfig) -> Result<Self> {
        let path = Path::new(&config.vocabulary);
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Data(format!(
                "cannot read vocabulary {}: {}",
                path.display(),
                e
            ))
        })?;

        // lines() strips the newline but keeps interior whitespace, so a
        // bare-space line is a valid space token
        let tokens: Vec<String> = contents
            .lines()
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();

        Self::from_tokens(tokens, config.clone())
    }

    /// Build from an in-memory token list (order defines ids).
    pub fn from_tokens(tokens: Vec<String>, config: DecoderConfig) -> Result<Self> {
        if tokens.is_empty() {
            return Err(Error::Data("vocabulary is empty".to_string()));
        }

        let num_classes = tokens.len() + 1;
        let blank = if config.blank_at_zero {
            0
        } else {
            (num_classes - 1) as u32
        };
        let offset = if config.blank_at_zero { 1 } else { 0 };

        let mut table = vec![String::new(); num_classes];
        table[blank as usize] = BLANK_LABEL.to_string();

        let mut index = HashMap::with_capacity(tokens.len());
        let mut max_token_chars = 1;
        for (i, token) in tokens.into_iter().enumerate() {
            let id = (i + offset) as u32;
            if index.insert(token.clone(), id).is_some() {
                return Err(Error::Data(format!("duplicate vocabulary token: {token:?}")));
            }
            max_token_chars = max_token_chars.max(token.chars().count());
            table[id as usize] = token;
        }

        tracing::debug!(
            num_classes,
            blank,
            "Loaded vocabulary"
        );

        Ok(Self {
            config,
            table,
            index,
            max_token_chars,
            blank,
            scorer: OnceCell::new(),
        })
    }

    /// Total number of output classes, blank included
    pub fn num_classes(&self) -> usize {
        self.table.len()
    }

    /// Id of the CTC blank
    pub fn blank(&self) -> u32 {
        self.blank
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Class labels indexed by id (blank slot labelled `<blank>`)
    pub fn vocab_array(&self) -> &[String] {
        &self.table
    }

    /// Attach the external language-model scorer. Only the first attachment
    /// takes effect; later calls are ignored.
    pub fn add_scorer(&self, scorer: Arc<dyn ExternalScorer>) {
        if self.scorer.set(scorer).is_err() {
            tracing::warn!("Scorer already attached, ignoring");
        }
    }

    /// The attached scorer, if any
    pub fn scorer(&self) -> Option<&Arc<dyn ExternalScorer>> {
        self.scorer.get()
    }

    /// Encode text into token ids by greedy longest-match over the
    /// vocabulary. Fails on any span no vocabulary token covers.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let chars: Vec<char> = text.chars().collect();
        let mut ids = Vec::with_capacity(chars.len());
        let mut pos = 0;

        while pos < chars.len() {
            let mut matched = None;
            let upper = self.max_token_chars.min(chars.len() - pos);
            for len in (1..=upper).rev() {
                let candidate: String = chars[pos..pos + len].iter().collect();
                if let Some(&id) = self.index.get(&candidate) {
                    matched = Some((id, len));
                    break;
                }
            }
            match matched {
                Some((id, len)) => {
                    ids.push(id);
                    pos += len;
                }
                None => {
                    return Err(Error::Data(format!(
                        "text contains out-of-vocabulary span at char {pos}: {:?}",
                        chars[pos]
                    )))
                }
            }
        }

        Ok(ids)
    }

    /// Decode token ids back into text. The blank and out-of-range ids are
    /// dropped so padded label batches decode cleanly.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut text = String::new();
        for &id in ids {
            if id == self.blank || id as usize >= self.table.len() {
                continue;
            }
            text.push_str(&self.table[id as usize]);
        }
        text
    }
}
