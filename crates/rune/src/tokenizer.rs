//! HuggingFace tokenizer behind the [`TextCodec`] boundary.
//!
//! The vocabulary must reserve the four control tokens at the ids the
//! model was trained with:
//!
//! | id | token        |
//! |----|--------------|
//! | 0  | `<\|input\|>`  |
//! | 1  | `<\|output\|>` |
//! | 2  | `<\|end\|>`    |
//! | 3  | `<\|pad\|>`    |

use rune_core::tokens::{TextCodec, END, INPUT, OUTPUT, PAD};
use rune_core::{Result, RuneError};
use std::path::Path;
use std::str::FromStr;
use tokenizers::Tokenizer as HfTokenizer;

/// Control tokens and the ids they must map to.
pub const SPECIAL_TOKENS: [(&str, u32); 4] = [
    ("<|input|>", INPUT),
    ("<|output|>", OUTPUT),
    ("<|end|>", END),
    ("<|pad|>", PAD),
];

/// Byte-level BPE tokenizer loaded from `tokenizer.json`.
#[derive(Clone)]
pub struct Tokenizer {
    inner: HfTokenizer,
}

impl Tokenizer {
    /// Load a tokenizer from a tokenizer.json file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = HfTokenizer::from_file(path.as_ref()).map_err(|e| {
            RuneError::Tokenizer(format!(
                "failed to load {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_hf(inner)
    }

    /// Load a tokenizer from a model directory.
    ///
    /// Looks for tokenizer.json in the directory.
    pub fn from_dir<P: AsRef<Path>>(model_dir: P) -> Result<Self> {
        let tokenizer_path = model_dir.as_ref().join("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(RuneError::Tokenizer(format!(
                "tokenizer.json not found in {}",
                model_dir.as_ref().display()
            )));
        }
        Self::from_file(tokenizer_path)
    }

    /// Parse a tokenizer from its JSON serialization.
    pub fn from_json(json: &str) -> Result<Self> {
        let inner = HfTokenizer::from_str(json)
            .map_err(|e| RuneError::Tokenizer(format!("failed to parse tokenizer: {}", e)))?;
        Self::from_hf(inner)
    }

    /// Wrap an already constructed HuggingFace tokenizer.
    ///
    /// Fails unless every control token is present at its reserved id.
    pub fn from_hf(inner: HfTokenizer) -> Result<Self> {
        for (token, expected) in SPECIAL_TOKENS {
            match inner.token_to_id(token) {
                Some(id) if id == expected => {}
                Some(id) => {
                    return Err(RuneError::Tokenizer(format!(
                        "{token} has id {id}, expected {expected}"
                    )))
                }
                None => {
                    return Err(RuneError::Tokenizer(format!(
                        "{token} missing from vocabulary"
                    )))
                }
            }
        }
        Ok(Self { inner })
    }

    /// Vocabulary size, added tokens included.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Token to string (for debugging).
    pub fn id_to_token(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }

    /// String to token ID.
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}

impl TextCodec for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| RuneError::Tokenizer(format!("failed to encode text: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.inner
            .decode(tokens, true)
            .map_err(|e| RuneError::Tokenizer(format!("failed to decode tokens: {}", e)))
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab_size())
            .finish()
    }
}
