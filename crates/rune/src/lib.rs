//! # Rune
//!
//! Turns a natural-language command into a short automation script, or
//! into `PASS_TO_CLOUD` when the request is beyond the local model.
//!
//! This crate wires the [`rune_core`] model to a HuggingFace tokenizer and
//! a model directory on disk:
//!
//! ```text
//! model_dir/
//! ├── config.json
//! ├── weights.safetensors
//! └── tokenizer.json
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rune::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let engine = Engine::builder().model_dir("models/rune-small").build()?;
//!
//!     let result = engine.generate("open Safari").execute()?;
//!     if result.is_cloud {
//!         println!("forwarding to the cloud model");
//!     } else {
//!         println!("{}", result.script);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use rune_core::*;

mod engine;
mod tokenizer;

pub use engine::{
    is_pass_to_cloud, Engine, EngineBuilder, EngineConfig, GenerateRequest, GenerateResult,
    CONFIG_FILE, TOKENIZER_FILE, WEIGHTS_FILE,
};
pub use tokenizer::{Tokenizer, SPECIAL_TOKENS};

/// Commonly used types.
pub mod prelude {
    pub use crate::engine::{
        is_pass_to_cloud, Engine, EngineBuilder, EngineConfig, GenerateRequest, GenerateResult,
    };
    pub use crate::tokenizer::Tokenizer;
    pub use rune_core::prelude::*;

    // Re-export useful external types
    pub use anyhow;
    pub use tracing;
}

#[cfg(test)]
pub(crate) mod test_util {
    use crate::tokenizer::SPECIAL_TOKENS;

    /// Content words of the test vocabulary, ids 5 onward.
    pub const WORDS: [&str; 12] = [
        "open", "Safari", "set", "a", "timer", "for", "10", "minutes", "remind", "me", "to",
        "PASS_TO_CLOUD",
    ];

    /// A whitespace word-level tokenizer with the four control tokens.
    pub fn word_tokenizer_json() -> String {
        let added: Vec<serde_json::Value> = SPECIAL_TOKENS
            .iter()
            .map(|(content, id)| {
                serde_json::json!({
                    "id": id,
                    "content": content,
                    "single_word": false,
                    "lstrip": false,
                    "rstrip": false,
                    "normalized": false,
                    "special": true,
                })
            })
            .collect();

        let mut vocab = serde_json::Map::new();
        for (content, id) in SPECIAL_TOKENS {
            vocab.insert(content.to_string(), id.into());
        }
        vocab.insert("<unk>".to_string(), 4.into());
        for (i, word) in WORDS.iter().enumerate() {
            vocab.insert(word.to_string(), (5 + i).into());
        }

        serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": added,
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" },
        })
        .to_string()
    }
}
