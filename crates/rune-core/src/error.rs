//! Error types for Rune Core.

use thiserror::Error;

/// Result type alias for Rune operations.
pub type Result<T> = std::result::Result<T, RuneError>;

/// Errors that can occur in Rune operations.
#[derive(Error, Debug)]
pub enum RuneError {
    /// Model configuration is internally inconsistent.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A parameter tensor does not match the shape the config implies.
    #[error("shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Parameter name.
        name: String,
        /// Shape derived from the config.
        expected: Vec<usize>,
        /// Shape found in the weights.
        actual: Vec<usize>,
    },

    /// A parameter the config requires is absent.
    #[error("missing parameter: {0}")]
    MissingParameter(String),

    /// The weights carry a parameter the config does not know about.
    #[error("unexpected parameter: {0}")]
    UnexpectedParameter(String),

    /// Malformed, truncated or otherwise unreadable checkpoint.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Token id outside the vocabulary.
    #[error("token {token} out of range for vocabulary of {vocab_size}")]
    InvalidToken {
        /// Offending id.
        token: u32,
        /// Vocabulary size.
        vocab_size: usize,
    },

    /// Prompt does not fit in the context window.
    #[error("prompt of {len} tokens exceeds max_seq_len {max}")]
    PromptTooLong {
        /// Prompt length.
        len: usize,
        /// Context window.
        max: usize,
    },

    /// Training sequence does not fit in the context window.
    #[error("sequence of {len} tokens exceeds max_seq_len {max}")]
    SequenceTooLong {
        /// Sequence length.
        len: usize,
        /// Context window.
        max: usize,
    },

    /// Appending to the KV cache would exceed the context window.
    #[error("kv cache overflow: {len} positions exceeds max_seq_len {max}")]
    CacheOverflow {
        /// Length after the rejected append.
        len: usize,
        /// Context window.
        max: usize,
    },

    /// The cache was sized for a different model.
    #[error("kv cache mismatch: {0}")]
    CacheMismatch(String),

    /// Loss became NaN or infinite.
    #[error("non-finite loss at step {step}")]
    NonFiniteLoss {
        /// Optimizer step.
        step: usize,
    },

    /// A gradient became NaN or infinite.
    #[error("non-finite gradient for {name} at step {step}")]
    NonFiniteGradient {
        /// Optimizer step.
        step: usize,
        /// Parameter name.
        name: String,
    },

    /// Empty batch or dataset.
    #[error("empty batch: {0}")]
    EmptyBatch(String),

    /// No token could be drawn from the distribution.
    #[error("sampling error: {0}")]
    Sampling(String),

    /// Error reported by the text codec.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}
