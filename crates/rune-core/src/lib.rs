//! # Rune Core
//!
//! A small decoder-only transformer that turns a natural-language command
//! into a short automation script, or into the literal `PASS_TO_CLOUD`.
//!
//! This crate provides:
//! - **Model**: RoPE self-attention with KV cache, SwiGLU feed-forward, RMSNorm
//! - **Generation**: a prompt → tokens state machine with pluggable sampling
//! - **Training**: masked cross-entropy, AdamW, warmup + cosine schedule
//! - **Checkpoints**: SafeTensors files validated against the model config

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod generation;
pub mod model;
pub mod tokens;
pub mod training;

pub use error::{Result, RuneError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Result, RuneError};
    pub use crate::generation::{
        FinishReason, GenerationConfig, GenerationOutput, Generator, Sampling,
    };
    pub use crate::model::{Checkpoint, KvCache, ModelConfig, Transformer, Weights};
    pub use crate::tokens::{TextCodec, END, INPUT, OUTPUT, PAD, PASS_TO_CLOUD};
    pub use crate::training::{Trainer, TrainerConfig, TrainingExample};
}
