//! Training examples and padded batches.

use crate::error::{Result, RuneError};
use crate::tokens::{self, TextCodec, PAD};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One untokenized command → script pair, as stored one per line in
/// `.jsonl` training files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPair {
    /// Natural-language command.
    pub input: String,
    /// Script, or `PASS_TO_CLOUD`.
    pub output: String,
}

impl TextPair {
    /// Read a JSON-lines file; blank lines are skipped.
    pub fn read_jsonl(path: &Path) -> Result<Vec<Self>> {
        Self::parse_jsonl(&std::fs::read_to_string(path)?)
    }

    /// Parse JSON-lines text.
    pub fn parse_jsonl(text: &str) -> Result<Vec<Self>> {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_str(line).map_err(RuneError::from))
            .collect()
    }
}

/// One command → script pair, already tokenized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingExample {
    /// Command tokens.
    pub command: Vec<u32>,
    /// Script tokens, without END.
    pub output: Vec<u32>,
}

impl TrainingExample {
    /// Create from token ids.
    pub fn new(command: Vec<u32>, output: Vec<u32>) -> Self {
        Self { command, output }
    }

    /// Tokenize a text pair.
    pub fn encode(codec: &dyn TextCodec, command: &str, output: &str) -> Result<Self> {
        Ok(Self::new(codec.encode(command)?, codec.encode(output)?))
    }

    /// Tokenize a stored pair.
    pub fn from_pair(codec: &dyn TextCodec, pair: &TextPair) -> Result<Self> {
        Self::encode(codec, &pair.input, &pair.output)
    }

    /// Full sequence `<INPUT> command <OUTPUT> output <END>`.
    pub fn sequence(&self) -> Vec<u32> {
        tokens::training_sequence(&self.command, &self.output)
    }
}

/// A padded, shifted batch ready for the model.
///
/// For padded sequences `s`, the model reads `s[.., ..T-1]` and predicts
/// `s[.., 1..]`. The mask marks targets that fall in the supervised span.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Model input ids [batch, T-1] u32.
    pub inputs: Tensor,
    /// Next-token targets [batch, T-1] u32.
    pub targets: Tensor,
    /// 1.0 where the target is supervised [batch, T-1] f32.
    pub mask: Tensor,
    size: usize,
    supervised: usize,
}

impl Batch {
    /// Pad `sequences` with PAD to the longest one and build shifted tensors.
    pub fn from_sequences(
        sequences: &[Vec<u32>],
        vocab_size: usize,
        max_seq_len: usize,
        device: &Device,
    ) -> Result<Self> {
        if sequences.is_empty() {
            return Err(RuneError::EmptyBatch("no sequences".into()));
        }

        let width = sequences.iter().map(Vec::len).max().unwrap_or(0);
        if width > max_seq_len {
            return Err(RuneError::SequenceTooLong {
                len: width,
                max: max_seq_len,
            });
        }
        if width < 2 {
            return Err(RuneError::EmptyBatch(
                "sequences need at least two tokens".into(),
            ));
        }

        let rows = sequences.len();
        let span = width - 1;
        let mut inputs = Vec::with_capacity(rows * span);
        let mut targets = Vec::with_capacity(rows * span);
        let mut mask = Vec::with_capacity(rows * span);

        for seq in sequences {
            if let Some(&token) = seq.iter().find(|&&t| t as usize >= vocab_size) {
                return Err(RuneError::InvalidToken { token, vocab_size });
            }

            let mut padded = seq.clone();
            padded.resize(width, PAD);
            let supervised = tokens::loss_mask(&padded);

            inputs.extend_from_slice(&padded[..span]);
            targets.extend_from_slice(&padded[1..]);
            mask.extend(supervised[1..].iter().map(|&m| if m { 1.0f32 } else { 0.0 }));
        }

        let supervised = mask.iter().filter(|&&m| m > 0.0).count();

        Ok(Self {
            inputs: Tensor::from_vec(inputs, (rows, span), device)?,
            targets: Tensor::from_vec(targets, (rows, span), device)?,
            mask: Tensor::from_vec(mask, (rows, span), device)?,
            size: rows,
            supervised,
        })
    }

    /// Build a batch from examples.
    pub fn from_examples(
        examples: &[&TrainingExample],
        vocab_size: usize,
        max_seq_len: usize,
        device: &Device,
    ) -> Result<Self> {
        let sequences: Vec<Vec<u32>> = examples.iter().map(|e| e.sequence()).collect();
        Self::from_sequences(&sequences, vocab_size, max_seq_len, device)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Always false for a constructed batch.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of supervised target positions.
    pub fn supervised_positions(&self) -> usize {
        self.supervised
    }
}
