//! Autoregressive generation.
//!
//! A [`Generator`] drives one session through three states:
//!
//! ```text
//! PromptEncode --prefill--> Generating --END / PAD / length / abort--> Done
//! ```
//!
//! Each session owns its own [`KvCache`], so several generators may borrow
//! the same [`Transformer`] at once.

mod golden;
mod sampling;

pub use golden::{GoldenCase, GoldenResult, GoldenSummary, GoldenTestHarness};
pub use sampling::{argmax, Sampler, Sampling};

use crate::error::{Result, RuneError};
use crate::model::{KvCache, Transformer};
use crate::tokens::{self, TextCodec, END, PAD};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model emitted END (or PAD).
    Stop,
    /// Prompt plus output reached the length limit.
    Length,
    /// The caller stopped the session.
    Aborted,
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    /// Prompt not yet run through the model.
    PromptEncode,
    /// Producing tokens one at a time.
    Generating,
    /// Finished; no more tokens will be produced.
    Done(FinishReason),
}

/// Per-session generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Token selection strategy.
    #[serde(default)]
    pub sampling: Sampling,
    /// Seed for the sampler's random source.
    #[serde(default)]
    pub seed: u64,
    /// Cap on prompt plus output; never above the model's context window.
    #[serde(default)]
    pub max_seq_len: Option<usize>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            sampling: Sampling::Greedy,
            seed: 0,
            max_seq_len: None,
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding, the deterministic default.
    pub fn greedy() -> Self {
        Self::default()
    }

    /// Use the given sampling strategy.
    pub fn with_sampling(mut self, sampling: Sampling) -> Self {
        self.sampling = sampling;
        self
    }

    /// Use the given sampler seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Cap the total sequence length.
    pub fn with_max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = Some(max_seq_len);
        self
    }
}

/// Result of a finished session.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    /// Generated tokens, stop token excluded.
    pub tokens: Vec<u32>,
    /// Length of the encoded prompt.
    pub prompt_len: usize,
    /// Why generation ended.
    pub finish_reason: FinishReason,
}

impl GenerationOutput {
    /// Decode the generated tokens.
    pub fn decode(&self, codec: &dyn TextCodec) -> Result<String> {
        codec.decode(&self.tokens)
    }
}

/// One generation session over a shared model.
pub struct Generator<'m> {
    model: &'m Transformer,
    cache: KvCache,
    sampler: Sampler,
    prompt: Vec<u32>,
    generated: Vec<u32>,
    /// Logits for the next position, present while generating.
    next_logits: Option<Tensor>,
    state: GenerationState,
    max_seq_len: usize,
}

impl<'m> Generator<'m> {
    /// Start a session for `command` tokens, framed as `<INPUT> command <OUTPUT>`.
    pub fn new(model: &'m Transformer, command: &[u32], config: GenerationConfig) -> Result<Self> {
        Self::from_prompt(model, tokens::prompt(command), config)
    }

    /// Start a session from an already framed prompt.
    pub fn from_prompt(
        model: &'m Transformer,
        prompt: Vec<u32>,
        config: GenerationConfig,
    ) -> Result<Self> {
        let model_max = model.config().max_seq_len;
        let max_seq_len = config.max_seq_len.map_or(model_max, |m| m.min(model_max));

        config.sampling.validate()?;
        if prompt.is_empty() {
            return Err(RuneError::EmptyBatch("prompt has no tokens".into()));
        }
        if prompt.len() > max_seq_len {
            return Err(RuneError::PromptTooLong {
                len: prompt.len(),
                max: max_seq_len,
            });
        }

        Ok(Self {
            model,
            cache: model.new_cache(),
            sampler: Sampler::new(config.sampling, config.seed),
            prompt,
            generated: Vec::new(),
            next_logits: None,
            state: GenerationState::PromptEncode,
            max_seq_len,
        })
    }

    /// Current state.
    pub fn state(&self) -> GenerationState {
        self.state
    }

    /// The framed prompt.
    pub fn prompt(&self) -> &[u32] {
        &self.prompt
    }

    /// Tokens generated so far.
    pub fn generated(&self) -> &[u32] {
        &self.generated
    }

    /// Prompt plus generated length.
    pub fn total_len(&self) -> usize {
        self.prompt.len() + self.generated.len()
    }

    /// Advance by one token.
    ///
    /// Returns the newly generated token, or `None` once the session is
    /// done. The first call also encodes the prompt.
    pub fn next_token(&mut self) -> Result<Option<u32>> {
        match self.state {
            GenerationState::Done(_) => return Ok(None),
            GenerationState::PromptEncode => {
                let logits = self.model.prefill(&self.prompt, &mut self.cache)?;
                self.next_logits = Some(logits);
                self.state = GenerationState::Generating;
                tracing::trace!(prompt_len = self.prompt.len(), "Prompt encoded");
            }
            GenerationState::Generating => {}
        }

        if self.total_len() >= self.max_seq_len {
            self.finish(FinishReason::Length);
            return Ok(None);
        }

        let Some(logits) = self.next_logits.take() else {
            self.finish(FinishReason::Length);
            return Ok(None);
        };

        let token = self.sampler.sample(&logits)?;
        if token == END || token == PAD {
            self.finish(FinishReason::Stop);
            return Ok(None);
        }

        self.generated.push(token);
        if self.total_len() >= self.max_seq_len {
            self.finish(FinishReason::Length);
        } else {
            self.next_logits = Some(self.model.step(token, &mut self.cache)?);
        }
        Ok(Some(token))
    }

    /// Stop the session; later calls to [`next_token`](Self::next_token) return `None`.
    pub fn abort(&mut self) {
        if !matches!(self.state, GenerationState::Done(_)) {
            self.finish(FinishReason::Aborted);
        }
    }

    /// Generate until done.
    pub fn run(self) -> Result<GenerationOutput> {
        self.run_with(|_| true)
    }

    /// Generate until done, handing each token to `on_token`.
    ///
    /// Returning `false` from the callback aborts the session.
    pub fn run_with<F>(mut self, mut on_token: F) -> Result<GenerationOutput>
    where
        F: FnMut(u32) -> bool,
    {
        while let Some(token) = self.next_token()? {
            if !on_token(token) {
                self.abort();
                break;
            }
        }

        let finish_reason = match self.state {
            GenerationState::Done(reason) => reason,
            _ => FinishReason::Aborted,
        };
        Ok(GenerationOutput {
            prompt_len: self.prompt.len(),
            tokens: self.generated,
            finish_reason,
        })
    }

    fn finish(&mut self, reason: FinishReason) {
        self.state = GenerationState::Done(reason);
        self.next_logits = None;
        tracing::debug!(
            prompt_len = self.prompt.len(),
            generated = self.generated.len(),
            reason = ?reason,
            "Generation finished"
        );
    }
}

impl std::fmt::Debug for Generator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("state", &self.state)
            .field("prompt_len", &self.prompt.len())
            .field("generated", &self.generated.len())
            .field("max_seq_len", &self.max_seq_len)
            .finish()
    }
}

/// Generate a script for `command` tokens in one call.
pub fn generate(
    model: &Transformer,
    command: &[u32],
    config: GenerationConfig,
) -> Result<GenerationOutput> {
    Generator::new(model, command, config)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelConfig;
    use candle_core::Device;

    fn tiny() -> Transformer {
        Transformer::random(ModelConfig::tiny(24), 5, &Device::Cpu).unwrap()
    }

    #[test]
    fn states_progress_in_order() {
        let model = tiny();
        let mut gen = Generator::new(&model, &[6, 7], GenerationConfig::greedy()).unwrap();
        assert_eq!(gen.state(), GenerationState::PromptEncode);
        assert_eq!(gen.prompt(), &[tokens::INPUT, 6, 7, tokens::OUTPUT]);

        let first = gen.next_token().unwrap();
        match gen.state() {
            GenerationState::Generating => assert!(first.is_some()),
            GenerationState::Done(_) => {}
            GenerationState::PromptEncode => panic!("prompt not encoded"),
        }
    }

    #[test]
    fn output_respects_length_bound() {
        let model = tiny();
        let config = GenerationConfig::greedy().with_max_seq_len(10);
        let out = generate(&model, &[6, 7, 8], config).unwrap();

        assert!(out.prompt_len + out.tokens.len() <= 10);
        assert!(!out.tokens.contains(&END));
        if out.finish_reason == FinishReason::Length {
            assert_eq!(out.prompt_len + out.tokens.len(), 10);
        }
    }

    #[test]
    fn greedy_is_deterministic() {
        let model = tiny();
        let a = generate(&model, &[9, 10], GenerationConfig::greedy()).unwrap();
        let b = generate(&model, &[9, 10], GenerationConfig::greedy()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let model = tiny();
        let config = GenerationConfig::default()
            .with_sampling(Sampling::temperature(1.5))
            .with_seed(17);
        let a = generate(&model, &[9, 10], config.clone()).unwrap();
        let b = generate(&model, &[9, 10], config).unwrap();
        assert_eq!(a.tokens, b.tokens);
    }

    #[test]
    fn prompt_filling_context_finishes_on_length() {
        let model = tiny();
        let config = GenerationConfig::greedy().with_max_seq_len(6);
        let out = generate(&model, &[6, 7, 8, 9], config).unwrap();
        assert!(out.tokens.is_empty());
        assert_eq!(out.finish_reason, FinishReason::Length);
    }

    #[test]
    fn oversized_prompt_rejected() {
        let model = tiny();
        let command = vec![6u32; 63];
        assert!(matches!(
            Generator::new(&model, &command, GenerationConfig::greedy()),
            Err(RuneError::PromptTooLong { len: 65, max: 64 })
        ));
    }

    #[test]
    fn zero_top_k_rejected_before_prefill() {
        let model = tiny();
        let config = GenerationConfig::default().with_sampling(Sampling::TopK {
            k: 0,
            temperature: 1.0,
        });
        assert!(matches!(
            Generator::new(&model, &[6], config),
            Err(RuneError::Sampling(_))
        ));
    }

    #[test]
    fn callback_can_abort() {
        let model = tiny();
        let mut seen = 0;
        let gen = Generator::new(&model, &[6], GenerationConfig::greedy()).unwrap();
        let out = gen
            .run_with(|_| {
                seen += 1;
                false
            })
            .unwrap();

        assert!(out.tokens.len() <= 1);
        if seen == 1 {
            assert_eq!(out.finish_reason, FinishReason::Aborted);
        }
    }

    #[test]
    fn done_session_yields_nothing() {
        let model = tiny();
        let mut gen = Generator::new(&model, &[6], GenerationConfig::greedy()).unwrap();
        gen.abort();
        assert_eq!(gen.state(), GenerationState::Done(FinishReason::Aborted));
        assert_eq!(gen.next_token().unwrap(), None);
    }

    #[test]
    fn sessions_share_a_model() {
        let model = tiny();
        let mut a = Generator::new(&model, &[6], GenerationConfig::greedy()).unwrap();
        let mut b = Generator::new(&model, &[6], GenerationConfig::greedy()).unwrap();
        for _ in 0..3 {
            assert_eq!(a.next_token().unwrap(), b.next_token().unwrap());
        }
    }
}
