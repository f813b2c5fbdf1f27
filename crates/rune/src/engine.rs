//! High-level inference engine.

use crate::tokenizer::Tokenizer;
use anyhow::{bail, Context, Result};
use candle_core::Device;
use rune_core::{
    generation::{FinishReason, GenerationConfig, Generator, Sampling},
    model::{Checkpoint, ModelConfig, Transformer},
    tokens::{TextCodec, PASS_TO_CLOUD},
};
use std::path::PathBuf;

/// Model hyperparameters inside a model directory.
pub const CONFIG_FILE: &str = "config.json";
/// Parameter checkpoint inside a model directory.
pub const WEIGHTS_FILE: &str = "weights.safetensors";
/// Tokenizer inside a model directory.
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Whether generated text is the request to hand off to the cloud model.
pub fn is_pass_to_cloud(text: &str) -> bool {
    text.trim() == PASS_TO_CLOUD
}

/// Configuration for the inference engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding config.json, weights.safetensors and tokenizer.json.
    pub model_dir: PathBuf,
    /// Default token selection for requests.
    pub sampling: Sampling,
    /// Default sampler seed for requests.
    pub seed: u64,
    /// Cap on prompt plus output; `None` uses the model's context window.
    pub max_seq_len: Option<usize>,
    /// Device the weights are loaded onto.
    pub device: Device,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::new(),
            sampling: Sampling::Greedy,
            seed: 0,
            max_seq_len: None,
            device: Device::Cpu,
        }
    }
}

/// Builder for creating an Engine.
#[derive(Debug, Default)]
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    /// Create a new engine builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the model directory.
    pub fn model_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.model_dir = dir.into();
        self
    }

    /// Set the default sampling strategy.
    pub fn sampling(mut self, sampling: Sampling) -> Self {
        self.config.sampling = sampling;
        self
    }

    /// Set the default sampler seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Set maximum sequence length.
    pub fn max_seq_len(mut self, len: usize) -> Self {
        self.config.max_seq_len = Some(len);
        self
    }

    /// Set the device.
    pub fn device(mut self, device: Device) -> Self {
        self.config.device = device;
        self
    }

    /// Load the model directory and build the engine.
    pub fn build(self) -> Result<Engine> {
        let dir = &self.config.model_dir;
        if !dir.is_dir() {
            bail!("model directory {} does not exist", dir.display());
        }

        let config_path = dir.join(CONFIG_FILE);
        let model_config = ModelConfig::from_file(&config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;

        let weights_path = dir.join(WEIGHTS_FILE);
        let checkpoint =
            Checkpoint::load_with_config(&weights_path, &model_config, &self.config.device)
                .with_context(|| format!("loading {}", weights_path.display()))?;
        let model = Transformer::new(checkpoint.config, &checkpoint.weights)?;

        let tokenizer = Tokenizer::from_file(dir.join(TOKENIZER_FILE))?;

        tracing::info!(
            model_dir = %dir.display(),
            params = model.config().param_count(),
            step = checkpoint.step,
            "Loaded model"
        );
        Engine::with_config(model, tokenizer, self.config)
    }
}

/// High-level inference engine.
///
/// Immutable once built; requests borrow it and each owns its own cache,
/// so one engine can serve several threads.
pub struct Engine {
    config: EngineConfig,
    model: Transformer,
    tokenizer: Tokenizer,
}

impl Engine {
    /// Create a new engine builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Assemble an engine from an in-memory model and tokenizer.
    pub fn from_parts(model: Transformer, tokenizer: Tokenizer) -> Result<Self> {
        let config = EngineConfig {
            device: model.device().clone(),
            ..EngineConfig::default()
        };
        Self::with_config(model, tokenizer, config)
    }

    fn with_config(model: Transformer, tokenizer: Tokenizer, config: EngineConfig) -> Result<Self> {
        let vocab = model.config().vocab_size;
        if tokenizer.vocab_size() > vocab {
            bail!(
                "tokenizer has {} tokens but the model vocabulary is {}",
                tokenizer.vocab_size(),
                vocab
            );
        }
        Ok(Self {
            config,
            model,
            tokenizer,
        })
    }

    /// Get engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get model reference.
    pub fn model(&self) -> &Transformer {
        &self.model
    }

    /// Get tokenizer reference.
    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Generate a script for a natural-language command.
    pub fn generate(&self, command: &str) -> GenerateRequest<'_> {
        GenerateRequest {
            engine: self,
            command: command.to_string(),
            sampling: self.config.sampling,
            seed: self.config.seed,
            max_seq_len: self.config.max_seq_len,
        }
    }
}

/// A generation request.
pub struct GenerateRequest<'a> {
    engine: &'a Engine,
    command: String,
    sampling: Sampling,
    seed: u64,
    max_seq_len: Option<usize>,
}

impl<'a> GenerateRequest<'a> {
    /// Override the sampling strategy.
    pub fn sampling(mut self, sampling: Sampling) -> Self {
        self.sampling = sampling;
        self
    }

    /// Override the sampler seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Cap prompt plus output length.
    pub fn max_seq_len(mut self, len: usize) -> Self {
        self.max_seq_len = Some(len);
        self
    }

    /// Execute the generation.
    pub fn execute(self) -> Result<GenerateResult> {
        self.execute_with(|_| true)
    }

    /// Execute the generation, handing each token to `on_token`.
    ///
    /// Returning `false` from the callback stops generation early.
    pub fn execute_with<F>(self, on_token: F) -> Result<GenerateResult>
    where
        F: FnMut(u32) -> bool,
    {
        let tokenizer = &self.engine.tokenizer;
        let command = tokenizer.encode(&self.command)?;

        let mut config = GenerationConfig::default()
            .with_sampling(self.sampling)
            .with_seed(self.seed);
        config.max_seq_len = self.max_seq_len;

        let output = Generator::new(&self.engine.model, &command, config)?.run_with(on_token)?;
        let text = output.decode(tokenizer)?;
        let script = text.trim().to_string();

        tracing::debug!(
            command = %self.command,
            generated = output.tokens.len(),
            reason = ?output.finish_reason,
            "Request complete"
        );

        Ok(GenerateResult {
            is_cloud: is_pass_to_cloud(&script),
            script,
            tokens: output.tokens,
            num_prompt_tokens: output.prompt_len,
            finish_reason: output.finish_reason,
        })
    }
}

/// Result of script generation.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct GenerateResult {
    /// Generated script, surrounding whitespace removed.
    pub script: String,
    /// The model asked to hand the command to the cloud.
    pub is_cloud: bool,
    /// Generated token IDs, stop token excluded.
    pub tokens: Vec<u32>,
    /// Number of prompt tokens, control tokens included.
    pub num_prompt_tokens: usize,
    /// Why generation ended.
    pub finish_reason: FinishReason,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("model", &self.model)
            .field("tokenizer", &self.tokenizer)
            .finish()
    }
}
