//! Training loop.
//!
//! Parameters live in candle [`Var`]s. The trainer's [`Transformer`] is
//! built from the same storage, so optimizer updates are visible to the
//! next forward pass without rebuilding anything. Matrices get AdamW weight
//! decay; norm scales do not.

use super::{masked_cross_entropy, Batch, TrainingExample, WarmupCosine};
use crate::error::{Result, RuneError};
use crate::model::{Checkpoint, ModelConfig, Transformer, Weights};
use candle_core::backprop::GradStore;
use candle_core::{Device, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Training hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Passes over the training set.
    pub epochs: usize,
    /// Examples per optimizer step.
    pub batch_size: usize,
    /// Learning rate at the end of warmup.
    pub peak_lr: f64,
    /// Learning rate at the end of the cosine decay.
    pub min_lr: f64,
    /// Linear warmup length in steps.
    pub warmup_steps: usize,
    /// Decoupled weight decay for matrices.
    pub weight_decay: f64,
    /// AdamW first-moment decay.
    pub beta1: f64,
    /// AdamW second-moment decay.
    pub beta2: f64,
    /// AdamW epsilon.
    pub eps: f64,
    /// Clip the global gradient norm to this value.
    pub max_grad_norm: Option<f64>,
    /// Seed for initialization and shuffling.
    pub seed: u64,
    /// Where per-epoch checkpoints go; none are written when unset.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            peak_lr: 3e-4,
            min_lr: 3e-5,
            warmup_steps: 100,
            weight_decay: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            max_grad_norm: Some(1.0),
            seed: 42,
            checkpoint_dir: None,
        }
    }
}

impl TrainerConfig {
    /// Check that the settings can drive a training run.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(RuneError::InvalidConfig(msg.to_string()));

        if self.batch_size == 0 {
            return fail("batch_size must be positive");
        }
        if !(self.peak_lr > 0.0) || self.min_lr < 0.0 || self.min_lr > self.peak_lr {
            return fail("learning rates must satisfy 0 <= min_lr <= peak_lr, peak_lr > 0");
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return fail("betas must lie in [0, 1)");
        }
        if matches!(self.max_grad_norm, Some(n) if !(n > 0.0)) {
            return fail("max_grad_norm must be positive");
        }
        Ok(())
    }

    /// Load from JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: Self = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    fn adamw(&self, weight_decay: f64) -> ParamsAdamW {
        ParamsAdamW {
            lr: self.peak_lr,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay,
        }
    }
}

/// What one optimizer step did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepStats {
    /// Step index (0-based) that was just taken.
    pub step: usize,
    /// Learning rate used.
    pub lr: f64,
    /// Mean loss over supervised positions.
    pub loss: f32,
    /// Global gradient norm before clipping.
    pub grad_norm: f32,
    /// Supervised target positions in the batch.
    pub supervised: usize,
}

/// Summary of one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochStats {
    /// Epoch number, starting at 1.
    pub epoch: usize,
    /// Mean of per-step losses.
    pub mean_loss: f32,
    /// Optimizer steps taken.
    pub steps: usize,
    /// Checkpoint written at the end of the epoch.
    pub checkpoint: Option<PathBuf>,
}

/// Trains a [`Transformer`] on command → script pairs.
pub struct Trainer {
    config: ModelConfig,
    settings: TrainerConfig,
    /// Named trainable parameters, in [`ModelConfig::parameter_shapes`] order.
    params: Vec<(String, Var)>,
    /// Forward view sharing storage with `params`.
    model: Transformer,
    decay: AdamW,
    no_decay: AdamW,
    schedule: WarmupCosine,
    step: usize,
    epoch: usize,
    device: Device,
}

impl Trainer {
    /// Start from randomly initialized weights.
    pub fn new(config: ModelConfig, settings: TrainerConfig, device: &Device) -> Result<Self> {
        let weights = Weights::random(&config, settings.seed, device)?;
        Self::from_weights(config, weights, settings)
    }

    /// Continue from existing weights.
    pub fn from_weights(config: ModelConfig, weights: Weights, settings: TrainerConfig) -> Result<Self> {
        config.validate()?;
        settings.validate()?;
        weights.validate(&config)?;

        let device = weights.device().clone();
        let mut params = Vec::new();
        let mut shared = Weights::new(&device);
        let mut decay_vars = Vec::new();
        let mut no_decay_vars = Vec::new();

        for (name, _) in config.parameter_shapes() {
            let var = Var::from_tensor(&weights.get_tensor(&name)?)?;
            shared.insert(name.clone(), var.as_tensor().clone());
            if var.rank() >= 2 {
                decay_vars.push(var.clone());
            } else {
                no_decay_vars.push(var.clone());
            }
            params.push((name, var));
        }

        let model = Transformer::new(config.clone(), &shared)?;
        let decay = AdamW::new(decay_vars, settings.adamw(settings.weight_decay))?;
        let no_decay = AdamW::new(no_decay_vars, settings.adamw(0.0))?;

        let schedule = WarmupCosine::new(
            settings.peak_lr,
            settings.min_lr,
            settings.warmup_steps,
            settings.warmup_steps,
        );

        tracing::info!(
            params = config.param_count(),
            tensors = params.len(),
            "Initialized trainer"
        );

        Ok(Self {
            config,
            settings,
            params,
            model,
            decay,
            no_decay,
            schedule,
            step: 0,
            epoch: 0,
            device,
        })
    }

    /// Pick up from a checkpoint.
    ///
    /// Weights, step and epoch are restored; optimizer moments start fresh.
    pub fn resume(path: &Path, settings: TrainerConfig, device: &Device) -> Result<Self> {
        let ckpt = Checkpoint::load(path, device)?;
        let mut trainer = Self::from_weights(ckpt.config, ckpt.weights, settings)?;
        trainer.step = ckpt.step;
        trainer.epoch = ckpt.epoch;
        tracing::info!(
            path = %path.display(),
            step = trainer.step,
            epoch = trainer.epoch,
            "Resumed training"
        );
        Ok(trainer)
    }

    /// Model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Training settings.
    pub fn settings(&self) -> &TrainerConfig {
        &self.settings
    }

    /// Optimizer steps taken so far.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Epochs completed so far.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Current learning-rate schedule.
    pub fn schedule(&self) -> &WarmupCosine {
        &self.schedule
    }

    /// Set the horizon the cosine decay runs over.
    pub fn set_total_steps(&mut self, total_steps: usize) {
        self.schedule.total_steps = total_steps;
    }

    /// The live model. Its weights move with every step.
    pub fn model(&self) -> &Transformer {
        &self.model
    }

    /// One optimizer step on `batch`.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepStats> {
        let lr = self.schedule.lr(self.step);
        self.decay.set_learning_rate(lr);
        self.no_decay.set_learning_rate(lr);

        let logits = self.model.training_forward(&batch.inputs)?;
        let loss = masked_cross_entropy(&logits, &batch.targets, &batch.mask)?;
        let loss_value = loss.to_scalar::<f32>()?;
        if !loss_value.is_finite() {
            tracing::error!(step = self.step, loss = loss_value, "Loss diverged");
            return Err(RuneError::NonFiniteLoss { step: self.step });
        }
        if batch.supervised_positions() == 0 {
            tracing::warn!(step = self.step, "Batch has no supervised positions");
        }

        let mut grads = loss.backward()?;
        let grad_norm = self.clip_gradients(&mut grads)?;

        self.decay.step(&grads)?;
        self.no_decay.step(&grads)?;

        let stats = StepStats {
            step: self.step,
            lr,
            loss: loss_value,
            grad_norm,
            supervised: batch.supervised_positions(),
        };
        self.step += 1;

        tracing::debug!(
            step = stats.step,
            lr = stats.lr,
            loss = stats.loss,
            grad_norm = stats.grad_norm,
            "Train step"
        );
        Ok(stats)
    }

    /// Global L2 norm of all gradients, then rescale them if it exceeds the
    /// configured limit. Fails on the first non-finite gradient.
    fn clip_gradients(&self, grads: &mut GradStore) -> Result<f32> {
        let mut sum_sq = 0.0f64;
        for (name, var) in &self.params {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let sq = grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
                if !sq.is_finite() {
                    tracing::error!(step = self.step, param = %name, "Gradient diverged");
                    return Err(RuneError::NonFiniteGradient {
                        step: self.step,
                        name: name.clone(),
                    });
                }
                sum_sq += sq;
            }
        }
        let norm = sum_sq.sqrt();

        if let Some(max_norm) = self.settings.max_grad_norm {
            if norm > max_norm {
                let scale = max_norm / (norm + 1e-6);
                for (_, var) in &self.params {
                    if let Some(grad) = grads.remove(var.as_tensor()) {
                        grads.insert(var.as_tensor(), (grad * scale)?);
                    }
                }
            }
        }
        Ok(norm as f32)
    }

    /// Train for the configured number of epochs, continuing from the
    /// current epoch. Writes a checkpoint after each epoch when a
    /// checkpoint directory is set.
    pub fn fit(&mut self, examples: &[TrainingExample]) -> Result<Vec<EpochStats>> {
        if examples.is_empty() {
            return Err(RuneError::EmptyBatch("training set is empty".into()));
        }

        let batches_per_epoch = examples.len().div_ceil(self.settings.batch_size);
        self.set_total_steps(self.settings.epochs * batches_per_epoch);

        tracing::info!(
            examples = examples.len(),
            epochs = self.settings.epochs,
            start_epoch = self.epoch,
            total_steps = self.schedule.total_steps,
            "Starting training"
        );

        let mut history = Vec::new();
        while self.epoch < self.settings.epochs {
            history.push(self.train_epoch(examples)?);
        }
        Ok(history)
    }

    /// One shuffled pass over `examples`.
    ///
    /// The order depends only on the seed and the epoch number, so a resumed
    /// run sees the same order it would have seen uninterrupted.
    pub fn train_epoch(&mut self, examples: &[TrainingExample]) -> Result<EpochStats> {
        if examples.is_empty() {
            return Err(RuneError::EmptyBatch("training set is empty".into()));
        }

        let start = Instant::now();
        let mut order: Vec<usize> = (0..examples.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.settings.seed.wrapping_add(self.epoch as u64));
        order.shuffle(&mut rng);

        let mut total_loss = 0.0f32;
        let mut steps = 0;
        for chunk in order.chunks(self.settings.batch_size) {
            let rows: Vec<&TrainingExample> = chunk.iter().map(|&i| &examples[i]).collect();
            let batch = Batch::from_examples(
                &rows,
                self.config.vocab_size,
                self.config.max_seq_len,
                &self.device,
            )?;
            total_loss += self.train_step(&batch)?.loss;
            steps += 1;
        }

        self.epoch += 1;
        let mean_loss = total_loss / steps as f32;

        let checkpoint = match &self.settings.checkpoint_dir {
            Some(dir) => {
                let path = dir.join(format!("epoch-{:03}.safetensors", self.epoch));
                self.save_checkpoint(&path)?;
                Some(path)
            }
            None => None,
        };

        tracing::info!(
            epoch = self.epoch,
            mean_loss,
            steps,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Epoch complete"
        );

        Ok(EpochStats {
            epoch: self.epoch,
            mean_loss,
            steps,
            checkpoint,
        })
    }

    /// Mean loss over every supervised position in `examples`, without
    /// updating anything.
    pub fn evaluate(&self, examples: &[TrainingExample]) -> Result<f32> {
        if examples.is_empty() {
            return Err(RuneError::EmptyBatch("evaluation set is empty".into()));
        }

        let mut weighted = 0.0f64;
        let mut positions = 0usize;
        let refs: Vec<&TrainingExample> = examples.iter().collect();
        for rows in refs.chunks(self.settings.batch_size) {
            let batch = Batch::from_examples(
                rows,
                self.config.vocab_size,
                self.config.max_seq_len,
                &self.device,
            )?;
            let logits = self.model.training_forward(&batch.inputs)?;
            let loss = masked_cross_entropy(&logits, &batch.targets, &batch.mask)?;
            weighted += loss.to_scalar::<f32>()? as f64 * batch.supervised_positions() as f64;
            positions += batch.supervised_positions();
        }

        Ok(if positions == 0 {
            0.0
        } else {
            (weighted / positions as f64) as f32
        })
    }

    /// Copy of the current parameters.
    pub fn weights(&self) -> Result<Weights> {
        let mut weights = Weights::new(&self.device);
        for (name, var) in &self.params {
            weights.insert(name.clone(), var.as_tensor().copy()?);
        }
        Ok(weights)
    }

    /// A frozen model with the current weights, detached from training.
    pub fn snapshot(&self) -> Result<Transformer> {
        Transformer::new(self.config.clone(), &self.weights()?)
    }

    /// Current weights with their config and progress counters.
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        Checkpoint::new(self.config.clone(), self.weights()?, self.step, self.epoch)
    }

    /// Write the current state to `path`.
    pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
        self.checkpoint()?.save(path)
    }
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("config", &self.config)
            .field("settings", &self.settings)
            .field("step", &self.step)
            .field("epoch", &self.epoch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::max_abs_diff;

    fn examples() -> Vec<TrainingExample> {
        vec![
            TrainingExample::new(vec![10, 11], vec![20, 21, 22]),
            TrainingExample::new(vec![12], vec![23]),
            TrainingExample::new(vec![13, 14, 15], vec![24, 25]),
        ]
    }

    fn settings() -> TrainerConfig {
        TrainerConfig {
            epochs: 2,
            batch_size: 2,
            peak_lr: 1e-2,
            min_lr: 1e-3,
            warmup_steps: 1,
            ..Default::default()
        }
    }

    #[test]
    fn step_updates_weights_and_counters() {
        let mut trainer = Trainer::new(ModelConfig::tiny(32), settings(), &Device::Cpu).unwrap();
        trainer.set_total_steps(10);
        let before = trainer.weights().unwrap();

        let owned = examples();
        let rows: Vec<&TrainingExample> = owned.iter().collect();
        let batch = Batch::from_examples(&rows, 32, 64, &Device::Cpu).unwrap();

        // Warmup step 0 runs at lr 0.
        let first = trainer.train_step(&batch).unwrap();
        assert_eq!(first.lr, 0.0);
        let second = trainer.train_step(&batch).unwrap();
        assert!(second.lr > 0.0);
        assert!(second.grad_norm > 0.0);
        assert_eq!(trainer.step(), 2);

        let after = trainer.weights().unwrap();
        let delta = max_abs_diff(
            &before.get_tensor("layers.0.attn.q_proj").unwrap(),
            &after.get_tensor("layers.0.attn.q_proj").unwrap(),
        )
        .unwrap();
        assert!(delta > 0.0);
    }

    #[test]
    fn loss_decreases_on_repeated_batch() {
        let mut trainer = Trainer::new(
            ModelConfig::tiny(32),
            TrainerConfig {
                warmup_steps: 0,
                ..settings()
            },
            &Device::Cpu,
        )
        .unwrap();
        trainer.set_total_steps(30);

        let owned = examples();
        let rows: Vec<&TrainingExample> = owned.iter().collect();
        let batch = Batch::from_examples(&rows, 32, 64, &Device::Cpu).unwrap();

        let first = trainer.train_step(&batch).unwrap().loss;
        let mut last = first;
        for _ in 0..29 {
            last = trainer.train_step(&batch).unwrap().loss;
        }
        assert!(last < first * 0.8, "loss {first} -> {last}");
    }

    #[test]
    fn snapshot_is_frozen() {
        let mut trainer = Trainer::new(ModelConfig::tiny(32), settings(), &Device::Cpu).unwrap();
        let snapshot = trainer.snapshot().unwrap();
        let probe = [0u32, 10, 11, 1];
        let before = snapshot.forward_all(&probe).unwrap();

        trainer.fit(&examples()).unwrap();

        let after = snapshot.forward_all(&probe).unwrap();
        assert_eq!(max_abs_diff(&before, &after).unwrap(), 0.0);

        let live = trainer.model().forward_all(&probe).unwrap();
        assert!(max_abs_diff(&before, &live).unwrap() > 0.0);
    }

    #[test]
    fn fit_runs_all_epochs() {
        let mut trainer = Trainer::new(ModelConfig::tiny(32), settings(), &Device::Cpu).unwrap();
        let history = trainer.fit(&examples()).unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(history[1].epoch, 2);
        // Three examples in batches of two.
        assert!(history.iter().all(|e| e.steps == 2));
        assert_eq!(trainer.step(), 4);
        assert!(history.iter().all(|e| e.checkpoint.is_none()));

        // Already complete: nothing more to do.
        assert!(trainer.fit(&examples()).unwrap().is_empty());
    }

    #[test]
    fn evaluate_does_not_train() {
        let trainer = Trainer::new(ModelConfig::tiny(32), settings(), &Device::Cpu).unwrap();
        let a = trainer.evaluate(&examples()).unwrap();
        let b = trainer.evaluate(&examples()).unwrap();
        assert_eq!(a, b);
        assert!(a > 0.0);
        assert_eq!(trainer.step(), 0);
    }

    #[test]
    fn checkpoints_every_epoch_and_resumes() {
        let dir = std::env::temp_dir().join(format!("rune_trainer_{}", std::process::id()));
        let config = TrainerConfig {
            checkpoint_dir: Some(dir.clone()),
            ..settings()
        };

        let mut trainer = Trainer::new(ModelConfig::tiny(32), config.clone(), &Device::Cpu).unwrap();
        let history = trainer.fit(&examples()).unwrap();
        let last = history[1].checkpoint.clone().unwrap();
        assert!(history[0].checkpoint.as_ref().unwrap().exists());
        assert!(last.exists());

        let resumed = Trainer::resume(&last, config, &Device::Cpu).unwrap();
        assert_eq!(resumed.step(), 4);
        assert_eq!(resumed.epoch(), 2);

        let probe = [0u32, 12, 1];
        let a = trainer.model().forward_all(&probe).unwrap();
        let b = resumed.model().forward_all(&probe).unwrap();
        let _ = std::fs::remove_dir_all(&dir);
        assert_eq!(max_abs_diff(&a, &b).unwrap(), 0.0);
    }

    #[test]
    fn invalid_settings_rejected() {
        let bad = TrainerConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            Trainer::new(ModelConfig::tiny(32), bad, &Device::Cpu),
            Err(RuneError::InvalidConfig(_))
        ));
    }

    #[test]
    fn empty_training_set_rejected() {
        let mut trainer = Trainer::new(ModelConfig::tiny(32), settings(), &Device::Cpu).unwrap();
        assert!(matches!(trainer.fit(&[]), Err(RuneError::EmptyBatch(_))));
    }
}
