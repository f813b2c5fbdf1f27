//! Next-token selection strategies.
//!
//! All strategies run on host-side f32 logits. Ties under greedy selection
//! go to the lowest token id, so greedy decoding is fully deterministic.

use crate::error::{Result, RuneError};
use candle_core::{DType, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// How the next token is chosen from a logits vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Sampling {
    /// Always take the highest-scoring token.
    Greedy,
    /// Sample from `softmax(logits / temperature)`.
    Temperature {
        /// Values below 1 sharpen the distribution; 0 falls back to greedy.
        temperature: f64,
    },
    /// Sample among the `k` highest-scoring tokens only.
    TopK {
        /// Number of candidates kept.
        k: usize,
        /// Temperature applied before truncation.
        temperature: f64,
    },
    /// Sample from the smallest set of tokens whose mass reaches `p`.
    TopP {
        /// Cumulative probability cut-off in (0, 1].
        p: f64,
        /// Temperature applied before truncation.
        temperature: f64,
    },
}

impl Default for Sampling {
    fn default() -> Self {
        Self::Greedy
    }
}

impl Sampling {
    /// Plain temperature sampling.
    pub fn temperature(temperature: f64) -> Self {
        Self::Temperature { temperature }
    }

    /// Top-k sampling at temperature 1.
    pub fn top_k(k: usize) -> Self {
        Self::TopK { k, temperature: 1.0 }
    }

    /// Nucleus sampling at the given temperature.
    pub fn top_p(p: f64, temperature: f64) -> Self {
        Self::TopP { p, temperature }
    }

    /// Reject parameters no distribution can be built from: `k == 0`,
    /// `p` outside (0, 1], or a NaN temperature.
    pub fn validate(&self) -> Result<()> {
        let temperature = match *self {
            Self::Greedy => return Ok(()),
            Self::Temperature { temperature } => temperature,
            Self::TopK { k, temperature } => {
                if k == 0 {
                    return Err(RuneError::Sampling("top-k needs k >= 1".into()));
                }
                temperature
            }
            Self::TopP { p, temperature } => {
                if !(p > 0.0 && p <= 1.0) {
                    return Err(RuneError::Sampling(format!("top-p needs 0 < p <= 1, got {p}")));
                }
                temperature
            }
        };
        if temperature.is_nan() {
            return Err(RuneError::Sampling("temperature is NaN".into()));
        }
        Ok(())
    }
}

/// A [`Sampling`] strategy paired with its own seeded random source.
#[derive(Debug, Clone)]
pub struct Sampler {
    strategy: Sampling,
    rng: StdRng,
}

impl Sampler {
    /// Create a sampler; identical seeds give identical draws.
    pub fn new(strategy: Sampling, seed: u64) -> Self {
        Self {
            strategy,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Choose a token from `logits` [vocab_size].
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        let logits: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        self.sample_slice(&logits)
    }

    /// Choose a token from host-side logits.
    pub fn sample_slice(&mut self, logits: &[f32]) -> Result<u32> {
        self.strategy.validate()?;
        check_logits(logits)?;

        match self.strategy {
            Sampling::Greedy => argmax(logits),
            Sampling::Temperature { temperature } => {
                if temperature <= 0.0 {
                    return argmax(logits);
                }
                let candidates: Vec<usize> = (0..logits.len()).collect();
                self.draw(logits, &candidates, temperature)
            }
            Sampling::TopK { k, temperature } => {
                if temperature <= 0.0 || k == 1 {
                    return argmax(logits);
                }
                let mut ranked = ranked(logits);
                ranked.truncate(k);
                self.draw(logits, &ranked, temperature)
            }
            Sampling::TopP { p, temperature } => {
                if temperature <= 0.0 {
                    return argmax(logits);
                }
                let ranked = ranked(logits);
                let probs = softmax(logits, &ranked, temperature);

                // Keep the shortest prefix whose mass reaches p; always at
                // least the top token.
                let mut cumulative = 0.0;
                let mut keep = 0;
                for prob in &probs {
                    cumulative += prob;
                    keep += 1;
                    if cumulative >= p {
                        break;
                    }
                }
                self.draw(logits, &ranked[..keep], temperature)
            }
        }
    }

    /// Draw one of `candidates` with probability `softmax(logits / t)`.
    fn draw(&mut self, logits: &[f32], candidates: &[usize], temperature: f64) -> Result<u32> {
        let probs = softmax(logits, candidates, temperature);
        let dist = WeightedIndex::new(&probs)
            .map_err(|e| RuneError::Sampling(format!("invalid distribution: {e}")))?;
        Ok(candidates[dist.sample(&mut self.rng)] as u32)
    }
}

/// Index of the largest logit; lowest index wins ties.
///
/// Fails on empty logits or any NaN / infinite value, which means the
/// forward pass diverged.
pub fn argmax(logits: &[f32]) -> Result<u32> {
    check_logits(logits)?;
    let mut best = 0;
    for (i, &v) in logits.iter().enumerate().skip(1) {
        if v > logits[best] {
            best = i;
        }
    }
    Ok(best as u32)
}

fn check_logits(logits: &[f32]) -> Result<()> {
    if logits.is_empty() {
        return Err(RuneError::Sampling("empty logits".into()));
    }
    if let Some(i) = logits.iter().position(|v| !v.is_finite()) {
        return Err(RuneError::Sampling(format!(
            "non-finite logit {} at token {i}",
            logits[i]
        )));
    }
    Ok(())
}

/// Token ids sorted by descending logit, ties by ascending id.
fn ranked(logits: &[f32]) -> Vec<usize> {
    let mut ids: Vec<usize> = (0..logits.len()).collect();
    ids.sort_by(|&a, &b| logits[b].total_cmp(&logits[a]).then(a.cmp(&b)));
    ids
}

/// Softmax of `logits[candidates] / temperature`, computed in f64.
fn softmax(logits: &[f32], candidates: &[usize], temperature: f64) -> Vec<f64> {
    let scaled: Vec<f64> = candidates
        .iter()
        .map(|&i| logits[i] as f64 / temperature)
        .collect();
    let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scaled.iter().map(|v| (v - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
