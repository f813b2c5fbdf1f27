//! Learning-rate schedule: linear warmup, then cosine decay.
//!
//! ```text
//! step < warmup:  lr = peak * step / warmup
//! otherwise:      lr = min + 0.5 * (peak - min) * (1 + cos(π * progress))
//! ```
//!
//! where `progress` runs from 0 at the end of warmup to 1 at `total_steps`
//! and is clamped there, so training past the planned horizon stays at `min`.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Warmup + cosine decay schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WarmupCosine {
    /// Learning rate at the end of warmup.
    pub peak_lr: f64,
    /// Floor reached at `total_steps`.
    pub min_lr: f64,
    /// Length of the linear ramp.
    pub warmup_steps: usize,
    /// Planned number of optimizer steps.
    pub total_steps: usize,
}

impl WarmupCosine {
    /// Create a schedule.
    pub fn new(peak_lr: f64, min_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            peak_lr,
            min_lr,
            warmup_steps,
            total_steps,
        }
    }

    /// Learning rate for optimizer step `step` (0-based).
    pub fn lr(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.peak_lr * step as f64 / self.warmup_steps as f64;
        }

        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = ((step - self.warmup_steps) as f64 / decay_steps as f64).min(1.0);
        self.min_lr + 0.5 * (self.peak_lr - self.min_lr) * (1.0 + (PI * progress).cos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn warmup_ramps_linearly() {
        let s = WarmupCosine::new(1e-3, 1e-5, 10, 110);
        assert_eq!(s.lr(0), 0.0);
        assert!((s.lr(5) - 5e-4).abs() < 1e-12);
        assert!((s.lr(10) - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn cosine_reaches_floor() {
        let s = WarmupCosine::new(1e-3, 1e-5, 10, 110);
        // Halfway through decay: midpoint of peak and floor.
        assert!((s.lr(60) - (1e-3 + 1e-5) / 2.0).abs() < 1e-12);
        assert!((s.lr(110) - 1e-5).abs() < 1e-12);
        assert!((s.lr(10_000) - 1e-5).abs() < 1e-12);
    }

    #[test]
    fn no_warmup_starts_at_peak() {
        let s = WarmupCosine::new(2e-4, 0.0, 0, 50);
        assert!((s.lr(0) - 2e-4).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn lr_stays_in_bounds(
            warmup in 0usize..200,
            extra in 0usize..2000,
            step in 0usize..5000,
        ) {
            let s = WarmupCosine::new(3e-4, 1e-6, warmup, warmup + extra);
            let lr = s.lr(step);
            prop_assert!(lr >= 0.0);
            prop_assert!(lr <= 3e-4 + 1e-15);
            if step >= warmup {
                prop_assert!(lr >= 1e-6 - 1e-15);
            }
        }

        #[test]
        fn decay_is_monotone(
            warmup in 0usize..100,
            extra in 1usize..1000,
            a in 0usize..1200,
            b in 0usize..1200,
        ) {
            let s = WarmupCosine::new(1e-3, 1e-5, warmup, warmup + extra);
            let (lo, hi) = if a < b { (a, b) } else { (b, a) };
            if lo >= warmup {
                prop_assert!(s.lr(lo) >= s.lr(hi) - 1e-15);
            }
        }
    }
}
