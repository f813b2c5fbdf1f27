//! Training: masked next-token loss, AdamW, warmup + cosine schedule.
//!
//! Only the script span of each sequence is supervised: the loss covers
//! the tokens after OUTPUT through END, never the command or padding.

mod batch;
mod loss;
mod schedule;
mod trainer;

pub use batch::{Batch, TextPair, TrainingExample};
pub use loss::masked_cross_entropy;
pub use schedule::WarmupCosine;
pub use trainer::{EpochStats, StepStats, Trainer, TrainerConfig};
