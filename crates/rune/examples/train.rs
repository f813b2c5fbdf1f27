//! Train a model from JSON-lines command → script pairs.
//!
//! The model directory must already hold config.json and tokenizer.json;
//! training writes weights.safetensors next to them plus one checkpoint
//! per epoch under `checkpoints/`.
//!
//! Run with:
//! ```bash
//! cargo run --release -p rune --example train -- /path/to/model data.jsonl [trainer.json]
//! ```

use anyhow::{bail, Context, Result};
use candle_core::Device;
use rune::prelude::*;
use rune::training::TextPair;
use rune::{CONFIG_FILE, WEIGHTS_FILE};
use std::path::Path;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        bail!("usage: train <model_dir> <data.jsonl> [trainer.json]");
    }
    let model_dir = Path::new(&args[1]);
    let data_path = Path::new(&args[2]);

    let config = ModelConfig::from_file(&model_dir.join(CONFIG_FILE))?;
    let tokenizer = Tokenizer::from_dir(model_dir)?;
    let mut settings = match args.get(3) {
        Some(path) => TrainerConfig::from_file(Path::new(path))?,
        None => TrainerConfig::default(),
    };
    settings.checkpoint_dir.get_or_insert_with(|| model_dir.join("checkpoints"));

    let pairs = TextPair::read_jsonl(data_path)
        .with_context(|| format!("reading {}", data_path.display()))?;
    let examples = pairs
        .iter()
        .map(|pair| TrainingExample::from_pair(&tokenizer, pair))
        .collect::<rune::Result<Vec<_>>>()?;
    let cloud = pairs.iter().filter(|p| is_pass_to_cloud(&p.output)).count();
    println!(
        "{} examples ({} PASS_TO_CLOUD), {} parameters",
        examples.len(),
        cloud,
        config.param_count()
    );

    let mut trainer = Trainer::new(config, settings, &Device::Cpu)?;
    for stats in trainer.fit(&examples)? {
        println!(
            "epoch {:>3}  loss {:.4}  steps {}",
            stats.epoch, stats.mean_loss, stats.steps
        );
    }

    let weights_path = model_dir.join(WEIGHTS_FILE);
    trainer.save_checkpoint(&weights_path)?;
    println!("Wrote {}", weights_path.display());
    Ok(())
}
