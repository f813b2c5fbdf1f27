//! Interactive script generation.
//!
//! Loads a model directory (config.json, weights.safetensors,
//! tokenizer.json) and turns each line typed on stdin into a script.
//!
//! Run with:
//! ```bash
//! cargo run -p rune --example generate -- /path/to/model [--greedy]
//! ```

use anyhow::Result;
use rune::prelude::*;
use std::io::{self, Write};
use std::time::Instant;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let model_dir = args.get(1).map(String::as_str).unwrap_or("models/rune-small");
    let greedy = args.iter().any(|a| a == "--greedy");

    // Interactive use samples lightly; --greedy matches the server.
    let sampling = if greedy {
        Sampling::Greedy
    } else {
        Sampling::top_p(0.9, 0.7)
    };

    let load_start = Instant::now();
    let engine = Engine::builder()
        .model_dir(model_dir)
        .sampling(sampling)
        .seed(std::process::id() as u64)
        .build()?;
    println!(
        "Loaded {} ({} parameters) in {:.2}s",
        model_dir,
        engine.model().config().param_count(),
        load_start.elapsed().as_secs_f64()
    );
    println!("Enter commands (empty line to quit):\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut command = String::new();
        if stdin.read_line(&mut command)? == 0 {
            break;
        }
        let command = command.trim();
        if command.is_empty() {
            break;
        }

        let start = Instant::now();
        let result = engine.generate(command).execute()?;
        let elapsed = start.elapsed();

        if result.is_cloud {
            println!("[cloud] {}", PASS_TO_CLOUD);
        } else {
            println!("{}", result.script);
        }
        println!(
            "  ({} tokens, {:?}, {:.1} ms)\n",
            result.tokens.len(),
            result.finish_reason,
            elapsed.as_secs_f64() * 1000.0
        );
    }

    Ok(())
}
