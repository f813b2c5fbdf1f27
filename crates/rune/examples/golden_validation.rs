//! Golden validation of a trained model against known command → script pairs.
//!
//! Every pair in the JSON-lines file becomes a golden case; the model must
//! reproduce the expected script token for token under greedy decoding.
//!
//! Run with:
//! ```bash
//! cargo run -p rune --example golden_validation -- /path/to/model golden.jsonl
//! ```

use rune::generation::{GoldenCase, GoldenTestHarness};
use rune::prelude::*;
use rune::training::TextPair;
use std::path::Path;
use std::time::Instant;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: golden_validation <model_dir> <golden.jsonl>");
        std::process::exit(1);
    }

    let load_start = Instant::now();
    let engine = Engine::builder().model_dir(&args[1]).build()?;
    println!("Loaded model in {:.2}s", load_start.elapsed().as_secs_f64());

    let tokenizer = engine.tokenizer();
    let pairs = TextPair::read_jsonl(Path::new(&args[2]))?;

    let mut harness = GoldenTestHarness::new();
    for (i, pair) in pairs.iter().enumerate() {
        let tag = if is_pass_to_cloud(&pair.output) { "cloud" } else { "local" };
        harness.add_case(
            GoldenCase::new(
                format!("case-{i:04}"),
                tokenizer.encode(&pair.input)?,
                tokenizer.encode(&pair.output)?,
            )
            .with_tag(tag)
            .with_description(pair.input.clone()),
        );
    }
    println!(
        "{} cases ({} cloud)\n",
        harness.cases().len(),
        harness.filter_by_tag("cloud").len()
    );

    let summary = harness.run(engine.model());
    println!("{}", summary);

    if !summary.all_passed() {
        println!("\n--- Failures ---\n");
        for (result, pair) in summary.results.iter().zip(&pairs) {
            if result.passed {
                continue;
            }
            println!("{}: {:?}", result.name, pair.input);
            println!("  expected: {:?}", pair.output);
            println!("  actual:   {:?}", tokenizer.decode(&result.actual)?.trim());
            println!();
        }
        eprintln!(
            "{} of {} cases failed",
            summary.total() - summary.passed(),
            summary.total()
        );
        std::process::exit(1);
    }

    println!("\nAll golden cases passed!");
    Ok(())
}
