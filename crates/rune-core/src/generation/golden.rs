//! Golden command → script regression cases.
//!
//! A [`GoldenCase`] pins the exact token output greedy decoding must produce
//! for a command. The harness runs every case through a [`Generator`] and
//! reports where outputs diverge, which catches numerical drift across code
//! changes and platforms.
//!
//! ```rust,ignore
//! let mut harness = GoldenTestHarness::new();
//! harness.add_case(GoldenCase::new("open_safari", command, expected).with_tag("apps"));
//!
//! let summary = harness.run(&model);
//! assert!(summary.all_passed(), "{summary}");
//! ```

use super::{GenerationConfig, Generator};
use crate::model::Transformer;
use std::fmt;
use std::time::Instant;

/// A single golden case.
#[derive(Debug, Clone, Default)]
pub struct GoldenCase {
    /// Case name for identification.
    pub name: String,
    /// Command tokens, without INPUT / OUTPUT framing.
    pub command: Vec<u32>,
    /// Expected output tokens, without the END token.
    pub expected: Vec<u32>,
    /// Optional description.
    pub description: Option<String>,
    /// Tags for filtering.
    pub tags: Vec<String>,
}

impl GoldenCase {
    /// Create a case.
    pub fn new(name: impl Into<String>, command: Vec<u32>, expected: Vec<u32>) -> Self {
        Self {
            name: name.into(),
            command,
            expected,
            ..Default::default()
        }
    }

    /// Add a tag to the case.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Set description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }
}

/// Outcome of a single case.
#[derive(Debug, Clone)]
pub struct GoldenResult {
    /// Case name.
    pub name: String,
    /// Whether output matched exactly.
    pub passed: bool,
    /// Expected tokens.
    pub expected: Vec<u32>,
    /// Tokens actually produced.
    pub actual: Vec<u32>,
    /// First index where the two differ.
    pub first_divergence: Option<usize>,
    /// Generation error, if the case could not run.
    pub error: Option<String>,
    /// Execution time in milliseconds.
    pub time_ms: f64,
}

impl GoldenResult {
    /// Compare produced tokens with the expectation.
    pub fn compare(name: String, expected: Vec<u32>, actual: Vec<u32>, time_ms: f64) -> Self {
        let first_divergence = (0..expected.len().max(actual.len()))
            .find(|&i| expected.get(i) != actual.get(i));
        Self {
            name,
            passed: first_divergence.is_none(),
            expected,
            actual,
            first_divergence,
            error: None,
            time_ms,
        }
    }

    /// A case that failed to run at all.
    pub fn error(name: String, error: String) -> Self {
        Self {
            name,
            passed: false,
            expected: Vec::new(),
            actual: Vec::new(),
            first_divergence: None,
            error: Some(error),
            time_ms: 0.0,
        }
    }
}

impl fmt::Display for GoldenResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.passed { "PASS" } else { "FAIL" };
        write!(f, "[{}] {} ({:.1}ms)", status, self.name, self.time_ms)?;

        if let Some(ref err) = self.error {
            write!(f, "\n  Error: {}", err)?;
        }
        if let Some(idx) = self.first_divergence {
            let show = |t: Option<&u32>| t.map_or_else(|| "EOF".to_string(), |t| t.to_string());
            write!(
                f,
                "\n  Divergence at index {}: expected {}, got {}",
                idx,
                show(self.expected.get(idx)),
                show(self.actual.get(idx))
            )?;
        }
        Ok(())
    }
}

/// Summary over a harness run.
#[derive(Debug, Clone, Default)]
pub struct GoldenSummary {
    /// Results in case order.
    pub results: Vec<GoldenResult>,
    /// Total execution time in milliseconds.
    pub total_time_ms: f64,
}

impl GoldenSummary {
    /// Number of cases run.
    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// Number of passing cases.
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    /// Check if all cases passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    /// Look up a result by case name.
    pub fn get(&self, name: &str) -> Option<&GoldenResult> {
        self.results.iter().find(|r| r.name == name)
    }
}

impl fmt::Display for GoldenSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Golden cases: {}/{} passed ({:.1}ms)",
            self.passed(),
            self.total(),
            self.total_time_ms
        )?;
        for result in self.results.iter().filter(|r| !r.passed) {
            writeln!(f, "  - {}", result)?;
        }
        Ok(())
    }
}

/// Collection of golden cases.
#[derive(Debug, Clone, Default)]
pub struct GoldenTestHarness {
    cases: Vec<GoldenCase>,
}

impl GoldenTestHarness {
    /// Create an empty harness.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a case.
    pub fn add_case(&mut self, case: GoldenCase) {
        self.cases.push(case);
    }

    /// Add multiple cases.
    pub fn add_cases(&mut self, cases: impl IntoIterator<Item = GoldenCase>) {
        self.cases.extend(cases);
    }

    /// All cases.
    pub fn cases(&self) -> &[GoldenCase] {
        &self.cases
    }

    /// Cases carrying `tag`.
    pub fn filter_by_tag(&self, tag: &str) -> Vec<&GoldenCase> {
        self.cases
            .iter()
            .filter(|c| c.tags.iter().any(|t| t == tag))
            .collect()
    }

    /// Run every case through greedy decoding on `model`.
    pub fn run(&self, model: &Transformer) -> GoldenSummary {
        self.run_with(|command| {
            Generator::new(model, command, GenerationConfig::greedy())
                .and_then(|gen| gen.run())
                .map(|out| out.tokens)
                .map_err(|e| e.to_string())
        })
    }

    /// Run every case through a custom command → tokens function.
    pub fn run_with<F>(&self, mut generate: F) -> GoldenSummary
    where
        F: FnMut(&[u32]) -> Result<Vec<u32>, String>,
    {
        let mut results = Vec::with_capacity(self.cases.len());

        for case in &self.cases {
            let start = Instant::now();
            let result = match generate(&case.command) {
                Ok(actual) => GoldenResult::compare(
                    case.name.clone(),
                    case.expected.clone(),
                    actual,
                    start.elapsed().as_secs_f64() * 1000.0,
                ),
                Err(err) => GoldenResult::error(case.name.clone(), err),
            };

            if !result.passed {
                tracing::warn!(case = %case.name, "Golden case failed");
            }
            results.push(result);
        }

        let total_time_ms = results.iter().map(|r| r.time_ms).sum();
        GoldenSummary {
            results,
            total_time_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness() -> GoldenTestHarness {
        let mut harness = GoldenTestHarness::new();
        harness.add_cases([
            GoldenCase::new("echo", vec![5, 6], vec![5, 6]).with_tag("basic"),
            GoldenCase::new("empty", vec![7], vec![]).with_description("no output"),
        ]);
        harness
    }

    #[test]
    fn case_builder() {
        let case = GoldenCase::new("t", vec![1], vec![2])
            .with_tag("a")
            .with_description("d");
        assert_eq!(case.tags, vec!["a".to_string()]);
        assert_eq!(case.description.as_deref(), Some("d"));
    }

    #[test]
    fn compare_finds_divergence() {
        let result = GoldenResult::compare("t".into(), vec![1, 2, 3], vec![1, 9, 3], 0.0);
        assert!(!result.passed);
        assert_eq!(result.first_divergence, Some(1));

        let shorter = GoldenResult::compare("t".into(), vec![1, 2], vec![1], 0.0);
        assert_eq!(shorter.first_divergence, Some(1));
        assert!(shorter.to_string().contains("got EOF"));

        assert!(GoldenResult::compare("t".into(), vec![4], vec![4], 0.0).passed);
    }

    #[test]
    fn run_with_echo_generator() {
        let summary = harness().run_with(|command| {
            if command == [7u32] {
                Ok(vec![])
            } else {
                Ok(command.to_vec())
            }
        });
        assert!(summary.all_passed(), "{summary}");
        assert_eq!(summary.total(), 2);
    }

    #[test]
    fn run_with_reports_errors() {
        let summary = harness().run_with(|_| Err("boom".to_string()));
        assert_eq!(summary.passed(), 0);
        assert_eq!(summary.get("echo").and_then(|r| r.error.clone()).as_deref(), Some("boom"));
    }

    #[test]
    fn filter_by_tag() {
        let harness = harness();
        let basic = harness.filter_by_tag("basic");
        assert_eq!(basic.len(), 1);
        assert_eq!(basic[0].name, "echo");
    }
}
