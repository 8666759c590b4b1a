//! Run reporting: console output and summary statistics.
//!
//! Reporters receive entity completions as they stream in and a summary
//! when the run finishes. They are orthogonal to the persisted result
//! files, which are owned by [`crate::output`]; a reporter is for humans
//! watching the run.

use std::time::Duration;

use async_trait::async_trait;

use crate::exec::{EntityResult, RunFailure};
use crate::registry::EntityKind;

/// Aggregated statistics of one run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Tests with a result record, skips included.
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Tests that started but never ended.
    pub incomplete: usize,
    pub duration: Duration,
}

impl RunSummary {
    /// Builds a summary from finalized results. Fixture records are
    /// ignored; they bracket tests rather than count as them.
    pub fn from_results(results: &[EntityResult], duration: Duration) -> Self {
        let mut summary = RunSummary {
            duration,
            ..Default::default()
        };
        for result in results {
            if result.kind != EntityKind::Test {
                continue;
            }
            summary.total += 1;
            if result.skip_reason.is_some() && result.start.is_none() {
                summary.skipped += 1;
            } else if result.start.is_some() && result.end.is_none() {
                summary.incomplete += 1;
            } else if result.failed() {
                summary.failed += 1;
            } else {
                summary.passed += 1;
            }
        }
        summary
    }

    pub fn success(&self) -> bool {
        self.failed == 0 && self.incomplete == 0
    }

    /// Conventional process exit code: 0 clean, 1 failures or global error.
    pub fn exit_code(&self, failure: Option<&RunFailure>) -> i32 {
        if failure.is_some() || !self.success() { 1 } else { 0 }
    }
}

/// Receives run progress for human-facing output.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn on_run_start(&self, total_tests: usize);
    async fn on_entity_finished(&self, result: &EntityResult);
    async fn on_run_complete(&self, summary: &RunSummary, failure: Option<&RunFailure>);
}

/// Reporter that discards all events, for tests and headless embedding.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_run_start(&self, _total_tests: usize) {}
    async fn on_entity_finished(&self, _result: &EntityResult) {}
    async fn on_run_complete(&self, _summary: &RunSummary, _failure: Option<&RunFailure>) {}
}

/// Terminal reporter with a progress bar and per-test status lines.
pub struct ConsoleReporter {
    progress: std::sync::Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    /// With `verbose` false only failures and the summary are printed.
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: std::sync::Mutex::new(None),
            verbose,
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_run_start(&self, total_tests: usize) {
        println!("Running {total_tests} tests");
        let pb = indicatif::ProgressBar::new(total_tests as u64);
        pb.set_style(
            indicatif::ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                )
                .unwrap()
                .progress_chars("#>-"),
        );
        *self.progress.lock().unwrap() = Some(pb);
    }

    async fn on_entity_finished(&self, result: &EntityResult) {
        if result.kind != EntityKind::Test {
            return;
        }
        if let Some(pb) = self.progress.lock().unwrap().as_ref() {
            pb.inc(1);
            let status = if result.start.is_some() && result.end.is_none() {
                console::style("HANG").red().bold()
            } else if result.failed() {
                console::style("FAIL").red()
            } else if result.skip_reason.is_some() {
                console::style("SKIP").yellow()
            } else {
                console::style("PASS").green()
            };
            let is_pass = !result.failed() && result.end.is_some();
            if self.verbose || !is_pass {
                pb.println(format!("{} {}", status, result.name));
            }
        }
    }

    async fn on_run_complete(&self, summary: &RunSummary, failure: Option<&RunFailure>) {
        if let Some(pb) = self.progress.lock().unwrap().take() {
            pb.finish_and_clear();
        }

        println!();
        println!("Test results:");
        println!("  Total:      {}", summary.total);
        println!("  Passed:     {}", console::style(summary.passed).green());
        println!("  Failed:     {}", console::style(summary.failed).red());
        println!("  Skipped:    {}", console::style(summary.skipped).yellow());
        if summary.incomplete > 0 {
            println!(
                "  Incomplete: {}",
                console::style(summary.incomplete).red().bold()
            );
        }
        println!("  Duration:   {:?}", summary.duration);

        if let Some(failure) = failure {
            println!();
            println!(
                "{} {}",
                console::style("Run failed:").red().bold(),
                failure
            );
        } else if summary.success() {
            println!();
            println!("{}", console::style("All tests passed.").green().bold());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorReport;
    use chrono::Utc;

    fn base(name: &str) -> EntityResult {
        EntityResult {
            name: name.to_string(),
            kind: EntityKind::Test,
            start: Some(Utc::now()),
            end: Some(Utc::now()),
            errors: Vec::new(),
            skip_reason: None,
            out_dir: None,
        }
    }

    #[test]
    fn summary_buckets_results() {
        let results = vec![
            base("pass"),
            EntityResult {
                errors: vec![ErrorReport::new("boom")],
                ..base("fail")
            },
            EntityResult {
                start: None,
                end: None,
                skip_reason: Some("missing feature".into()),
                ..base("skip")
            },
            EntityResult {
                end: None,
                errors: vec![ErrorReport::new("incomplete")],
                ..base("hang")
            },
            EntityResult {
                kind: EntityKind::Fixture,
                ..base("fixture")
            },
        ];
        let summary = RunSummary::from_results(&results, Duration::from_secs(3));
        assert_eq!(summary.total, 4, "fixtures must not count");
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.incomplete, 1);
        assert!(!summary.success());
    }

    #[test]
    fn exit_code_reflects_failures() {
        let clean = RunSummary {
            total: 2,
            passed: 2,
            ..Default::default()
        };
        assert_eq!(clean.exit_code(None), 0);
        assert_eq!(clean.exit_code(Some(&RunFailure::Cancelled)), 1);

        let failing = RunSummary {
            total: 2,
            passed: 1,
            failed: 1,
            ..Default::default()
        };
        assert_eq!(failing.exit_code(None), 1);
    }
}
