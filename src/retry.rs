//! Retry coordination for interrupted runs.
//!
//! A single `RunTests` invocation is brittle: one crashing test can take the
//! whole runner down with it. The coordinator turns that into a resumable
//! run by re-invoking the runner with the tests that never started, after a
//! pre-retry hook (typically "wait for the DUT to come back") approves.
//!
//! Decision table applied when an attempt fails:
//!
//! | Condition                               | Action                  |
//! |-----------------------------------------|-------------------------|
//! | failure is terminal                     | stop, return failure    |
//! | runner reported no unstarted list       | stop, return failure    |
//! | unstarted list is empty                 | stop, return success    |
//! | continue-after-failure disabled         | stop, return failure    |
//! | no progress (unstarted == request)      | stop, return failure    |
//! | pre-retry hook declined                 | stop, return failure    |
//! | otherwise                               | retry with unstarted    |
//!
//! The no-progress guard is what prevents an infinite loop when a test
//! crashes the runner before any event is emitted for it.

use std::future::Future;

use tracing::{info, warn};

use crate::exec::{Attempt, EntityResult, RunFailure};

/// Runs `run` until the pattern list is exhausted or the table says stop.
///
/// `run` receives the pattern list for the attempt; `before_retry` runs
/// between attempts and returning `false` aborts the loop (the last failure
/// is returned). Results from every attempt are concatenated in order.
pub async fn run_with_retries<F, Fut, B, BFut>(
    patterns: Vec<String>,
    continue_after_failure: bool,
    mut run: F,
    mut before_retry: B,
) -> (Vec<EntityResult>, Option<RunFailure>)
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = Attempt>,
    B: FnMut() -> BFut,
    BFut: Future<Output = bool>,
{
    let mut all_results = Vec::new();
    let mut patterns = patterns;
    loop {
        let attempt = run(patterns.clone()).await;
        all_results.extend(attempt.results);

        let Some(failure) = attempt.failure else {
            return (all_results, None);
        };
        if failure.is_terminal() {
            return (all_results, Some(failure));
        }
        let Some(unstarted) = attempt.unstarted else {
            warn!("runner did not report remaining tests, not retrying");
            return (all_results, Some(failure));
        };
        if unstarted.is_empty() {
            // Everything was at least started; the failure only cut short
            // work that had already begun.
            info!("run failed but no tests remain, finishing");
            return (all_results, None);
        }
        if !continue_after_failure {
            return (all_results, Some(failure));
        }
        if unstarted == patterns {
            warn!("runner made no progress, not retrying");
            return (all_results, Some(failure));
        }
        if !before_retry().await {
            return (all_results, Some(failure));
        }
        info!(
            "retrying after {failure}: {} tests remaining",
            unstarted.len()
        );
        patterns = unstarted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EntityKind;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};

    fn ok_result(name: &str) -> EntityResult {
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

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// Builds a `run` closure replaying scripted attempts in order.
    fn scripted(
        attempts: Vec<Attempt>,
    ) -> (
        impl FnMut(Vec<String>) -> std::pin::Pin<Box<dyn Future<Output = Attempt>>>,
        Arc<Mutex<Vec<Vec<String>>>>,
    ) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let remaining = Arc::new(Mutex::new(attempts));
        let calls_out = Arc::clone(&calls);
        let run = move |patterns: Vec<String>| {
            let calls = Arc::clone(&calls);
            let remaining = Arc::clone(&remaining);
            Box::pin(async move {
                calls.lock().unwrap().push(patterns);
                remaining.lock().unwrap().remove(0)
            }) as std::pin::Pin<Box<dyn Future<Output = Attempt>>>
        };
        (run, calls_out)
    }

    #[tokio::test]
    async fn retries_with_unstarted_tests() {
        // S4: runner dies after t1, second attempt finishes t2 and t3.
        let (run, calls) = scripted(vec![
            Attempt {
                results: vec![ok_result("t1")],
                unstarted: Some(names(&["t2", "t3"])),
                failure: Some(RunFailure::RunnerExit("died".into())),
            },
            Attempt {
                results: vec![ok_result("t2"), ok_result("t3")],
                unstarted: Some(vec![]),
                failure: None,
            },
        ]);
        let (results, failure) =
            run_with_retries(names(&["t1", "t2", "t3"]), true, run, || async { true }).await;

        assert!(failure.is_none());
        assert_eq!(results.len(), 3);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], names(&["t2", "t3"]));
    }

    #[tokio::test]
    async fn no_progress_stops_the_loop() {
        let (run, calls) = scripted(vec![Attempt {
            results: vec![],
            unstarted: Some(names(&["t1", "t2"])),
            failure: Some(RunFailure::RunnerExit("crash on startup".into())),
        }]);
        let (_, failure) =
            run_with_retries(names(&["t1", "t2"]), true, run, || async { true }).await;

        assert!(matches!(failure, Some(RunFailure::RunnerExit(_))));
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn terminal_failure_never_retries() {
        let (run, calls) = scripted(vec![Attempt {
            results: vec![ok_result("t1")],
            unstarted: Some(names(&["t2"])),
            failure: Some(RunFailure::Terminated),
        }]);
        let (results, failure) =
            run_with_retries(names(&["t1", "t2"]), true, run, || async { true }).await;

        assert!(matches!(failure, Some(RunFailure::Terminated)));
        assert_eq!(results.len(), 1);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_unstarted_stops_with_failure() {
        let (run, calls) = scripted(vec![Attempt {
            results: vec![],
            unstarted: None,
            failure: Some(RunFailure::StartFailed("bad binary".into())),
        }]);
        let (_, failure) =
            run_with_retries(names(&["t1"]), true, run, || async { true }).await;

        assert!(matches!(failure, Some(RunFailure::StartFailed(_))));
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_unstarted_is_success() {
        let (run, _) = scripted(vec![Attempt {
            results: vec![ok_result("t1")],
            unstarted: Some(vec![]),
            failure: Some(RunFailure::RunnerExit("late crash".into())),
        }]);
        let (results, failure) =
            run_with_retries(names(&["t1"]), true, run, || async { true }).await;

        assert!(failure.is_none());
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn continue_after_failure_disabled_stops() {
        let (run, calls) = scripted(vec![Attempt {
            results: vec![ok_result("t1")],
            unstarted: Some(names(&["t2"])),
            failure: Some(RunFailure::RunnerExit("died".into())),
        }]);
        let (_, failure) =
            run_with_retries(names(&["t1", "t2"]), false, run, || async { true }).await;

        assert!(failure.is_some());
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn declined_pre_retry_hook_stops() {
        let (run, calls) = scripted(vec![Attempt {
            results: vec![ok_result("t1")],
            unstarted: Some(names(&["t2"])),
            failure: Some(RunFailure::RunnerExit("died".into())),
        }]);
        let (_, failure) =
            run_with_retries(names(&["t1", "t2"]), true, run, || async { false }).await;

        assert!(failure.is_some());
        assert_eq!(calls.lock().unwrap().len(), 1);
    }
}
