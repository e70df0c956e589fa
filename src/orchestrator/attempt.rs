//! One bounded attempt: run the browser runner under a deadline and make sure
//! it is gone afterwards.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::execution::AttemptOutcome;
use crate::policy::Verdict;
use crate::runner::{BrowserRunner, RunJob, RunOutcome, RunReport, RunnerError};

/// How the bounded run ended.
#[derive(Debug)]
pub(crate) enum AttemptEnd {
    /// The runner returned (or crashed; crashes are folded into an infra
    /// failure report).
    Finished(RunReport),
    /// The deadline passed first. The runner has been stopped.
    TimedOut,
    /// `interrupt` fired first. The runner has been stopped.
    Interrupted,
}

impl AttemptEnd {
    /// Policy verdict and ledger outcome for a finished or timed-out attempt.
    pub(crate) fn classify(&self) -> Option<(Verdict, AttemptOutcome)> {
        match self {
            AttemptEnd::Finished(report) => Some(match report.outcome {
                RunOutcome::Success => (Verdict::Passed, AttemptOutcome::Success),
                RunOutcome::TestFailure => (Verdict::TestFailed, AttemptOutcome::Failure),
                RunOutcome::InfraFailure => (Verdict::InfraFailed, AttemptOutcome::Failure),
            }),
            AttemptEnd::TimedOut => Some((Verdict::TimedOut, AttemptOutcome::Timeout)),
            AttemptEnd::Interrupted => None,
        }
    }
}

/// Run `job` on its own task, bounded by `deadline`.
///
/// On deadline or interrupt the runner's cancel token fires; if the runner
/// has not returned after `kill_grace` its task is aborted, which drops any
/// child process handles it holds.
pub(crate) async fn run_bounded(
    runner: Arc<dyn BrowserRunner>,
    job: RunJob,
    deadline: Duration,
    kill_grace: Duration,
    interrupt: &CancellationToken,
) -> AttemptEnd {
    let execution_id = job.execution_id;
    let attempt = job.attempt;
    let runner_cancel = CancellationToken::new();
    let mut handle = {
        let token = runner_cancel.clone();
        tokio::spawn(async move { runner.run(job, token).await })
    };

    let end = tokio::select! {
        joined = &mut handle => return AttemptEnd::Finished(report_from_join(joined)),
        _ = tokio::time::sleep(deadline) => AttemptEnd::TimedOut,
        _ = interrupt.cancelled() => AttemptEnd::Interrupted,
    };

    runner_cancel.cancel();
    if tokio::time::timeout(kill_grace, &mut handle).await.is_err() {
        warn!(
            execution_id = %execution_id,
            attempt,
            grace_ms = kill_grace.as_millis() as u64,
            "runner ignored cancellation, aborting"
        );
        handle.abort();
        let _ = handle.await;
    }
    end
}

fn report_from_join(joined: Result<Result<RunReport, RunnerError>, JoinError>) -> RunReport {
    match joined {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => RunReport::infra_failure("", format!("runner error: {}", e)),
        Err(e) if e.is_panic() => RunReport::infra_failure(
            "",
            format!("runner panicked: {}", panic_message(e.into_panic())),
        ),
        Err(_) => RunReport::infra_failure("", "runner task was cancelled"),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{BrowserOptions, ExecutionId, Framework, Language};
    use crate::runner::{ScriptedRunner, Step};

    fn job() -> RunJob {
        RunJob {
            execution_id: ExecutionId::new(),
            attempt: 1,
            source: "noop".into(),
            framework: Framework::Playwright,
            language: Language::Javascript,
            base_url: None,
            browser: BrowserOptions::default(),
            deadline: Duration::from_millis(100),
            capture_screenshot: false,
        }
    }

    async fn bounded(runner: Arc<ScriptedRunner>) -> AttemptEnd {
        run_bounded(
            runner,
            job(),
            Duration::from_millis(100),
            Duration::from_millis(50),
            &CancellationToken::new(),
        )
        .await
    }

    #[tokio::test]
    async fn test_finished_run_is_reported() {
        let runner = Arc::new(ScriptedRunner::always(Step::pass()));
        let end = bounded(runner).await;
        assert_eq!(
            end.classify(),
            Some((Verdict::Passed, AttemptOutcome::Success))
        );
    }

    #[tokio::test]
    async fn test_panic_becomes_infra_failure() {
        let runner = Arc::new(ScriptedRunner::always(Step::Crash));
        let end = bounded(runner).await;
        match end {
            AttemptEnd::Finished(report) => {
                assert_eq!(report.outcome, RunOutcome::InfraFailure);
                assert!(report.error.unwrap().contains("scripted runner crash"));
            }
            other => panic!("unexpected end: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_runner_error_becomes_infra_failure() {
        let runner = Arc::new(ScriptedRunner::always(Step::Error("no browser".into())));
        let end = bounded(runner).await;
        assert_eq!(
            end.classify(),
            Some((Verdict::InfraFailed, AttemptOutcome::Failure))
        );
    }

    #[tokio::test]
    async fn test_deadline_stops_cooperative_runner() {
        let runner = Arc::new(ScriptedRunner::always(Step::Hang { honor_cancel: true }));
        let end = bounded(runner.clone()).await;
        assert!(matches!(end, AttemptEnd::TimedOut));
        assert_eq!(runner.live_runs(), 0);
    }

    #[tokio::test]
    async fn test_deadline_aborts_stuck_runner_after_grace() {
        let runner = Arc::new(ScriptedRunner::always(Step::Hang { honor_cancel: false }));
        let started = tokio::time::Instant::now();
        let end = bounded(runner.clone()).await;
        assert!(matches!(end, AttemptEnd::TimedOut));
        assert!(started.elapsed() < Duration::from_millis(1_000));
        assert_eq!(runner.live_runs(), 0);
    }

    #[tokio::test]
    async fn test_interrupt_stops_runner() {
        let runner = Arc::new(ScriptedRunner::always(Step::Hang { honor_cancel: true }));
        let interrupt = CancellationToken::new();
        let trigger = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let end = run_bounded(
            runner.clone(),
            job(),
            Duration::from_secs(5),
            Duration::from_millis(50),
            &interrupt,
        )
        .await;
        assert!(matches!(end, AttemptEnd::Interrupted));
        assert!(end.classify().is_none());
        assert_eq!(runner.live_runs(), 0);
    }
}
