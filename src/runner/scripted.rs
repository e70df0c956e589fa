//! Deterministic runner driven by a queue of scripted steps.
//!
//! Used by the test suites and by the `scripted` runner backend, which lets a
//! deployment exercise the whole pipeline without a browser installed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{BrowserRunner, RunJob, RunReport, RunnerError};
use crate::execution::{Browser, Framework, Language};

/// What the scripted runner does on one call.
#[derive(Debug, Clone)]
pub enum Step {
    /// Pass after `delay`.
    Pass { logs: String, delay: Duration },
    /// Report a test failure, optionally with a fake screenshot.
    TestFailure { error: String, screenshot: bool },
    /// Report an infrastructure failure.
    InfraFailure { error: String },
    /// Return a runner error.
    Error(String),
    /// Panic inside the runner.
    Crash,
    /// Never finish on its own. With `honor_cancel` the run ends when the
    /// cancel token fires; without it only an abort stops it.
    Hang { honor_cancel: bool },
    /// Wait for `gate` to be notified, then perform `then`.
    Gated { gate: Arc<Notify>, then: Box<Step> },
}

impl Step {
    pub fn pass() -> Self {
        Step::Pass {
            logs: "scripted run passed".into(),
            delay: Duration::ZERO,
        }
    }

    pub fn test_failure(error: impl Into<String>) -> Self {
        Step::TestFailure {
            error: error.into(),
            screenshot: true,
        }
    }

    pub fn infra_failure(error: impl Into<String>) -> Self {
        Step::InfraFailure {
            error: error.into(),
        }
    }
}

/// Decrements the live-run counter when a run finishes or is dropped.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ScriptedRunner {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicU32,
    live: Arc<AtomicUsize>,
    jobs: Mutex<Vec<RunJob>>,
}

impl ScriptedRunner {
    /// Runner that performs `fallback` on every call.
    pub fn always(fallback: Step) -> Self {
        Self::new(Vec::new(), fallback)
    }

    /// Runner that performs `steps` in order, then `fallback` forever.
    pub fn new(steps: Vec<Step>, fallback: Step) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback,
            calls: AtomicU32::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Number of times `run` was called.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Runs currently executing. Drops to zero once every run has returned or
    /// been aborted.
    pub fn live_runs(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Jobs received so far, in call order.
    pub fn jobs(&self) -> Vec<RunJob> {
        self.jobs.lock().map(|j| j.clone()).unwrap_or_default()
    }

    fn next_step(&self) -> Step {
        self.steps
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl BrowserRunner for ScriptedRunner {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn supports(&self, _framework: Framework, language: Language, _browser: Browser) -> bool {
        language == Language::Javascript
    }

    async fn run(&self, job: RunJob, cancel: CancellationToken) -> Result<RunReport, RunnerError> {
        let _guard = LiveGuard::enter(&self.live);
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.push(job);
        }

        let mut step = self.next_step();
        loop {
            match step {
                Step::Gated { gate, then } => {
                    tokio::select! {
                        _ = gate.notified() => step = *then,
                        _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
                    }
                }
                other => return perform(other, &cancel).await,
            }
        }
    }
}

async fn perform(step: Step, cancel: &CancellationToken) -> Result<RunReport, RunnerError> {
    match step {
        Step::Pass { logs, delay } => {
            tokio::select! {
                _ = tokio::time::sleep(delay) => Ok(RunReport::success(logs)),
                _ = cancel.cancelled() => Err(RunnerError::Cancelled),
            }
        }
        Step::TestFailure { error, screenshot } => {
            let report = RunReport::test_failure("running scripted test\n", error);
            Ok(if screenshot {
                report.with_screenshot(Bytes::from_static(b"\x89PNG scripted"))
            } else {
                report
            })
        }
        Step::InfraFailure { error } => Ok(RunReport::infra_failure("", error)),
        Step::Error(msg) => Err(RunnerError::Backend(msg)),
        Step::Crash => panic!("scripted runner crash"),
        Step::Hang { honor_cancel: true } => {
            cancel.cancelled().await;
            Err(RunnerError::Cancelled)
        }
        Step::Hang { honor_cancel: false } => {
            std::future::pending::<()>().await;
            Err(RunnerError::Cancelled)
        }
        // `run` resolves gates before calling here.
        Step::Gated { .. } => Err(RunnerError::Backend("unresolved gate".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{BrowserOptions, ExecutionId};
    use crate::runner::RunOutcome;

    fn job() -> RunJob {
        RunJob {
            execution_id: ExecutionId::new(),
            attempt: 1,
            source: "noop".into(),
            framework: Framework::Playwright,
            language: Language::Javascript,
            base_url: None,
            browser: BrowserOptions::default(),
            deadline: Duration::from_secs(1),
            capture_screenshot: true,
        }
    }

    #[tokio::test]
    async fn test_steps_then_fallback() {
        let runner = ScriptedRunner::new(
            vec![Step::infra_failure("browser crashed"), Step::test_failure("nope")],
            Step::pass(),
        );
        let token = CancellationToken::new();

        let r1 = runner.run(job(), token.clone()).await.unwrap();
        assert_eq!(r1.outcome, RunOutcome::InfraFailure);
        let r2 = runner.run(job(), token.clone()).await.unwrap();
        assert_eq!(r2.outcome, RunOutcome::TestFailure);
        assert!(r2.screenshot.is_some());
        let r3 = runner.run(job(), token.clone()).await.unwrap();
        assert_eq!(r3.outcome, RunOutcome::Success);
        let r4 = runner.run(job(), token).await.unwrap();
        assert_eq!(r4.outcome, RunOutcome::Success);

        assert_eq!(runner.calls(), 4);
        assert_eq!(runner.jobs().len(), 4);
        assert_eq!(runner.live_runs(), 0);
    }

    #[tokio::test]
    async fn test_hang_honours_cancel() {
        let runner = Arc::new(ScriptedRunner::always(Step::Hang { honor_cancel: true }));
        let token = CancellationToken::new();
        let task = {
            let runner = runner.clone();
            let token = token.clone();
            tokio::spawn(async move { runner.run(job(), token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runner.live_runs(), 1);

        token.cancel();
        let res = task.await.unwrap();
        assert!(matches!(res, Err(RunnerError::Cancelled)));
        assert_eq!(runner.live_runs(), 0);
    }

    #[tokio::test]
    async fn test_abort_releases_live_guard() {
        let runner = Arc::new(ScriptedRunner::always(Step::Hang { honor_cancel: false }));
        let task = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(job(), CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runner.live_runs(), 1);

        task.abort();
        let _ = task.await;
        assert_eq!(runner.live_runs(), 0);
    }

    #[tokio::test]
    async fn test_gate_holds_run() {
        let gate = Arc::new(Notify::new());
        let runner = Arc::new(ScriptedRunner::always(Step::Gated {
            gate: gate.clone(),
            then: Box::new(Step::pass()),
        }));
        let task = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(job(), CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        gate.notify_one();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.outcome, RunOutcome::Success);
    }
}
