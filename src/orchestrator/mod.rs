//! Execution orchestrator.
//!
//! Each accepted execution is driven by exactly one task, which owns every
//! ledger write for that execution while it runs: start, append, seal,
//! finalize.  Cancel requests and the watchdog only ever call `force_fail`,
//! which the ledger guards make safe against the owning task.

mod attempt;
mod watchdog;

pub use self::watchdog::RecoveryReport;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use self::attempt::{run_bounded, AttemptEnd};
use crate::artifacts::{ArtifactKind, ArtifactSink};
use crate::execution::{
    validate, ArtifactRefs, AttemptOutcome, AttemptRecord, Execution, ExecutionId,
    ExecutionStatus, FailureKind, Finalization, SealedAttempt, SubmitLimits, SubmitRequest,
    ValidationError,
};
use crate::ledger::{Ledger, LedgerError, WriteOutcome};
use crate::policy::{RetryPolicy, Verdict};
use crate::runner::{BrowserRunner, RunJob};

/// Error recorded when an execution is cancelled on request.
pub const CANCELLED_ERROR: &str = "execution cancelled";
/// Error recorded when an execution outlives its watchdog bound.
pub const WATCHDOG_ERROR: &str = "execution watchdog timeout";
/// Error recorded on an attempt left open by a previous process.
pub const INTERRUPTED_ERROR: &str = "attempt interrupted before completion";

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyTerminal,
    NotFound,
}

/// Orchestrator tuning that is not part of the retry policy.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Executions allowed to be in `running` at once.
    pub max_concurrent: usize,
    pub watchdog_interval: Duration,
    /// Added on top of the computed watchdog bound.
    pub watchdog_slack: Duration,
    /// Longest a single artifact upload may take before it is abandoned.
    pub artifact_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            watchdog_interval: Duration::from_secs(15),
            watchdog_slack: Duration::from_secs(10),
            artifact_timeout: Duration::from_secs(10),
        }
    }
}

/// Handle to the orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    ledger: Ledger,
    runner: Arc<dyn BrowserRunner>,
    sink: Arc<dyn ArtifactSink>,
    policy: RetryPolicy,
    limits: SubmitLimits,
    settings: OrchestratorSettings,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashMap<ExecutionId, CancellationToken>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// The last sealed attempt, as the retry loop sees it.
#[derive(Debug, Clone)]
struct Settled {
    index: u32,
    verdict: Verdict,
    ended_at: DateTime<Utc>,
    error: Option<String>,
    screenshot_url: Option<String>,
}

impl Settled {
    /// Rebuild loop state from a sealed attempt found in the ledger.
    ///
    /// A `failure` without a recorded kind is treated as a test failure and
    /// not retried.
    fn from_record(record: &AttemptRecord) -> Option<Self> {
        let verdict = match (record.outcome?, record.failure_kind) {
            (AttemptOutcome::Success, _) => Verdict::Passed,
            (AttemptOutcome::Timeout, _) => Verdict::TimedOut,
            (AttemptOutcome::Failure, Some(FailureKind::Infra)) => Verdict::InfraFailed,
            (AttemptOutcome::Failure, _) => Verdict::TestFailed,
        };
        Some(Self {
            index: record.index,
            verdict,
            ended_at: record.ended_at?,
            error: record.error.clone(),
            screenshot_url: record.screenshot_url.clone(),
        })
    }
}

/// Failure kind persisted with an attempt so a restart classifies it the same way.
fn failure_kind(verdict: Verdict) -> Option<FailureKind> {
    match verdict {
        Verdict::TestFailed => Some(FailureKind::Test),
        Verdict::InfraFailed => Some(FailureKind::Infra),
        _ => None,
    }
}

/// Where the drive loop goes after a step.
enum Flow<T> {
    Continue(T),
    /// Someone else finalized the execution.
    Stop,
    /// Cancel or shutdown fired.
    Interrupted,
}

impl Orchestrator {
    pub fn new(
        ledger: Ledger,
        runner: Arc<dyn BrowserRunner>,
        sink: Arc<dyn ArtifactSink>,
        policy: RetryPolicy,
        limits: SubmitLimits,
        settings: OrchestratorSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Self {
            inner: Arc::new(Inner {
                ledger,
                runner,
                sink,
                policy,
                limits,
                settings,
                permits,
                in_flight: Mutex::new(HashMap::new()),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    pub fn runner_name(&self) -> &'static str {
        self.inner.runner.name()
    }

    /// Validate, persist as `pending`, and start driving the execution.
    pub async fn submit(&self, raw: SubmitRequest) -> Result<ExecutionId, SubmitError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }
        let runner = self.inner.runner.clone();
        let request = validate(raw, &self.inner.limits, |f, l, b| {
            runner.supports(f, l, b)
        })?;
        let execution = Execution::from_request(request);
        self.inner.ledger.create(&execution).await?;

        info!(
            execution_id = %execution.id,
            test_id = %execution.test_id,
            framework = %execution.framework,
            browser = %execution.browser.browser,
            max_attempts = execution.max_attempts,
            timeout_ms = execution.attempt_timeout_ms,
            "execution accepted"
        );
        self.spawn_drive(execution.id);
        Ok(execution.id)
    }

    /// Cancel a non-terminal execution.  The in-flight attempt (if any) is
    /// told to stop and the execution is finalized `failed` immediately.
    pub async fn cancel(&self, id: ExecutionId) -> Result<CancelOutcome, LedgerError> {
        let exec = match self.inner.ledger.get(id).await? {
            Some(e) => e,
            None => return Ok(CancelOutcome::NotFound),
        };
        if exec.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }

        let outcome = self
            .inner
            .ledger
            .force_fail(id, AttemptOutcome::Failure, CANCELLED_ERROR.to_string())
            .await?;
        self.inner.signal(id);

        match outcome {
            WriteOutcome::Applied(()) => {
                info!(execution_id = %id, "execution cancelled");
                Ok(CancelOutcome::Cancelled)
            }
            WriteOutcome::NoOp => Ok(CancelOutcome::AlreadyTerminal),
        }
    }

    /// Executions currently owned by a drive task.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Stop scheduling new work and wait for drive tasks to let go.
    ///
    /// Nothing is finalized: attempts interrupted here stay open in the
    /// ledger and are picked up by recovery on the next start.
    pub async fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        debug!("orchestrator drained");
    }

    pub(crate) fn spawn_drive(&self, id: ExecutionId) {
        let token = {
            let mut map = match self.inner.in_flight.lock() {
                Ok(m) => m,
                Err(_) => {
                    error!(execution_id = %id, "in-flight table poisoned, not scheduling");
                    return;
                }
            };
            if map.contains_key(&id) {
                return;
            }
            let token = self.inner.shutdown.child_token();
            map.insert(id, token.clone());
            token
        };

        let inner = self.inner.clone();
        self.inner.tasks.spawn(async move {
            if let Err(e) = inner.drive(id, &token).await {
                error!(execution_id = %id, error = %e, "execution task failed");
            }
            if let Ok(mut map) = inner.in_flight.lock() {
                map.remove(&id);
            }
        });
    }
}

impl Inner {
    /// Fire the cancel token of the task driving `id`, if there is one.
    fn signal(&self, id: ExecutionId) {
        if let Ok(map) = self.in_flight.lock() {
            if let Some(token) = map.get(&id) {
                token.cancel();
            }
        }
    }

    fn policy_for(&self, exec: &Execution) -> RetryPolicy {
        self.policy.with_overrides(
            exec.max_attempts,
            Duration::from_millis(exec.attempt_timeout_ms),
        )
    }

    async fn drive(&self, id: ExecutionId, cancel: &CancellationToken) -> Result<(), LedgerError> {
        let _permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return Ok(()),
            },
            _ = cancel.cancelled() => return self.on_interrupt(id).await,
        };

        let exec = match self.ledger.get(id).await? {
            Some(e) if !e.status.is_terminal() => e,
            _ => return Ok(()),
        };
        let policy = self.policy_for(&exec);

        let started_at = match self.ledger.start(id).await? {
            WriteOutcome::Applied(t) => {
                info!(execution_id = %id, "execution running");
                t
            }
            WriteOutcome::NoOp => exec.started_at.unwrap_or_else(Utc::now),
        };

        let mut last = match self.resume_state(&exec).await? {
            Flow::Continue(last) => last,
            Flow::Stop => return Ok(()),
            Flow::Interrupted => return self.on_interrupt(id).await,
        };

        loop {
            if let Some(prev) = &last {
                let decision = policy.decide(prev.verdict, prev.index);
                if !decision.retry {
                    return self.finish(id, started_at, prev).await;
                }
                debug!(
                    execution_id = %id,
                    attempt = prev.index,
                    delay_ms = decision.delay.as_millis() as u64,
                    "retrying after backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(decision.delay) => {}
                    _ = cancel.cancelled() => return self.on_interrupt(id).await,
                }
            }

            match self.attempt(&exec, &policy, cancel).await? {
                Flow::Continue(settled) => last = Some(settled),
                Flow::Stop => return Ok(()),
                Flow::Interrupted => return self.on_interrupt(id).await,
            }
        }
    }

    /// Loop state for an execution picked up mid-flight.  An attempt left
    /// open by a previous process is sealed as an interrupted infra failure.
    async fn resume_state(&self, exec: &Execution) -> Result<Flow<Option<Settled>>, LedgerError> {
        let Some(record) = exec.last_attempt() else {
            return Ok(Flow::Continue(None));
        };
        if record.is_sealed() {
            return Ok(Flow::Continue(Settled::from_record(record)));
        }

        let ended_at = Utc::now();
        let sealed = SealedAttempt {
            ended_at,
            outcome: AttemptOutcome::Failure,
            failure_kind: Some(FailureKind::Infra),
            logs: String::new(),
            error: Some(INTERRUPTED_ERROR.to_string()),
            screenshot_url: None,
        };
        match self.ledger.seal_attempt(exec.id, record.index, sealed).await? {
            WriteOutcome::Applied(()) => {
                warn!(
                    execution_id = %exec.id,
                    attempt = record.index,
                    "sealed attempt interrupted by restart"
                );
                Ok(Flow::Continue(Some(Settled {
                    index: record.index,
                    verdict: Verdict::InfraFailed,
                    ended_at,
                    error: Some(INTERRUPTED_ERROR.to_string()),
                    screenshot_url: None,
                })))
            }
            WriteOutcome::NoOp => Ok(Flow::Stop),
        }
    }

    /// Open, run, and seal one attempt.
    async fn attempt(
        &self,
        exec: &Execution,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Flow<Settled>, LedgerError> {
        let id = exec.id;
        let index = match self.ledger.append_attempt(id, Utc::now()).await? {
            WriteOutcome::Applied(i) => i,
            WriteOutcome::NoOp => return Ok(Flow::Stop),
        };
        info!(execution_id = %id, attempt = index, "attempt started");

        let job = RunJob {
            execution_id: id,
            attempt: index,
            source: exec.source.clone(),
            framework: exec.framework,
            language: exec.language,
            base_url: exec.base_url.clone(),
            browser: exec.browser.clone(),
            deadline: policy.attempt_timeout,
            capture_screenshot: exec.capture_screenshot,
        };
        let end = run_bounded(
            self.runner.clone(),
            job,
            policy.attempt_timeout,
            policy.kill_grace,
            cancel,
        )
        .await;
        let ended_at = Utc::now();

        let Some((verdict, outcome)) = end.classify() else {
            return Ok(Flow::Interrupted);
        };
        let (logs, error, screenshot) = match end {
            AttemptEnd::Finished(report) => (report.logs, report.error, report.screenshot),
            _ => (
                String::new(),
                Some(format!(
                    "attempt timed out after {} ms",
                    policy.attempt_timeout.as_millis()
                )),
                None,
            ),
        };

        let screenshot_url = match screenshot {
            Some(png) => self.upload(id, index, ArtifactKind::Screenshot, png).await,
            None => None,
        };

        let sealed = SealedAttempt {
            ended_at,
            outcome,
            failure_kind: failure_kind(verdict),
            logs,
            error: error.clone(),
            screenshot_url: screenshot_url.clone(),
        };
        if let WriteOutcome::NoOp = self.ledger.seal_attempt(id, index, sealed).await? {
            return Ok(Flow::Stop);
        }
        info!(execution_id = %id, attempt = index, outcome = %outcome, "attempt sealed");

        Ok(Flow::Continue(Settled {
            index,
            verdict,
            ended_at,
            error,
            screenshot_url,
        }))
    }

    /// Upload the execution log and write the terminal state.
    async fn finish(
        &self,
        id: ExecutionId,
        started_at: DateTime<Utc>,
        last: &Settled,
    ) -> Result<(), LedgerError> {
        let status = if last.verdict == Verdict::Passed {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };

        let log_url = match self.ledger.get(id).await? {
            Some(exec) if !exec.status.is_terminal() => {
                self.upload(id, last.index, ArtifactKind::Log, Bytes::from(exec.logs))
                    .await
            }
            _ => return Ok(()),
        };

        let duration_ms = (last.ended_at - started_at).num_milliseconds().max(0) as u64;
        let error = match status {
            ExecutionStatus::Completed => None,
            _ => Some(
                last.error
                    .clone()
                    .unwrap_or_else(|| format!("attempt {} failed", last.index)),
            ),
        };
        let fin = Finalization {
            status,
            error,
            artifacts: ArtifactRefs {
                screenshot_url: last.screenshot_url.clone(),
                log_url,
            },
            duration_ms: Some(duration_ms),
        };

        match self.ledger.finalize(id, fin).await? {
            WriteOutcome::Applied(()) => info!(
                execution_id = %id,
                status = %status,
                attempts = last.index,
                duration_ms,
                "execution finished"
            ),
            WriteOutcome::NoOp => debug!(execution_id = %id, "execution already finalized"),
        }
        Ok(())
    }

    /// Cancel or shutdown fired while this task owned the execution.
    async fn on_interrupt(&self, id: ExecutionId) -> Result<(), LedgerError> {
        if self.shutdown.is_cancelled() {
            debug!(execution_id = %id, "leaving execution for recovery");
            return Ok(());
        }
        self.ledger
            .force_fail(id, AttemptOutcome::Failure, CANCELLED_ERROR.to_string())
            .await?;
        Ok(())
    }

    /// Store an artifact. Failures and uploads that outlast
    /// `artifact_timeout` are logged and yield no reference.
    async fn upload(
        &self,
        id: ExecutionId,
        attempt: u32,
        kind: ArtifactKind,
        data: Bytes,
    ) -> Option<String> {
        let limit = self.settings.artifact_timeout;
        match tokio::time::timeout(limit, self.sink.put(id, attempt, kind, data)).await {
            Ok(Ok(url)) => Some(url),
            Ok(Err(e)) => {
                warn!(
                    execution_id = %id,
                    attempt,
                    kind = kind.as_str(),
                    error = %e,
                    "artifact upload failed"
                );
                None
            }
            Err(_) => {
                warn!(
                    execution_id = %id,
                    attempt,
                    kind = kind.as_str(),
                    timeout_ms = limit.as_millis() as u64,
                    "artifact upload timed out"
                );
                None
            }
        }
    }
}
