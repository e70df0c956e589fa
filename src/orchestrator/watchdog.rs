//! Startup recovery and the periodic watchdog sweep.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Orchestrator, WATCHDOG_ERROR};
use crate::execution::{AttemptOutcome, Execution, ExecutionId, ExecutionStatus};
use crate::ledger::{LedgerError, WriteOutcome};

/// What startup recovery did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub resumed: usize,
    pub expired: usize,
}

impl Orchestrator {
    /// Re-scan non-terminal executions left behind by a previous process.
    ///
    /// Running executions past their watchdog bound are failed; everything
    /// else is handed back to a drive task.
    pub async fn recover(&self) -> Result<RecoveryReport, LedgerError> {
        let mut report = RecoveryReport::default();
        let ledger = self.ledger();

        for id in ledger.list_by_status(ExecutionStatus::Running).await? {
            let Some(exec) = ledger.get(id).await? else {
                continue;
            };
            if self.expired(&exec) {
                if self.expire(id).await? {
                    report.expired += 1;
                }
            } else {
                self.spawn_drive(id);
                report.resumed += 1;
            }
        }

        for id in ledger.list_by_status(ExecutionStatus::Pending).await? {
            self.spawn_drive(id);
            report.resumed += 1;
        }

        info!(
            resumed = report.resumed,
            expired = report.expired,
            "recovery complete"
        );
        Ok(report)
    }

    /// Fail every running execution that outlived its bound. Returns how many
    /// were failed.
    pub async fn sweep(&self) -> Result<usize, LedgerError> {
        let mut failed = 0;
        for id in self.ledger().list_by_status(ExecutionStatus::Running).await? {
            let Some(exec) = self.ledger().get(id).await? else {
                continue;
            };
            if self.expired(&exec) && self.expire(id).await? {
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(failed, "watchdog failed overdue executions");
        }
        Ok(failed)
    }

    /// Run [`sweep`](Self::sweep) every `watchdog_interval` until shutdown.
    pub fn spawn_watchdog(&self) -> JoinHandle<()> {
        let orch = self.clone();
        let interval = self.inner.settings.watchdog_interval;
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                if let Err(e) = orch.sweep().await {
                    warn!(error = %e, "watchdog sweep failed");
                }
            }
            debug!("watchdog stopped");
        })
    }

    pub(crate) fn watchdog_bound(&self, exec: &Execution) -> Duration {
        self.inner
            .policy_for(exec)
            .watchdog_bound(self.inner.settings.watchdog_slack)
    }

    fn expired(&self, exec: &Execution) -> bool {
        let Some(started_at) = exec.started_at else {
            return false;
        };
        let elapsed = (Utc::now() - started_at).to_std().unwrap_or(Duration::ZERO);
        elapsed > self.watchdog_bound(exec)
    }

    async fn expire(&self, id: ExecutionId) -> Result<bool, LedgerError> {
        let outcome = self
            .ledger()
            .force_fail(id, AttemptOutcome::Timeout, WATCHDOG_ERROR.to_string())
            .await?;
        // Stop a runner that may still be going.
        self.inner.signal(id);
        match outcome {
            WriteOutcome::Applied(()) => {
                warn!(execution_id = %id, "execution exceeded watchdog bound");
                Ok(true)
            }
            WriteOutcome::NoOp => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::artifacts::MemoryArtifactSink;
    use crate::execution::{BrowserOptions, ExecutionRequest, Framework, Language, SubmitLimits};
    use crate::ledger::Ledger;
    use crate::orchestrator::OrchestratorSettings;
    use crate::policy::{Backoff, RetryPolicy};
    use crate::runner::{ScriptedRunner, Step};
    use crate::storage::open_pool;

    fn setup(runner: Arc<ScriptedRunner>) -> (tempfile::TempDir, Ledger, Orchestrator) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(&dir.path().join("watchdog.db")).unwrap();
        let ledger = Ledger::new(pool);
        let orch = Orchestrator::new(
            ledger.clone(),
            runner,
            Arc::new(MemoryArtifactSink::new()),
            RetryPolicy {
                max_attempts: 2,
                attempt_timeout: Duration::from_millis(20),
                backoff: Backoff {
                    base: Duration::from_millis(5),
                    cap: Duration::from_millis(10),
                },
                kill_grace: Duration::from_millis(10),
            },
            SubmitLimits::default(),
            OrchestratorSettings {
                max_concurrent: 2,
                watchdog_interval: Duration::from_millis(20),
                watchdog_slack: Duration::from_millis(10),
                ..Default::default()
            },
        );
        (dir, ledger, orch)
    }

    fn execution() -> Execution {
        Execution::from_request(ExecutionRequest {
            test_id: "orphan".into(),
            source: "noop".into(),
            framework: Framework::Playwright,
            language: Language::Javascript,
            base_url: None,
            browser: BrowserOptions::default(),
            max_attempts: 2,
            attempt_timeout_ms: 20,
            capture_screenshot: false,
        })
    }

    #[tokio::test]
    async fn test_watchdog_bound_uses_execution_overrides() {
        let (_dir, _ledger, orch) = setup(Arc::new(ScriptedRunner::always(Step::pass())));
        // 2 * (20 + 10 + 10) + 10
        assert_eq!(orch.watchdog_bound(&execution()), Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_sweep_fails_overdue_running_execution() {
        let (_dir, ledger, orch) = setup(Arc::new(ScriptedRunner::always(Step::pass())));
        let exec = execution();
        ledger.create(&exec).await.unwrap();
        ledger.start(exec.id).await.unwrap();
        ledger.append_attempt(exec.id, Utc::now()).await.unwrap();

        assert_eq!(orch.sweep().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(orch.sweep().await.unwrap(), 1);

        let failed = ledger.get(exec.id).await.unwrap().unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some(WATCHDOG_ERROR));
        assert_eq!(failed.attempts[0].outcome, Some(AttemptOutcome::Timeout));

        // Already terminal: nothing left to do.
        assert_eq!(orch.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recover_resumes_interrupted_execution() {
        let runner = Arc::new(ScriptedRunner::always(Step::pass()));
        let (_dir, ledger, orch) = setup(runner.clone());

        // Left behind mid-attempt by a previous process.
        let exec = execution();
        ledger.create(&exec).await.unwrap();
        ledger.start(exec.id).await.unwrap();
        ledger.append_attempt(exec.id, Utc::now()).await.unwrap();

        // Never started.
        let queued = execution();
        ledger.create(&queued).await.unwrap();

        let report = orch.recover().await.unwrap();
        assert_eq!(report, RecoveryReport { resumed: 2, expired: 0 });

        for id in [exec.id, queued.id] {
            let mut done = None;
            for _ in 0..200 {
                let e = ledger.get(id).await.unwrap().unwrap();
                if e.status.is_terminal() {
                    done = Some(e);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let done = done.expect("execution did not finish");
            assert_eq!(done.status, ExecutionStatus::Completed);
        }

        let resumed = ledger.get(exec.id).await.unwrap().unwrap();
        assert_eq!(resumed.attempts.len(), 2);
        assert_eq!(resumed.attempts[0].outcome, Some(AttemptOutcome::Failure));
        assert_eq!(
            resumed.attempts[0].error.as_deref(),
            Some(crate::orchestrator::INTERRUPTED_ERROR)
        );
        assert_eq!(resumed.attempts[1].outcome, Some(AttemptOutcome::Success));
        assert_eq!(runner.calls(), 2);
    }

    #[tokio::test]
    async fn test_recover_expires_stale_running_execution() {
        let (_dir, ledger, orch) = setup(Arc::new(ScriptedRunner::always(Step::pass())));
        let exec = execution();
        ledger.create(&exec).await.unwrap();
        ledger.start(exec.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let report = orch.recover().await.unwrap();
        assert_eq!(report, RecoveryReport { resumed: 0, expired: 1 });
        let failed = ledger.get(exec.id).await.unwrap().unwrap();
        assert_eq!(failed.error.as_deref(), Some(WATCHDOG_ERROR));
    }

    #[tokio::test]
    async fn test_watchdog_task_stops_on_shutdown() {
        let (_dir, _ledger, orch) = setup(Arc::new(ScriptedRunner::always(Step::pass())));
        let handle = orch.spawn_watchdog();
        orch.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
