//! Read-only status gateway: what callers are allowed to see.

pub mod client;

pub use self::client::{ClientError, PollClient};

use serde::{Deserialize, Serialize};

use crate::execution::{Execution, ExecutionId, ExecutionStatus};
use crate::ledger::{Ledger, LedgerError};

/// Caller-facing projection of an execution.
///
/// Retry churn stays internal: until the execution is terminal, logs are
/// empty and no error is reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub logs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub attempts: u32,
}

impl StatusView {
    pub fn from_execution(exec: &Execution) -> Self {
        if !exec.status.is_terminal() {
            return Self {
                execution_id: exec.id,
                status: exec.status,
                logs: String::new(),
                error: None,
                screenshot_url: None,
                log_url: None,
                duration_ms: None,
                attempts: exec.attempt_count,
            };
        }
        Self {
            execution_id: exec.id,
            status: exec.status,
            logs: exec.logs.clone(),
            error: exec.error.clone(),
            screenshot_url: exec.artifacts.screenshot_url.clone(),
            log_url: exec.artifacts.log_url.clone(),
            duration_ms: exec.duration_ms,
            attempts: exec.attempt_count,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Clone)]
pub struct StatusGateway {
    ledger: Ledger,
}

impl StatusGateway {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// `None` for an unknown id; never a synthesized `pending`.
    pub async fn get_status(&self, id: ExecutionId) -> Result<Option<StatusView>, LedgerError> {
        Ok(self
            .ledger
            .get(id)
            .await?
            .as_ref()
            .map(StatusView::from_execution))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::execution::{
        AttemptOutcome, BrowserOptions, ExecutionRequest, Finalization, Framework, Language,
        SealedAttempt,
    };
    use crate::storage::open_pool;

    fn gateway() -> (tempfile::TempDir, Ledger, StatusGateway) {
        let dir = tempfile::TempDir::new().unwrap();
        let ledger = Ledger::new(open_pool(&dir.path().join("gateway.db")).unwrap());
        let gateway = StatusGateway::new(ledger.clone());
        (dir, ledger, gateway)
    }

    fn execution() -> Execution {
        Execution::from_request(ExecutionRequest {
            test_id: "profile-page".into(),
            source: "noop".into(),
            framework: Framework::Puppeteer,
            language: Language::Javascript,
            base_url: None,
            browser: BrowserOptions::default(),
            max_attempts: 3,
            attempt_timeout_ms: 1_000,
            capture_screenshot: true,
        })
    }

    fn sealed(outcome: AttemptOutcome, error: Option<&str>) -> SealedAttempt {
        SealedAttempt {
            ended_at: Utc::now(),
            outcome,
            failure_kind: None,
            logs: "console output".into(),
            error: error.map(String::from),
            screenshot_url: None,
        }
    }

    #[tokio::test]
    async fn test_unknown_id_is_none() {
        let (_dir, _ledger, gateway) = gateway();
        assert!(gateway.get_status(ExecutionId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_running_execution_hides_retry_noise() {
        let (_dir, ledger, gateway) = gateway();
        let exec = execution();
        ledger.create(&exec).await.unwrap();

        let view = gateway.get_status(exec.id).await.unwrap().unwrap();
        assert_eq!(view.status, ExecutionStatus::Pending);
        assert_eq!(view.attempts, 0);

        ledger.start(exec.id).await.unwrap();
        ledger.append_attempt(exec.id, Utc::now()).await.unwrap();
        ledger
            .seal_attempt(exec.id, 1, sealed(AttemptOutcome::Timeout, Some("slow")))
            .await
            .unwrap();

        let view = gateway.get_status(exec.id).await.unwrap().unwrap();
        assert_eq!(view.status, ExecutionStatus::Running);
        assert_eq!(view.attempts, 1);
        assert!(view.logs.is_empty());
        assert!(view.error.is_none());
        assert!(view.duration_ms.is_none());
    }

    #[tokio::test]
    async fn test_terminal_execution_reports_everything() {
        let (_dir, ledger, gateway) = gateway();
        let exec = execution();
        ledger.create(&exec).await.unwrap();
        ledger.start(exec.id).await.unwrap();
        ledger.append_attempt(exec.id, Utc::now()).await.unwrap();
        ledger
            .seal_attempt(exec.id, 1, sealed(AttemptOutcome::Failure, Some("expected title")))
            .await
            .unwrap();
        ledger
            .finalize(
                exec.id,
                Finalization {
                    status: ExecutionStatus::Failed,
                    error: Some("expected title".into()),
                    artifacts: crate::execution::ArtifactRefs {
                        screenshot_url: Some("memory://shot.png".into()),
                        log_url: Some("memory://log.txt".into()),
                    },
                    duration_ms: Some(1234),
                },
            )
            .await
            .unwrap();

        let view = gateway.get_status(exec.id).await.unwrap().unwrap();
        assert_eq!(view.status, ExecutionStatus::Failed);
        assert_eq!(view.error.as_deref(), Some("expected title"));
        assert!(view.logs.contains("console output"));
        assert_eq!(view.screenshot_url.as_deref(), Some("memory://shot.png"));
        assert_eq!(view.duration_ms, Some(1234));

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["execution_id"], exec.id.to_string());
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let view = StatusView {
            execution_id: ExecutionId::new(),
            status: ExecutionStatus::Pending,
            logs: String::new(),
            error: None,
            screenshot_url: None,
            log_url: None,
            duration_ms: None,
            attempts: 0,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert!(json.get("error").is_none());
        assert!(json.get("duration_ms").is_none());
        let back: StatusView = serde_json::from_value(json).unwrap();
        assert_eq!(back, view);
    }
}
