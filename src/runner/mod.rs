//! Browser runner abstraction.
//!
//! A runner executes one attempt of a test inside a fresh browser context and
//! reports what happened.  It never decides about retries; that is the
//! orchestrator's job.

pub mod node;
pub mod scripted;

pub use self::node::{NodeRunner, NodeRunnerConfig};
pub use self::scripted::{ScriptedRunner, Step};

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::execution::{Browser, BrowserOptions, ExecutionId, Framework, Language};

/// Everything a runner needs for one attempt.
#[derive(Debug, Clone)]
pub struct RunJob {
    pub execution_id: ExecutionId,
    pub attempt: u32,
    pub source: String,
    pub framework: Framework,
    pub language: Language,
    pub base_url: Option<String>,
    pub browser: BrowserOptions,
    /// Time budget for this attempt. The orchestrator enforces it externally
    /// as well; runners use it to size their own internal timeouts.
    pub deadline: Duration,
    pub capture_screenshot: bool,
}

/// Classification of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    /// The test body ran and failed (assertion, thrown error).
    TestFailure,
    /// The test could not be run at all.
    InfraFailure,
}

/// What a runner hands back after an attempt.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub logs: String,
    pub error: Option<String>,
    pub screenshot: Option<Bytes>,
}

impl RunReport {
    pub fn success(logs: impl Into<String>) -> Self {
        Self {
            outcome: RunOutcome::Success,
            logs: logs.into(),
            error: None,
            screenshot: None,
        }
    }

    pub fn test_failure(logs: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            outcome: RunOutcome::TestFailure,
            logs: logs.into(),
            error: Some(error.into()),
            screenshot: None,
        }
    }

    pub fn infra_failure(logs: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            outcome: RunOutcome::InfraFailure,
            logs: logs.into(),
            error: Some(error.into()),
            screenshot: None,
        }
    }

    pub fn with_screenshot(mut self, png: Bytes) -> Self {
        self.screenshot = Some(png);
        self
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to prepare attempt workspace: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("runner i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{framework} tests written in {language} on {browser} are not supported by this runner")]
    Unsupported {
        framework: Framework,
        language: Language,
        browser: Browser,
    },

    #[error("runner backend failed: {0}")]
    Backend(String),

    #[error("run cancelled")]
    Cancelled,
}

/// Executes test source against a headless browser.
#[async_trait]
pub trait BrowserRunner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this runner can execute `framework` tests written in `language`
    /// inside `browser`.
    fn supports(&self, framework: Framework, language: Language, browser: Browser) -> bool;

    /// Run one attempt.
    ///
    /// Implementations must stop promptly once `cancel` fires and must not
    /// leave browser processes behind.
    async fn run(&self, job: RunJob, cancel: CancellationToken) -> Result<RunReport, RunnerError>;
}
