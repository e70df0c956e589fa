//! Core entities: executions, attempts, and the enums that describe them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ExecutionId
// ---------------------------------------------------------------------------

/// Opaque, globally unique execution identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

/// Externally visible lifecycle state of an execution.
///
/// Transitions only ever move forward: `Pending -> Running -> {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal forward step.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (ExecutionStatus::Pending, ExecutionStatus::Running)
                | (ExecutionStatus::Running, ExecutionStatus::Completed)
                | (ExecutionStatus::Running, ExecutionStatus::Failed)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// AttemptOutcome
// ---------------------------------------------------------------------------

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Timeout,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failure => "failure",
            AttemptOutcome::Timeout => "timeout",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AttemptOutcome::Success),
            "failure" => Ok(AttemptOutcome::Failure),
            "timeout" => Ok(AttemptOutcome::Timeout),
            other => Err(format!("unknown attempt outcome '{}'", other)),
        }
    }
}

/// Which side a failed attempt blames. Recorded so that a restart can tell a
/// retryable infrastructure failure from a terminal test failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Test,
    Infra,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Test => "test",
            FailureKind::Infra => "infra",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test" => Ok(FailureKind::Test),
            "infra" => Ok(FailureKind::Infra),
            other => Err(format!("unknown failure kind '{}'", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Framework / Language
// ---------------------------------------------------------------------------

/// Browser-automation framework the test source is written against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framework {
    Playwright,
    Puppeteer,
    Selenium,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Playwright => "playwright",
            Framework::Puppeteer => "puppeteer",
            Framework::Selenium => "selenium",
        }
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "playwright" => Ok(Framework::Playwright),
            "puppeteer" => Ok(Framework::Puppeteer),
            "selenium" => Ok(Framework::Selenium),
            other => Err(format!("unknown framework '{}'", other)),
        }
    }
}

/// Source language of the test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Javascript,
    Typescript,
    Python,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Javascript => "javascript",
            Language::Typescript => "typescript",
            Language::Python => "python",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "javascript" | "js" => Ok(Language::Javascript),
            "typescript" | "ts" => Ok(Language::Typescript),
            "python" | "py" => Ok(Language::Python),
            other => Err(format!("unknown language '{}'", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Browser options
// ---------------------------------------------------------------------------

/// Browser engine the test runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

impl fmt::Display for Browser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Browser {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chromium" | "chrome" => Ok(Browser::Chromium),
            "firefox" => Ok(Browser::Firefox),
            "webkit" => Ok(Browser::Webkit),
            other => Err(format!("unknown browser '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// How the browser for each attempt is launched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserOptions {
    pub browser: Browser,
    pub viewport: Viewport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

// ---------------------------------------------------------------------------
// ExecutionRequest
// ---------------------------------------------------------------------------

/// A validated submission. Immutable once accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub test_id: String,
    pub source: String,
    pub framework: Framework,
    pub language: Language,
    pub base_url: Option<String>,
    pub browser: BrowserOptions,
    pub max_attempts: u32,
    pub attempt_timeout_ms: u64,
    pub capture_screenshot: bool,
}

// ---------------------------------------------------------------------------
// AttemptRecord
// ---------------------------------------------------------------------------

/// One run of the test inside the browser runner.
///
/// `ended_at` and `outcome` are `None` while the attempt is in flight; once
/// sealed the record never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub index: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<AttemptOutcome>,
    /// Set only for `Failure` outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    pub logs: String,
    pub error: Option<String>,
    pub screenshot_url: Option<String>,
}

impl AttemptRecord {
    pub fn is_sealed(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// Data written when an attempt is sealed.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedAttempt {
    pub ended_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub failure_kind: Option<FailureKind>,
    pub logs: String,
    pub error: Option<String>,
    pub screenshot_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// References to artifacts uploaded for the terminal attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRefs {
    pub screenshot_url: Option<String>,
    pub log_url: Option<String>,
}

/// The central entity: one submitted test and everything that happened to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub test_id: String,
    pub framework: Framework,
    pub language: Language,
    pub source: String,
    pub base_url: Option<String>,
    pub browser: BrowserOptions,
    pub status: ExecutionStatus,
    pub attempt_count: u32,
    pub attempts: Vec<AttemptRecord>,
    pub logs: String,
    pub error: Option<String>,
    pub artifacts: ArtifactRefs,
    pub duration_ms: Option<u64>,
    pub max_attempts: u32,
    pub attempt_timeout_ms: u64,
    pub capture_screenshot: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// Build a fresh `pending` execution for a validated request.
    pub fn from_request(request: ExecutionRequest) -> Self {
        let now = Utc::now();
        Self {
            id: ExecutionId::new(),
            test_id: request.test_id,
            framework: request.framework,
            language: request.language,
            source: request.source,
            base_url: request.base_url,
            browser: request.browser,
            status: ExecutionStatus::Pending,
            attempt_count: 0,
            attempts: Vec::new(),
            logs: String::new(),
            error: None,
            artifacts: ArtifactRefs::default(),
            duration_ms: None,
            max_attempts: request.max_attempts,
            attempt_timeout_ms: request.attempt_timeout_ms,
            capture_screenshot: request.capture_screenshot,
            created_at: now,
            started_at: None,
            updated_at: now,
        }
    }

    /// The attempt currently in flight, if any.
    pub fn open_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.last().filter(|a| !a.is_sealed())
    }

    pub fn last_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }
}

/// Terminal data written by `finalize`.
#[derive(Debug, Clone, PartialEq)]
pub struct Finalization {
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub artifacts: ArtifactRefs,
    pub duration_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
