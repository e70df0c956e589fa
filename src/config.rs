//! TOML configuration for the runwarden daemon and CLI.
//!
//! Every section is optional; missing sections and keys fall back to the
//! compiled-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::execution::{Browser, BrowserOptions, SubmitLimits, Viewport};
use crate::orchestrator::OrchestratorSettings;
use crate::policy::{Backoff, RetryPolicy};
use crate::runner::NodeRunnerConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "RUNWARDEN_CONFIG";
/// Config file consulted when neither a flag nor the env var is given.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/runwarden/runwarden.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunwardenConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RunwardenConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded runwarden configuration");
        Ok(config)
    }

    /// Resolve configuration, in order:
    /// 1. `explicit` (the `--config` flag); failing to load it is an error.
    /// 2. The path in `RUNWARDEN_CONFIG`.
    /// 3. `/etc/runwarden/runwarden.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "RUNWARDEN_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.policy.max_attempts.max(1),
            attempt_timeout: Duration::from_millis(self.policy.attempt_timeout_ms),
            backoff: Backoff {
                base: Duration::from_millis(self.policy.backoff_base_ms),
                cap: Duration::from_millis(self.policy.backoff_cap_ms),
            },
            kill_grace: Duration::from_millis(self.policy.kill_grace_ms),
        }
    }

    pub fn submit_limits(&self) -> SubmitLimits {
        SubmitLimits {
            default_max_attempts: self.policy.max_attempts.max(1),
            default_attempt_timeout_ms: self.policy.attempt_timeout_ms,
            max_attempts_limit: self.orchestrator.max_attempts_limit,
            max_attempt_timeout_ms: self.orchestrator.max_attempt_timeout_ms,
            default_capture_screenshot: self.orchestrator.capture_screenshot,
            max_source_bytes: self.orchestrator.max_source_bytes,
            default_browser: BrowserOptions {
                browser: self.browser.browser,
                viewport: Viewport {
                    width: self.browser.viewport_width,
                    height: self.browser.viewport_height,
                },
                user_agent: self.browser.user_agent.clone(),
            },
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_concurrent: self.orchestrator.max_concurrent,
            watchdog_interval: Duration::from_secs(self.orchestrator.watchdog_interval_sec),
            watchdog_slack: Duration::from_secs(self.orchestrator.watchdog_slack_sec),
            artifact_timeout: Duration::from_millis(self.artifacts.upload_timeout_ms),
        }
    }

    pub fn node_runner(&self) -> NodeRunnerConfig {
        NodeRunnerConfig {
            node_path: self.runner.node_path.clone(),
            module_path: self.runner.module_path.clone(),
            headless: self.runner.headless,
            kill_grace: Duration::from_millis(self.policy.kill_grace_ms),
            max_log_bytes: self.runner.max_log_bytes,
            scratch_dir: self.runner.scratch_dir.clone(),
        }
    }

    /// Prefix for artifact URLs handed out by the filesystem sink.
    pub fn artifact_base_url(&self) -> String {
        match &self.artifacts.public_base_url {
            Some(url) => url.clone(),
            None => format!(
                "{}/artifacts",
                self.server.public_url.trim_end_matches('/')
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the HTTP API.
    pub bind: String,
    /// Externally reachable base URL of this server.
    pub public_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            public_url: "http://127.0.0.1:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding the execution ledger.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/runwarden.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Default retry and timeout policy. Submissions may override `max_attempts`
/// and the attempt timeout within the orchestrator ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub max_attempts: u32,
    pub attempt_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Time a cancelled runner gets before it is killed.
    pub kill_grace_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_ms: 30_000,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            kill_grace_ms: 5_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Executions allowed to run at once; the rest wait in `pending`.
    pub max_concurrent: usize,
    pub watchdog_interval_sec: u64,
    pub watchdog_slack_sec: u64,
    /// Ceiling on a per-submission `max_attempts` override.
    pub max_attempts_limit: u32,
    /// Ceiling on a per-submission `timeout_ms` override.
    pub max_attempt_timeout_ms: u64,
    pub max_source_bytes: usize,
    /// Default for submissions that do not set `capture_screenshot`.
    pub capture_screenshot: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            watchdog_interval_sec: 15,
            watchdog_slack_sec: 10,
            max_attempts_limit: 10,
            max_attempt_timeout_ms: 600_000,
            max_source_bytes: 1024 * 1024,
            capture_screenshot: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerBackend {
    /// Node.js with Playwright or Puppeteer.
    Node,
    /// Always-passing scripted runner, for dry runs without a browser.
    Scripted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub backend: RunnerBackend,
    /// Path (or bare command name resolved via `$PATH`) to the node binary.
    pub node_path: String,
    /// Directory containing `node_modules` with the browser frameworks.
    pub module_path: Option<PathBuf>,
    pub headless: bool,
    /// Per-stream cap on captured runner output.
    pub max_log_bytes: usize,
    /// Parent of per-attempt scratch directories.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            backend: RunnerBackend::Node,
            node_path: "node".to_string(),
            module_path: None,
            headless: true,
            max_log_bytes: 256 * 1024,
            scratch_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Browser
// ---------------------------------------------------------------------------

/// Browser launch defaults for submissions that do not choose their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub browser: Browser,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub user_agent: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        let viewport = Viewport::default();
        Self {
            browser: Browser::Chromium,
            viewport_width: viewport.width,
            viewport_height: viewport.height,
            user_agent: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactBackend {
    Filesystem,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    pub backend: ArtifactBackend,
    /// Root directory of the filesystem sink, served under `/artifacts`.
    pub dir: PathBuf,
    /// Overrides `<server.public_url>/artifacts` as the URL prefix.
    pub public_base_url: Option<String>,
    /// Uploads still running after this long are abandoned.
    pub upload_timeout_ms: u64,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            backend: ArtifactBackend::Filesystem,
            dir: PathBuf::from("data/artifacts"),
            public_base_url: None,
            upload_timeout_ms: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Settings for the `submit` and `status` CLI commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub poll_interval_ms: u64,
    pub max_wait_sec: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            poll_interval_ms: 2_000,
            max_wait_sec: 300,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level; `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
