//! Node.js runner: executes Playwright or Puppeteer tests in a child process.
//!
//! Every attempt gets its own scratch directory holding the test body and a
//! generated harness.  The harness launches a fresh browser, runs the body as
//! an async function, and prints a single result line on stdout.
//!
//! On unix the harness leads its own process group, so the browser processes
//! it launches can be signalled together with it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

use super::{BrowserRunner, RunJob, RunReport, RunnerError};
use crate::execution::{Browser, BrowserOptions, Framework, Language};

/// Prefix of the line the harness prints with its verdict.
const RESULT_PREFIX: &str = "__RUNWARDEN_RESULT__";

const SCREENSHOT_FILE: &str = "screenshot.png";

#[derive(Debug, Clone)]
pub struct NodeRunnerConfig {
    /// Path (or bare command name resolved via `$PATH`) to the node binary.
    pub node_path: String,
    /// Directory holding `node_modules` with playwright/puppeteer installed.
    pub module_path: Option<PathBuf>,
    pub headless: bool,
    /// Time the child gets after SIGTERM before it is killed.
    pub kill_grace: Duration,
    /// Per-stream cap on captured output.
    pub max_log_bytes: usize,
    /// Parent directory for per-attempt scratch dirs. System temp dir if unset.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for NodeRunnerConfig {
    fn default() -> Self {
        Self {
            node_path: "node".to_string(),
            module_path: None,
            headless: true,
            kill_grace: Duration::from_secs(5),
            max_log_bytes: 256 * 1024,
            scratch_dir: None,
        }
    }
}

pub struct NodeRunner {
    config: NodeRunnerConfig,
}

impl NodeRunner {
    pub fn new(config: NodeRunnerConfig) -> Self {
        Self { config }
    }

    fn scratch(&self) -> Result<tempfile::TempDir, RunnerError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("runwarden-");
        match &self.config.scratch_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(RunnerError::Workspace)?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        }
        .map_err(RunnerError::Workspace)
    }

    fn command(&self, job: &RunJob, dir: &Path) -> Command {
        let mut cmd = Command::new(&self.config.node_path);
        cmd.arg("harness.js")
            .current_dir(dir)
            .env("RUNWARDEN_BASE_URL", job.base_url.as_deref().unwrap_or(""))
            .env("RUNWARDEN_TIMEOUT_MS", job.deadline.as_millis().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if job.capture_screenshot {
            cmd.env("RUNWARDEN_SCREENSHOT", dir.join(SCREENSHOT_FILE));
        }
        if let Some(modules) = &self.config.module_path {
            cmd.env("NODE_PATH", modules.join("node_modules"));
        }
        cmd
    }
}

#[async_trait]
impl BrowserRunner for NodeRunner {
    fn name(&self) -> &'static str {
        "node"
    }

    fn supports(&self, framework: Framework, language: Language, browser: Browser) -> bool {
        match (framework, language) {
            (Framework::Playwright, Language::Javascript) => true,
            (Framework::Puppeteer, Language::Javascript) => browser != Browser::Webkit,
            _ => false,
        }
    }

    async fn run(&self, job: RunJob, cancel: CancellationToken) -> Result<RunReport, RunnerError> {
        let unsupported = || RunnerError::Unsupported {
            framework: job.framework,
            language: job.language,
            browser: job.browser.browser,
        };
        if !self.supports(job.framework, job.language, job.browser.browser) {
            return Err(unsupported());
        }

        // Dropping the TempDir removes the browser profile and artifacts.
        let scratch = self.scratch()?;
        let dir = scratch.path().to_path_buf();
        let harness = harness_script(job.framework, self.config.headless, &job.browser)
            .ok_or_else(unsupported)?;
        tokio::fs::write(dir.join("test.js"), job.source.as_bytes())
            .await
            .map_err(RunnerError::Workspace)?;
        tokio::fs::write(dir.join("harness.js"), harness)
            .await
            .map_err(RunnerError::Workspace)?;

        let mut child = self
            .command(&job, &dir)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: self.config.node_path.clone(),
                source,
            })?;
        let pid = child.id();
        let mut group = ProcessGroup::led_by(pid);
        let start = Instant::now();
        info!(
            execution_id = %job.execution_id,
            attempt = job.attempt,
            framework = %job.framework,
            browser = %job.browser.browser,
            pid,
            "browser harness started"
        );

        let max = self.config.max_log_bytes;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Backend("child stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::Backend("child stderr not captured".into()))?;
        let stdout_task = tokio::spawn(capture(stdout, max));
        let stderr_task = tokio::spawn(capture(stderr, max));

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                warn!(execution_id = %job.execution_id, attempt = job.attempt, pid, "cancelling browser harness");
                terminate(&mut child, &mut group, self.config.kill_grace).await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(RunnerError::Cancelled);
            }
        };
        // A browser left behind by the harness would keep the pipes open.
        group.kill_remaining();

        let out = stdout_task
            .await
            .map_err(|e| RunnerError::Backend(format!("stdout reader failed: {}", e)))?;
        let err = stderr_task
            .await
            .map_err(|e| RunnerError::Backend(format!("stderr reader failed: {}", e)))?;

        debug!(
            execution_id = %job.execution_id,
            attempt = job.attempt,
            exit_code = status.code(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "browser harness exited"
        );

        let logs = merge_logs(&out.text, &err.text);
        let mut report = match out.result.as_deref().and_then(parse_result) {
            Some(HarnessResult {
                status: HarnessStatus::Passed,
                ..
            }) => RunReport::success(logs),
            Some(HarnessResult {
                status: HarnessStatus::Failed,
                phase: Phase::Test,
                error,
            }) => RunReport::test_failure(logs, error.unwrap_or_else(|| "test failed".into())),
            Some(HarnessResult {
                status: HarnessStatus::Failed,
                phase: Phase::Setup,
                error,
            }) => RunReport::infra_failure(
                logs,
                format!(
                    "browser setup failed: {}",
                    error.unwrap_or_else(|| "unknown error".into())
                ),
            ),
            None => RunReport::infra_failure(
                logs,
                format!(
                    "harness exited with code {:?} without reporting a result",
                    status.code()
                ),
            ),
        };

        if job.capture_screenshot {
            match tokio::fs::read(dir.join(SCREENSHOT_FILE)).await {
                Ok(png) if !png.is_empty() => report = report.with_screenshot(Bytes::from(png)),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(error = %e, "failed to read screenshot"),
            }
        }

        Ok(report)
    }
}

/// SIGTERM the harness group, give it `grace` to exit, then SIGKILL whatever
/// is left of the group.
async fn terminate(child: &mut Child, group: &mut ProcessGroup, grace: Duration) {
    group.terminate();

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "harness exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for harness after SIGTERM");
        }
        Err(_) => {
            warn!("harness did not exit after SIGTERM, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL harness");
            }
        }
    }
    group.kill_remaining();
}

/// The process group the harness leads. Dropping it SIGKILLs the group, so an
/// aborted run still takes the browser down with it. After `kill_remaining`
/// the group is never signalled again, since its id may be reused.
struct ProcessGroup {
    #[cfg(unix)]
    pgid: Option<Pid>,
}

impl ProcessGroup {
    #[cfg(unix)]
    fn led_by(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.map(|p| Pid::from_raw(p as i32)),
        }
    }

    #[cfg(not(unix))]
    fn led_by(_pid: Option<u32>) -> Self {
        Self {}
    }

    fn terminate(&self) {
        #[cfg(unix)]
        self.signal(Signal::SIGTERM);
    }

    fn kill_remaining(&mut self) {
        #[cfg(unix)]
        {
            self.signal(Signal::SIGKILL);
            self.pgid = None;
        }
    }

    #[cfg(unix)]
    fn signal(&self, signal: Signal) {
        let Some(pgid) = self.pgid else { return };
        match killpg(pgid, signal) {
            Ok(()) => debug!(pgid = pgid.as_raw(), ?signal, "signalled harness process group"),
            // Group already empty.
            Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => warn!(
                pgid = pgid.as_raw(),
                ?signal,
                error = %e,
                "failed to signal harness process group"
            ),
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill_remaining();
    }
}

// ---------------------------------------------------------------------------
// Output capture
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Captured {
    text: String,
    result: Option<String>,
    truncated: bool,
}

impl Captured {
    fn push_line(&mut self, line: &str, max: usize) {
        if self.truncated {
            return;
        }
        if self.text.len() + line.len() + 1 > max {
            self.truncated = true;
            self.text.push_str("[output truncated]\n");
            return;
        }
        self.text.push_str(line);
        self.text.push('\n');
    }
}

/// Read a stream to EOF, keeping at most `max` bytes of text.  The result
/// line is pulled out separately so truncation never loses it.
async fn capture<R: AsyncRead + Unpin>(stream: R, max: usize) -> Captured {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut out = Captured::default();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                out.push_line(&format!("[read error: {}]", e), max);
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(&['\n', '\r'][..]);
        match line.strip_prefix(RESULT_PREFIX) {
            Some(rest) => out.result = Some(rest.to_string()),
            None => out.push_line(line, max),
        }
    }
    out
}

fn merge_logs(stdout: &str, stderr: &str) -> String {
    let mut logs = String::with_capacity(stdout.len() + stderr.len());
    logs.push_str(stdout);
    for line in stderr.lines() {
        logs.push_str("[stderr] ");
        logs.push_str(line);
        logs.push('\n');
    }
    logs
}

// ---------------------------------------------------------------------------
// Harness protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum HarnessStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Phase {
    Setup,
    #[default]
    Test,
}

#[derive(Debug, Deserialize)]
struct HarnessResult {
    status: HarnessStatus,
    #[serde(default)]
    phase: Phase,
    #[serde(default)]
    error: Option<String>,
}

fn parse_result(raw: &str) -> Option<HarnessResult> {
    serde_json::from_str(raw).ok()
}

const HARNESS_TEMPLATE: &str = r#"'use strict';
const fs = require('fs');
const path = require('path');

const RESULT = '__RESULT_PREFIX__';
const baseUrl = process.env.RUNWARDEN_BASE_URL || '';
const screenshotPath = process.env.RUNWARDEN_SCREENSHOT || '';
const timeoutMs = Number(process.env.RUNWARDEN_TIMEOUT_MS || '30000');
const AsyncFunction = Object.getPrototypeOf(async function () {}).constructor;

function report(result) {
  process.stdout.write(RESULT + JSON.stringify(result) + '\n');
}

async function snap(page) {
  if (!page || !screenshotPath) return;
  try {
    await page.screenshot({ path: screenshotPath, fullPage: true });
  } catch (e) {
    console.error('screenshot failed: ' + e);
  }
}

(async () => {
  let browser;
  let page;
  let phase = 'setup';
  try {
__LAUNCH__
    page.setDefaultTimeout(timeoutMs);
    page.on('console', (m) => console.log('[browser:' + m.type() + '] ' + m.text()));
    page.on('pageerror', (e) => console.log('[pageerror] ' + e));
    const body = fs.readFileSync(path.join(__dirname, 'test.js'), 'utf8');
    const test = new AsyncFunction('page', 'browser', 'baseUrl', body);
    phase = 'test';
    await test(page, browser, baseUrl);
    report({ status: 'passed' });
  } catch (err) {
    await snap(page);
    report({ status: 'failed', phase, error: String((err && err.stack) || err) });
  } finally {
    if (browser) await browser.close().catch(() => {});
  }
})();
"#;

const PLAYWRIGHT_LAUNCH: &str = r#"    const engine = require('playwright')['__BROWSER__'];
    browser = await engine.launch({ headless: __HEADLESS__ });
    const context = await browser.newContext(__CONTEXT__);
    page = await context.newPage();"#;

const PUPPETEER_LAUNCH: &str = r#"    const puppeteer = require('puppeteer');
    const opts = __CONTEXT__;
    browser = await puppeteer.launch({ headless: __HEADLESS__, browser: '__BROWSER__' });
    page = await browser.newPage();
    await page.setViewport(opts.viewport);
    if (opts.userAgent) await page.setUserAgent(opts.userAgent);"#;

/// Generate the harness for `framework` in the requested browser, or `None`
/// if there is no Node harness for that pair.
fn harness_script(framework: Framework, headless: bool, options: &BrowserOptions) -> Option<String> {
    let (launch, engine) = match (framework, options.browser) {
        (Framework::Playwright, browser) => (PLAYWRIGHT_LAUNCH, browser.as_str()),
        (Framework::Puppeteer, Browser::Chromium) => (PUPPETEER_LAUNCH, "chrome"),
        (Framework::Puppeteer, Browser::Firefox) => (PUPPETEER_LAUNCH, "firefox"),
        (Framework::Puppeteer, Browser::Webkit) | (Framework::Selenium, _) => return None,
    };
    let launch = launch
        .replace("__BROWSER__", engine)
        .replace("__HEADLESS__", if headless { "true" } else { "false" })
        .replace("__CONTEXT__", &context_options(options));
    Some(
        HARNESS_TEMPLATE
            .replace("__RESULT_PREFIX__", RESULT_PREFIX)
            .replace("__LAUNCH__", &launch),
    )
}

/// Viewport and user agent as a JS object literal.
fn context_options(options: &BrowserOptions) -> String {
    let mut ctx = serde_json::json!({
        "viewport": {
            "width": options.viewport.width,
            "height": options.viewport.height,
        }
    });
    if let Some(ua) = &options.user_agent {
        ctx["userAgent"] = serde_json::Value::String(ua.clone());
    }
    ctx.to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionId;

    #[test]
    fn test_supported_combinations() {
        use Browser::*;
        let runner = NodeRunner::new(NodeRunnerConfig::default());
        for browser in [Chromium, Firefox, Webkit] {
            assert!(runner.supports(Framework::Playwright, Language::Javascript, browser));
        }
        assert!(runner.supports(Framework::Puppeteer, Language::Javascript, Chromium));
        assert!(runner.supports(Framework::Puppeteer, Language::Javascript, Firefox));
        assert!(!runner.supports(Framework::Puppeteer, Language::Javascript, Webkit));
        assert!(!runner.supports(Framework::Playwright, Language::Python, Chromium));
        assert!(!runner.supports(Framework::Selenium, Language::Javascript, Chromium));
    }

    #[test]
    fn test_playwright_harness() {
        let script =
            harness_script(Framework::Playwright, true, &BrowserOptions::default()).unwrap();
        assert!(script.contains("require('playwright')['chromium']"));
        assert!(script.contains("headless: true"));
        assert!(script.contains(r#"newContext({"viewport":{"#));
        assert!(script.contains(r#""width":1280"#));
        assert!(script.contains(r#""height":720"#));
        assert!(!script.contains("userAgent"));
        assert!(script.contains(RESULT_PREFIX));
        assert!(!script.contains("__LAUNCH__"));
        assert!(!script.contains("__HEADLESS__"));
        assert!(!script.contains("__CONTEXT__"));
    }

    #[test]
    fn test_playwright_harness_with_browser_options() {
        let options = BrowserOptions {
            browser: Browser::Webkit,
            viewport: crate::execution::Viewport {
                width: 390,
                height: 844,
            },
            user_agent: Some("Mozilla/5.0 (iPhone) 'quoted'".into()),
        };
        let script = harness_script(Framework::Playwright, true, &options).unwrap();
        assert!(script.contains("require('playwright')['webkit']"));
        assert!(script.contains(r#""width":390"#));
        assert!(script.contains(r#""height":844"#));
        assert!(script.contains(r#""userAgent":"Mozilla/5.0 (iPhone) 'quoted'""#));
    }

    #[test]
    fn test_puppeteer_harness_headed() {
        let options = BrowserOptions {
            browser: Browser::Firefox,
            ..Default::default()
        };
        let script = harness_script(Framework::Puppeteer, false, &options).unwrap();
        assert!(script.contains("require('puppeteer')"));
        assert!(script.contains("headless: false, browser: 'firefox'"));
        assert!(script.contains("page.setViewport(opts.viewport)"));

        let webkit = BrowserOptions {
            browser: Browser::Webkit,
            ..Default::default()
        };
        assert!(harness_script(Framework::Puppeteer, true, &webkit).is_none());
        assert!(harness_script(Framework::Selenium, true, &BrowserOptions::default()).is_none());
    }

    #[test]
    fn test_parse_result_lines() {
        let passed = parse_result(r#"{"status":"passed"}"#).unwrap();
        assert_eq!(passed.status, HarnessStatus::Passed);

        let failed =
            parse_result(r#"{"status":"failed","phase":"test","error":"expected 1"}"#).unwrap();
        assert_eq!(failed.status, HarnessStatus::Failed);
        assert_eq!(failed.phase, Phase::Test);
        assert_eq!(failed.error.as_deref(), Some("expected 1"));

        let setup = parse_result(r#"{"status":"failed","phase":"setup"}"#).unwrap();
        assert_eq!(setup.phase, Phase::Setup);

        assert!(parse_result("not json").is_none());
        assert!(parse_result(r#"{"status":"flaky"}"#).is_none());
    }

    #[tokio::test]
    async fn test_capture_extracts_result_and_truncates() {
        let input: &[u8] = b"line one\n__RUNWARDEN_RESULT__{\"status\":\"passed\"}\nline two\n";
        let out = capture(input, 1024).await;
        assert_eq!(out.text, "line one\nline two\n");
        assert_eq!(out.result.as_deref(), Some(r#"{"status":"passed"}"#));

        let noisy = "x".repeat(40) + "\n" + &"y".repeat(40) + "\n";
        let out = capture(noisy.as_bytes(), 50).await;
        assert!(out.truncated);
        assert!(out.text.ends_with("[output truncated]\n"));
    }

    #[test]
    fn test_merge_logs_tags_stderr() {
        let logs = merge_logs("a\n", "warn\n");
        assert_eq!(logs, "a\n[stderr] warn\n");
    }

    #[tokio::test]
    async fn test_missing_node_binary_is_spawn_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = NodeRunner::new(NodeRunnerConfig {
            node_path: "/nonexistent/node-binary".into(),
            scratch_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        });
        let job = RunJob {
            execution_id: ExecutionId::new(),
            attempt: 1,
            source: "await page.goto(baseUrl);".into(),
            framework: Framework::Playwright,
            language: Language::Javascript,
            base_url: None,
            browser: BrowserOptions::default(),
            deadline: Duration::from_secs(1),
            capture_screenshot: false,
        };
        let err = runner.run(job, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }

    #[cfg(target_os = "linux")]
    mod process_group {
        use std::os::unix::fs::PermissionsExt;
        use std::sync::Arc;

        use super::*;

        /// Stand-in for node that backgrounds a long sleep, the way node leaves
        /// a browser running, and records the sleeper's pid.
        fn forking_node(dir: &Path) -> (PathBuf, PathBuf) {
            let pidfile = dir.join("grandchild.pid");
            let script = dir.join("fake-node.sh");
            std::fs::write(
                &script,
                format!(
                    "#!/bin/sh\nsleep 300 &\necho $! > '{}'\nwait\n",
                    pidfile.display()
                ),
            )
            .unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
            (script, pidfile)
        }

        fn runner(dir: &Path, script: &Path) -> NodeRunner {
            NodeRunner::new(NodeRunnerConfig {
                node_path: script.display().to_string(),
                scratch_dir: Some(dir.join("scratch")),
                kill_grace: Duration::from_millis(200),
                ..Default::default()
            })
        }

        fn job() -> RunJob {
            RunJob {
                execution_id: ExecutionId::new(),
                attempt: 1,
                source: "await new Promise(() => {});".into(),
                framework: Framework::Playwright,
                language: Language::Javascript,
                base_url: None,
                browser: BrowserOptions::default(),
                deadline: Duration::from_secs(30),
                capture_screenshot: false,
            }
        }

        async fn read_pid(pidfile: &Path) -> i32 {
            for _ in 0..300 {
                if let Ok(raw) = std::fs::read_to_string(pidfile) {
                    if let Ok(pid) = raw.trim().parse() {
                        return pid;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("fake node never wrote {}", pidfile.display());
        }

        /// No /proc entry, or a zombie waiting to be reaped.
        fn gone(pid: i32) -> bool {
            match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
                Err(_) => true,
                Ok(stat) => stat
                    .rsplit(')')
                    .next()
                    .map(|rest| rest.trim_start().starts_with('Z'))
                    .unwrap_or(false),
            }
        }

        async fn wait_gone(pid: i32) -> bool {
            for _ in 0..200 {
                if gone(pid) {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            false
        }

        #[tokio::test]
        async fn test_cancel_kills_grandchildren() {
            let dir = tempfile::TempDir::new().unwrap();
            let (script, pidfile) = forking_node(dir.path());
            let runner = runner(dir.path(), &script);

            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            let watcher = tokio::spawn(async move {
                let pid = read_pid(&pidfile).await;
                trigger.cancel();
                pid
            });

            let result = runner.run(job(), cancel).await;
            assert!(matches!(result, Err(RunnerError::Cancelled)));

            let grandchild = watcher.await.unwrap();
            assert!(
                wait_gone(grandchild).await,
                "grandchild {} survived cancellation",
                grandchild
            );
        }

        #[tokio::test]
        async fn test_aborted_run_kills_grandchildren() {
            let dir = tempfile::TempDir::new().unwrap();
            let (script, pidfile) = forking_node(dir.path());
            let runner = Arc::new(runner(dir.path(), &script));

            let handle = {
                let runner = runner.clone();
                tokio::spawn(async move { runner.run(job(), CancellationToken::new()).await })
            };
            let grandchild = read_pid(&pidfile).await;
            assert!(!gone(grandchild));

            handle.abort();
            assert!(handle.await.unwrap_err().is_cancelled());
            assert!(
                wait_gone(grandchild).await,
                "grandchild {} survived an aborted run",
                grandchild
            );
        }
    }
}
