use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use runwarden::execution::{BrowserOptions, ExecutionId, Framework, Language};
use runwarden::runner::{BrowserRunner, NodeRunner, NodeRunnerConfig, RunJob, RunOutcome};

// Live browser tests. They need node plus playwright installed; point
// RUNWARDEN_NODE_MODULES at the directory holding node_modules.
// Run with `cargo test --test live_browser -- --ignored`.

fn runner() -> NodeRunner {
    NodeRunner::new(NodeRunnerConfig {
        module_path: std::env::var_os("RUNWARDEN_NODE_MODULES").map(Into::into),
        ..Default::default()
    })
}

fn job(source: &str, deadline: Duration) -> RunJob {
    RunJob {
        execution_id: ExecutionId::new(),
        attempt: 1,
        source: source.into(),
        framework: Framework::Playwright,
        language: Language::Javascript,
        base_url: None,
        browser: BrowserOptions::default(),
        deadline,
        capture_screenshot: true,
    }
}

#[tokio::test]
#[ignore]
async fn test_playwright_pass_live() -> Result<()> {
    let source = "await page.setContent('<h1 id=\"t\">hello</h1>');\n\
                  const text = await page.textContent('#t');\n\
                  if (text !== 'hello') throw new Error('unexpected text ' + text);";
    let report = runner()
        .run(job(source, Duration::from_secs(60)), CancellationToken::new())
        .await
        .context("runner failed")?;
    println!("{}", report.logs);
    assert_eq!(report.outcome, RunOutcome::Success, "{:?}", report.error);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_playwright_assertion_failure_live() -> Result<()> {
    let source = "await page.setContent('<p>nothing here</p>');\n\
                  throw new Error('expected heading');";
    let report = runner()
        .run(job(source, Duration::from_secs(60)), CancellationToken::new())
        .await
        .context("runner failed")?;
    assert_eq!(report.outcome, RunOutcome::TestFailure);
    assert!(report.error.unwrap_or_default().contains("expected heading"));
    assert!(report.screenshot.is_some(), "failure should carry a screenshot");
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_cancel_kills_browser_live() -> Result<()> {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        trigger.cancel();
    });
    let started = std::time::Instant::now();
    let result = runner()
        .run(
            job("await new Promise(() => {});", Duration::from_secs(60)),
            cancel,
        )
        .await;
    assert!(result.is_err(), "cancelled run must not report an outcome");
    assert!(started.elapsed() < Duration::from_secs(15));
    Ok(())
}
