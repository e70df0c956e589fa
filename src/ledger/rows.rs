//! Row mapping between SQLite and the execution model.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::execution::{
    ArtifactRefs, AttemptOutcome, AttemptRecord, BrowserOptions, Execution, ExecutionId,
    ExecutionStatus, FailureKind, Viewport,
};

use super::LedgerError;

pub(super) fn fmt_ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(super) fn parse_ts(s: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LedgerError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, LedgerError> {
    s.as_deref().map(parse_ts).transpose()
}

/// The columns every guarded write needs to check before touching a row.
pub(super) struct StatusRow {
    pub status: ExecutionStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
}

pub(super) fn status_row(
    conn: &Connection,
    id: ExecutionId,
) -> Result<Option<StatusRow>, LedgerError> {
    let raw = conn
        .query_row(
            "SELECT status, attempt_count, max_attempts, started_at FROM executions WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()?;

    match raw {
        None => Ok(None),
        Some((status, attempt_count, max_attempts, started_at)) => Ok(Some(StatusRow {
            status: status.parse().map_err(LedgerError::Corrupt)?,
            attempt_count,
            max_attempts,
            started_at: parse_opt_ts(started_at)?,
        })),
    }
}

struct ExecutionRow {
    test_id: String,
    framework: String,
    language: String,
    source: String,
    base_url: Option<String>,
    browser: String,
    viewport_width: u32,
    viewport_height: u32,
    user_agent: Option<String>,
    status: String,
    attempt_count: u32,
    max_attempts: u32,
    attempt_timeout_ms: i64,
    capture_screenshot: bool,
    logs: String,
    error: Option<String>,
    screenshot_url: Option<String>,
    log_url: Option<String>,
    duration_ms: Option<i64>,
    created_at: String,
    started_at: Option<String>,
    updated_at: String,
}

/// Load an execution with its attempts ordered by index.
///
/// Callers wanting a consistent snapshot run this inside a transaction.
pub(super) fn load_execution(
    conn: &Connection,
    id: ExecutionId,
) -> Result<Option<Execution>, LedgerError> {
    let row = conn
        .query_row(
            "SELECT test_id, framework, language, source, base_url, status, attempt_count,
                    max_attempts, attempt_timeout_ms, capture_screenshot, logs, error,
                    screenshot_url, log_url, duration_ms, created_at, started_at, updated_at,
                    browser, viewport_width, viewport_height, user_agent
             FROM executions WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok(ExecutionRow {
                    test_id: row.get(0)?,
                    framework: row.get(1)?,
                    language: row.get(2)?,
                    source: row.get(3)?,
                    base_url: row.get(4)?,
                    status: row.get(5)?,
                    attempt_count: row.get(6)?,
                    max_attempts: row.get(7)?,
                    attempt_timeout_ms: row.get(8)?,
                    capture_screenshot: row.get(9)?,
                    logs: row.get(10)?,
                    error: row.get(11)?,
                    screenshot_url: row.get(12)?,
                    log_url: row.get(13)?,
                    duration_ms: row.get(14)?,
                    created_at: row.get(15)?,
                    started_at: row.get(16)?,
                    updated_at: row.get(17)?,
                    browser: row.get(18)?,
                    viewport_width: row.get(19)?,
                    viewport_height: row.get(20)?,
                    user_agent: row.get(21)?,
                })
            },
        )
        .optional()?;

    let row = match row {
        Some(r) => r,
        None => return Ok(None),
    };

    Ok(Some(Execution {
        id,
        test_id: row.test_id,
        framework: row.framework.parse().map_err(LedgerError::Corrupt)?,
        language: row.language.parse().map_err(LedgerError::Corrupt)?,
        source: row.source,
        base_url: row.base_url,
        browser: BrowserOptions {
            browser: row.browser.parse().map_err(LedgerError::Corrupt)?,
            viewport: Viewport {
                width: row.viewport_width,
                height: row.viewport_height,
            },
            user_agent: row.user_agent,
        },
        status: row.status.parse().map_err(LedgerError::Corrupt)?,
        attempt_count: row.attempt_count,
        attempts: load_attempts(conn, id)?,
        logs: row.logs,
        error: row.error,
        artifacts: ArtifactRefs {
            screenshot_url: row.screenshot_url,
            log_url: row.log_url,
        },
        duration_ms: row.duration_ms.map(|d| d.max(0) as u64),
        max_attempts: row.max_attempts,
        attempt_timeout_ms: row.attempt_timeout_ms.max(0) as u64,
        capture_screenshot: row.capture_screenshot,
        created_at: parse_ts(&row.created_at)?,
        started_at: parse_opt_ts(row.started_at)?,
        updated_at: parse_ts(&row.updated_at)?,
    }))
}

fn load_attempts(conn: &Connection, id: ExecutionId) -> Result<Vec<AttemptRecord>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT attempt_index, started_at, ended_at, outcome, logs, error, screenshot_url,
                failure_kind
         FROM attempts WHERE execution_id = ?1 ORDER BY attempt_index ASC",
    )?;
    let rows = stmt.query_map(params![id.to_string()], |row| {
        Ok((
            row.get::<_, u32>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<String>>(7)?,
        ))
    })?;

    let mut attempts = Vec::new();
    for r in rows {
        let (index, started_at, ended_at, outcome, logs, error, screenshot_url, failure_kind) = r?;
        attempts.push(AttemptRecord {
            index,
            started_at: parse_ts(&started_at)?,
            ended_at: parse_opt_ts(ended_at)?,
            outcome: outcome
                .map(|o| o.parse::<AttemptOutcome>())
                .transpose()
                .map_err(LedgerError::Corrupt)?,
            failure_kind: failure_kind
                .map(|k| k.parse::<FailureKind>())
                .transpose()
                .map_err(LedgerError::Corrupt)?,
            logs,
            error,
            screenshot_url,
        });
    }
    Ok(attempts)
}
