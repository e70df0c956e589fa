//! Execution ledger -- the single source of truth for execution state.
//!
//! Every mutation runs inside an `IMMEDIATE` SQLite transaction, so writes to
//! one execution are linearized even when the orchestrator task, the watchdog
//! and a cancel request race.  Writes that arrive after an execution reached a
//! terminal state, duplicate seals and duplicate finalizes are reported as
//! [`WriteOutcome::NoOp`] rather than errors.

mod rows;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::execution::{
    AttemptOutcome, Execution, ExecutionId, ExecutionStatus, Finalization, SealedAttempt,
};
use crate::storage::Pool;

use self::rows::{fmt_ts, load_execution, parse_ts, status_row};

// ---------------------------------------------------------------------------
// Errors and write outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("execution {0} not found")]
    NotFound(ExecutionId),

    #[error("attempt {index} of execution {id} not found")]
    AttemptNotFound { id: ExecutionId, index: u32 },

    #[error("execution {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("execution {id} still has attempt {index} in flight")]
    AttemptInFlight { id: ExecutionId, index: u32 },

    #[error("execution {id} has used all {max} attempts")]
    AttemptsExhausted { id: ExecutionId, max: u32 },

    #[error("corrupt ledger row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("ledger task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result of a guarded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome<T = ()> {
    /// The write changed the ledger.
    Applied(T),
    /// The write was a duplicate or arrived after a terminal state.
    NoOp,
}

impl<T> WriteOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied(_))
    }
}

/// Compact listing row.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub id: ExecutionId,
    pub test_id: String,
    pub status: ExecutionStatus,
    pub attempt_count: u32,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// SQLite-backed execution ledger.
#[derive(Clone)]
pub struct Ledger {
    pool: Pool,
}

impl Ledger {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Run `f` on a pooled connection off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, LedgerError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut *conn)
        })
        .await?
    }

    /// Persist a new `pending` execution.
    pub async fn create(&self, execution: &Execution) -> Result<(), LedgerError> {
        let exec = execution.clone();
        self.with_conn(move |conn| create_tx(conn, &exec)).await
    }

    /// Consistent snapshot of an execution and its attempts.
    pub async fn get(&self, id: ExecutionId) -> Result<Option<Execution>, LedgerError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let exec = load_execution(&tx, id)?;
            tx.commit()?;
            Ok(exec)
        })
        .await
    }

    /// Move `pending -> running`. Returns the start time when applied.
    pub async fn start(
        &self,
        id: ExecutionId,
    ) -> Result<WriteOutcome<DateTime<Utc>>, LedgerError> {
        self.with_conn(move |conn| start_tx(conn, id, Utc::now())).await
    }

    /// Open the next attempt. Returns its 1-based index when applied.
    pub async fn append_attempt(
        &self,
        id: ExecutionId,
        started_at: DateTime<Utc>,
    ) -> Result<WriteOutcome<u32>, LedgerError> {
        self.with_conn(move |conn| append_attempt_tx(conn, id, started_at))
            .await
    }

    /// Seal an open attempt. Sealing twice is a no-op.
    pub async fn seal_attempt(
        &self,
        id: ExecutionId,
        index: u32,
        sealed: SealedAttempt,
    ) -> Result<WriteOutcome, LedgerError> {
        self.with_conn(move |conn| seal_attempt_tx(conn, id, index, &sealed))
            .await
    }

    /// Write the terminal state. Finalizing twice is a no-op.
    pub async fn finalize(
        &self,
        id: ExecutionId,
        fin: Finalization,
    ) -> Result<WriteOutcome, LedgerError> {
        self.with_conn(move |conn| finalize_tx(conn, id, &fin)).await
    }

    /// Seal any open attempt with `outcome` and finalize as `failed`, in one
    /// transaction.  Used by the watchdog, recovery, and cancellation when no
    /// orchestrator task owns the execution.
    pub async fn force_fail(
        &self,
        id: ExecutionId,
        outcome: AttemptOutcome,
        error: String,
    ) -> Result<WriteOutcome, LedgerError> {
        self.with_conn(move |conn| force_fail_tx(conn, id, outcome, &error, Utc::now()))
            .await
    }

    /// IDs of every execution currently in `status`, oldest first.
    pub async fn list_by_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<ExecutionId>, LedgerError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT id FROM executions WHERE status = ?1 ORDER BY created_at ASC")?;
            let rows = stmt.query_map(params![status.as_str()], |row| row.get::<_, String>(0))?;

            let mut ids = Vec::new();
            for r in rows {
                let raw = r?;
                let id = raw
                    .parse()
                    .map_err(|_| LedgerError::Corrupt(format!("bad execution id '{}'", raw)))?;
                ids.push(id);
            }
            Ok(ids)
        })
        .await
    }

    /// Most recent executions, optionally filtered by status.
    pub async fn list_recent(
        &self,
        limit: usize,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<ExecutionSummary>, LedgerError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, test_id, status, attempt_count, duration_ms, created_at
                 FROM executions
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(
                params![status.map(|s| s.as_str()), limit as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )?;

            let mut list = Vec::new();
            for r in rows {
                let (id, test_id, status, attempts, duration, created) = r?;
                list.push(ExecutionSummary {
                    id: id
                        .parse()
                        .map_err(|_| LedgerError::Corrupt(format!("bad execution id '{}'", id)))?,
                    test_id,
                    status: status.parse().map_err(LedgerError::Corrupt)?,
                    attempt_count: attempts as u32,
                    duration_ms: duration.map(|d| d as u64),
                    created_at: parse_ts(&created)?,
                });
            }
            Ok(list)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

fn create_tx(conn: &mut Connection, exec: &Execution) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO executions (id, test_id, framework, language, source, base_url, browser,
            viewport_width, viewport_height, user_agent, status, attempt_count, max_attempts,
            attempt_timeout_ms, capture_screenshot, logs, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'pending', 0, ?11, ?12, ?13, '', ?14, ?15)",
        params![
            exec.id.to_string(),
            exec.test_id,
            exec.framework.as_str(),
            exec.language.as_str(),
            exec.source,
            exec.base_url,
            exec.browser.browser.as_str(),
            exec.browser.viewport.width,
            exec.browser.viewport.height,
            exec.browser.user_agent,
            exec.max_attempts,
            exec.attempt_timeout_ms as i64,
            exec.capture_screenshot,
            fmt_ts(&exec.created_at),
            fmt_ts(&exec.updated_at),
        ],
    )?;
    debug!(execution_id = %exec.id, test_id = %exec.test_id, "execution recorded");
    Ok(())
}

fn start_tx(
    conn: &mut Connection,
    id: ExecutionId,
    now: DateTime<Utc>,
) -> Result<WriteOutcome<DateTime<Utc>>, LedgerError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let row = status_row(&tx, id)?.ok_or(LedgerError::NotFound(id))?;

    if row.status != ExecutionStatus::Pending {
        return Ok(WriteOutcome::NoOp);
    }

    let stamp = fmt_ts(&now);
    tx.execute(
        "UPDATE executions SET status = 'running', started_at = ?2, updated_at = ?2
         WHERE id = ?1 AND status = 'pending'",
        params![id.to_string(), stamp],
    )?;
    tx.commit()?;
    Ok(WriteOutcome::Applied(now))
}

fn append_attempt_tx(
    conn: &mut Connection,
    id: ExecutionId,
    started_at: DateTime<Utc>,
) -> Result<WriteOutcome<u32>, LedgerError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let row = status_row(&tx, id)?.ok_or(LedgerError::NotFound(id))?;

    match row.status {
        s if s.is_terminal() => return Ok(WriteOutcome::NoOp),
        ExecutionStatus::Pending => {
            return Err(LedgerError::InvalidTransition {
                id,
                from: ExecutionStatus::Pending,
                to: ExecutionStatus::Running,
            })
        }
        _ => {}
    }

    if let Some(index) = open_attempt_index(&tx, id)? {
        return Err(LedgerError::AttemptInFlight { id, index });
    }
    if row.attempt_count >= row.max_attempts {
        return Err(LedgerError::AttemptsExhausted {
            id,
            max: row.max_attempts,
        });
    }

    let index = row.attempt_count + 1;
    let stamp = fmt_ts(&started_at);
    tx.execute(
        "INSERT INTO attempts (execution_id, attempt_index, started_at) VALUES (?1, ?2, ?3)",
        params![id.to_string(), index, stamp],
    )?;
    tx.execute(
        "UPDATE executions SET attempt_count = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), index, fmt_ts(&Utc::now())],
    )?;
    tx.commit()?;
    Ok(WriteOutcome::Applied(index))
}

fn seal_attempt_tx(
    conn: &mut Connection,
    id: ExecutionId,
    index: u32,
    sealed: &SealedAttempt,
) -> Result<WriteOutcome, LedgerError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let row = status_row(&tx, id)?.ok_or(LedgerError::NotFound(id))?;
    if row.status.is_terminal() {
        return Ok(WriteOutcome::NoOp);
    }

    let applied = seal_open_attempt(&tx, id, index, sealed)?;
    if !applied {
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM attempts WHERE execution_id = ?1 AND attempt_index = ?2",
                params![id.to_string(), index],
                |r| r.get(0),
            )
            .optional()?;
        return match exists {
            Some(_) => Ok(WriteOutcome::NoOp),
            None => Err(LedgerError::AttemptNotFound { id, index }),
        };
    }

    tx.commit()?;
    Ok(WriteOutcome::Applied(()))
}

fn finalize_tx(
    conn: &mut Connection,
    id: ExecutionId,
    fin: &Finalization,
) -> Result<WriteOutcome, LedgerError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let row = status_row(&tx, id)?.ok_or(LedgerError::NotFound(id))?;

    if row.status.is_terminal() {
        return Ok(WriteOutcome::NoOp);
    }
    if !row.status.can_transition_to(fin.status) {
        return Err(LedgerError::InvalidTransition {
            id,
            from: row.status,
            to: fin.status,
        });
    }
    if let Some(index) = open_attempt_index(&tx, id)? {
        return Err(LedgerError::AttemptInFlight { id, index });
    }

    write_terminal(&tx, id, fin, Utc::now())?;
    tx.commit()?;
    Ok(WriteOutcome::Applied(()))
}

fn force_fail_tx(
    conn: &mut Connection,
    id: ExecutionId,
    outcome: AttemptOutcome,
    error: &str,
    now: DateTime<Utc>,
) -> Result<WriteOutcome, LedgerError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let row = status_row(&tx, id)?.ok_or(LedgerError::NotFound(id))?;
    if row.status.is_terminal() {
        return Ok(WriteOutcome::NoOp);
    }

    let started_at = match row.started_at {
        Some(t) => t,
        None => {
            tx.execute(
                "UPDATE executions SET status = 'running', started_at = ?2, updated_at = ?2
                 WHERE id = ?1",
                params![id.to_string(), fmt_ts(&now)],
            )?;
            now
        }
    };

    if let Some(index) = open_attempt_index(&tx, id)? {
        let sealed = SealedAttempt {
            ended_at: now,
            outcome,
            failure_kind: None,
            logs: String::new(),
            error: Some(error.to_string()),
            screenshot_url: None,
        };
        seal_open_attempt(&tx, id, index, &sealed)?;
    }

    let duration_ms = (now - started_at).num_milliseconds().max(0) as u64;
    let fin = Finalization {
        status: ExecutionStatus::Failed,
        error: Some(error.to_string()),
        artifacts: Default::default(),
        duration_ms: Some(duration_ms),
    };
    write_terminal(&tx, id, &fin, now)?;
    tx.commit()?;
    Ok(WriteOutcome::Applied(()))
}

// ---------------------------------------------------------------------------
// Shared statements
// ---------------------------------------------------------------------------

fn open_attempt_index(conn: &Connection, id: ExecutionId) -> Result<Option<u32>, LedgerError> {
    let index = conn
        .query_row(
            "SELECT attempt_index FROM attempts
             WHERE execution_id = ?1 AND ended_at IS NULL
             ORDER BY attempt_index DESC LIMIT 1",
            params![id.to_string()],
            |r| r.get::<_, u32>(0),
        )
        .optional()?;
    Ok(index)
}

/// Seal attempt `index` if it is still open and append its logs to the
/// execution.  Returns whether a row was sealed.
fn seal_open_attempt(
    conn: &Connection,
    id: ExecutionId,
    index: u32,
    sealed: &SealedAttempt,
) -> Result<bool, LedgerError> {
    let changed = conn.execute(
        "UPDATE attempts SET ended_at = ?3, outcome = ?4, logs = ?5, error = ?6,
            screenshot_url = ?7, failure_kind = ?8
         WHERE execution_id = ?1 AND attempt_index = ?2 AND ended_at IS NULL",
        params![
            id.to_string(),
            index,
            fmt_ts(&sealed.ended_at),
            sealed.outcome.as_str(),
            sealed.logs,
            sealed.error,
            sealed.screenshot_url,
            sealed.failure_kind.map(|k| k.as_str()),
        ],
    )?;
    if changed == 0 {
        return Ok(false);
    }

    conn.execute(
        "UPDATE executions SET logs = logs || ?2, updated_at = ?3 WHERE id = ?1",
        params![
            id.to_string(),
            attempt_log_block(index, sealed),
            fmt_ts(&Utc::now())
        ],
    )?;
    Ok(true)
}

fn write_terminal(
    conn: &Connection,
    id: ExecutionId,
    fin: &Finalization,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    conn.execute(
        "UPDATE executions
         SET status = ?2, error = ?3, screenshot_url = ?4, log_url = ?5, duration_ms = ?6,
             updated_at = ?7
         WHERE id = ?1 AND status NOT IN ('completed', 'failed')",
        params![
            id.to_string(),
            fin.status.as_str(),
            fin.error,
            fin.artifacts.screenshot_url,
            fin.artifacts.log_url,
            fin.duration_ms.map(|d| d as i64),
            fmt_ts(&now),
        ],
    )?;
    Ok(())
}

/// Header plus body appended to the execution log when an attempt is sealed.
pub fn attempt_log_block(index: u32, sealed: &SealedAttempt) -> String {
    let mut block = format!("=== attempt {} ({}) ===\n", index, sealed.outcome);
    if !sealed.logs.is_empty() {
        block.push_str(&sealed.logs);
        if !sealed.logs.ends_with('\n') {
            block.push('\n');
        }
    }
    if let Some(err) = &sealed.error {
        block.push_str("error: ");
        block.push_str(err);
        block.push('\n');
    }
    block
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
