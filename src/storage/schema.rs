//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS executions (
            id TEXT PRIMARY KEY,
            test_id TEXT NOT NULL,
            framework TEXT NOT NULL,
            language TEXT NOT NULL,
            source TEXT NOT NULL,
            base_url TEXT,
            browser TEXT NOT NULL DEFAULT 'chromium',
            viewport_width INTEGER NOT NULL DEFAULT 1280,
            viewport_height INTEGER NOT NULL DEFAULT 720,
            user_agent TEXT,
            status TEXT NOT NULL CHECK (status IN ('pending', 'running', 'completed', 'failed')),
            attempt_count INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            attempt_timeout_ms INTEGER NOT NULL,
            capture_screenshot INTEGER NOT NULL DEFAULT 1,
            logs TEXT NOT NULL DEFAULT '',
            error TEXT,
            screenshot_url TEXT,
            log_url TEXT,
            duration_ms INTEGER,
            created_at TEXT NOT NULL,
            started_at TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS attempts (
            execution_id TEXT NOT NULL,
            attempt_index INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            outcome TEXT CHECK (outcome IS NULL OR outcome IN ('success', 'failure', 'timeout')),
            logs TEXT NOT NULL DEFAULT '',
            error TEXT,
            failure_kind TEXT CHECK (failure_kind IS NULL OR failure_kind IN ('test', 'infra')),
            screenshot_url TEXT,
            PRIMARY KEY (execution_id, attempt_index),
            FOREIGN KEY (execution_id) REFERENCES executions(id)
        );

        CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
        CREATE INDEX IF NOT EXISTS idx_executions_created ON executions(created_at);
        CREATE INDEX IF NOT EXISTS idx_executions_test ON executions(test_id);",
    )?;

    // Migration: columns added after version 1
    add_column_if_missing(
        conn,
        "attempts",
        "failure_kind",
        "TEXT CHECK (failure_kind IS NULL OR failure_kind IN ('test', 'infra'))",
    )?;
    add_column_if_missing(conn, "executions", "browser", "TEXT NOT NULL DEFAULT 'chromium'")?;
    add_column_if_missing(conn, "executions", "viewport_width", "INTEGER NOT NULL DEFAULT 1280")?;
    add_column_if_missing(conn, "executions", "viewport_height", "INTEGER NOT NULL DEFAULT 720")?;
    add_column_if_missing(conn, "executions", "user_agent", "TEXT")?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

pub const SCHEMA_VERSION: i64 = 2;

fn add_column_if_missing(conn: &Connection, table: &str, column: &str, def: &str) -> Result<()> {
    let present: i64 = conn
        .query_row(
            &format!(
                "SELECT count(*) FROM pragma_table_info('{}') WHERE name = ?1",
                table
            ),
            [column],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if present == 0 {
        conn.execute(
            &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, def),
            [],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        // Verify tables exist by querying them
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM executions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM attempts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error

        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[test]
    fn test_migrate_upgrades_version_one_tables() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            INSERT INTO schema_version (version) VALUES (1);
            CREATE TABLE executions (
                id TEXT PRIMARY KEY,
                test_id TEXT NOT NULL,
                framework TEXT NOT NULL,
                language TEXT NOT NULL,
                source TEXT NOT NULL,
                base_url TEXT,
                status TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                attempt_timeout_ms INTEGER NOT NULL,
                capture_screenshot INTEGER NOT NULL DEFAULT 1,
                logs TEXT NOT NULL DEFAULT '',
                error TEXT,
                screenshot_url TEXT,
                log_url TEXT,
                duration_ms INTEGER,
                created_at TEXT NOT NULL,
                started_at TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE attempts (
                execution_id TEXT NOT NULL,
                attempt_index INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                outcome TEXT,
                logs TEXT NOT NULL DEFAULT '',
                error TEXT,
                screenshot_url TEXT,
                PRIMARY KEY (execution_id, attempt_index)
            );
            INSERT INTO executions (id, test_id, framework, language, source, status,
                max_attempts, attempt_timeout_ms, created_at, updated_at)
            VALUES ('old', 't', 'playwright', 'javascript', 's', 'pending', 3, 1000, 'now', 'now');",
        )
        .unwrap();

        migrate(&conn).unwrap();

        let (browser, width, height): (String, i64, i64) = conn
            .query_row(
                "SELECT browser, viewport_width, viewport_height FROM executions WHERE id = 'old'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!((browser.as_str(), width, height), ("chromium", 1280, 720));

        let kinds: i64 = conn
            .query_row(
                "SELECT count(*) FROM pragma_table_info('attempts') WHERE name = 'failure_kind'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(kinds, 1);

        let latest: i64 = conn
            .query_row("SELECT max(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(latest, SCHEMA_VERSION);
    }

    #[test]
    fn test_status_check_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let res = conn.execute(
            "INSERT INTO executions (id, test_id, framework, language, source, status,
                max_attempts, attempt_timeout_ms, created_at, updated_at)
             VALUES ('x', 't', 'playwright', 'javascript', 's', 'queued', 3, 1000, 'now', 'now')",
            [],
        );
        assert!(res.is_err());
    }
}
