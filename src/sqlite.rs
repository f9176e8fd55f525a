use crate::error::{FaultError, Result};
use crate::faults::Fault;
use crate::messages::TestOutcome;
use crate::runner::TestDurations;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

fn coverage_hash(outcome: &TestOutcome) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_string(&outcome.coverage)?.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

fn createdb(connection: &Connection) -> Result<()> {
    info!("SQLite: new db detected, creating tables");

    connection.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        -- Runs
        CREATE TABLE IF NOT EXISTS runs (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            formula         TEXT NOT NULL,
            exit_code       INTEGER NOT NULL,
            created_at      TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            tool_version    TEXT
        );

        -- Tests
        CREATE TABLE IF NOT EXISTS tests (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id          INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
            test_key        TEXT NOT NULL,
            title           TEXT NOT NULL,
            file            TEXT NOT NULL,
            passed          INTEGER NOT NULL,
            duration_ms     REAL NOT NULL,
            stack           TEXT,
            coverage_hash   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tests_run ON tests(run_id);
        CREATE INDEX IF NOT EXISTS idx_tests_key ON tests(test_key);
        CREATE INDEX IF NOT EXISTS idx_tests_file ON tests(file);

        -- Faults
        CREATE TABLE IF NOT EXISTS faults (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id          INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
            rank            INTEGER NOT NULL,
            source_path     TEXT NOT NULL,
            start_line      INTEGER NOT NULL,
            start_column    INTEGER NOT NULL,
            end_line        INTEGER NOT NULL,
            end_column      INTEGER NOT NULL,
            score           REAL
        );

        CREATE INDEX IF NOT EXISTS idx_faults_run_rank ON faults(run_id, rank);
        ",
    )?;
    Ok(())
}

fn check_schema(connection: &Connection) -> Result<()> {
    debug!("SQLite: checking schema integrity");

    let table_columns: Vec<(&str, Vec<&str>)> = vec![
        ("runs", vec!["id", "formula", "exit_code", "created_at", "tool_version"]),
        (
            "tests",
            vec![
                "id",
                "run_id",
                "test_key",
                "title",
                "file",
                "passed",
                "duration_ms",
                "stack",
                "coverage_hash",
            ],
        ),
        (
            "faults",
            vec![
                "id",
                "run_id",
                "rank",
                "source_path",
                "start_line",
                "start_column",
                "end_line",
                "end_column",
                "score",
            ],
        ),
    ];

    for (table, columns) in table_columns {
        let mut stmt = connection.prepare(&format!("PRAGMA table_xinfo({});", table))?;
        let column_names: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|name| name.ok())
            .collect();

        if column_names.is_empty() {
            return Err(FaultError::InvalidInput(format!("Missing table: {}", table)));
        }
        for col in columns {
            if !column_names.iter().any(|name| name == col) {
                return Err(FaultError::InvalidInput(format!(
                    "Missing column '{}' in table '{}'",
                    col, table
                )));
            }
        }
    }
    Ok(())
}

/// Creates the database on first use, otherwise verifies its schema.
pub fn check_db(db_path: &Path) -> Result<()> {
    if db_path.as_os_str().is_empty() {
        return Err(FaultError::MissingDbPath);
    }
    let is_new_db = !db_path.exists();
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let connection = Connection::open(db_path)?;
    if is_new_db {
        createdb(&connection)
    } else {
        check_schema(&connection)
    }
}

pub fn store_run(db_path: &Path, formula: &str, exit_code: i32) -> Result<i64> {
    info!("SQLite: storing current run on {}", db_path.display());
    let connection = Connection::open(db_path)?;
    let tool_version = format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    connection.execute(
        "INSERT INTO runs (formula, exit_code, tool_version) VALUES (?1, ?2, ?3);",
        params![formula, exit_code, tool_version],
    )?;
    Ok(connection.last_insert_rowid())
}

pub fn store_outcomes(db_path: &Path, run_id: i64, outcomes: &[TestOutcome]) -> Result<()> {
    let mut connection = Connection::open(db_path)?;
    let tx = connection.transaction()?;
    for outcome in outcomes {
        tx.execute(
            "INSERT INTO tests (run_id, test_key, title, file, passed, duration_ms, stack, coverage_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            params![
                run_id,
                outcome.key,
                outcome.title_path.join(" > "),
                outcome.file,
                outcome.passed,
                outcome.duration_ms,
                outcome.stack,
                coverage_hash(outcome)?,
            ],
        )?;
    }
    tx.commit()?;
    debug!("SQLite: stored {} test outcomes for run {}", outcomes.len(), run_id);
    Ok(())
}

/// `faults` are expected in ranked order.
pub fn store_faults(db_path: &Path, run_id: i64, faults: &[Fault]) -> Result<()> {
    let mut connection = Connection::open(db_path)?;
    let tx = connection.transaction()?;
    for (rank, fault) in faults.iter().enumerate() {
        tx.execute(
            "INSERT INTO faults (run_id, rank, source_path, start_line, start_column, end_line, end_column, score)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            params![
                run_id,
                rank as i64 + 1,
                fault.source_path,
                fault.location.start.line,
                fault.location.start.column,
                fault.location.end.line,
                fault.location.end.column,
                fault.score,
            ],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// Mean time each test file took per run, across every stored run.
pub fn load_test_durations(db_path: &Path) -> Result<TestDurations> {
    let connection = Connection::open(db_path)?;
    let mut stmt = connection.prepare(
        "SELECT file, AVG(total) FROM (
            SELECT run_id, file, SUM(duration_ms) AS total FROM tests GROUP BY run_id, file
         ) GROUP BY file;",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?;

    let mut durations = TestDurations::new();
    for row in rows {
        let (file, duration) = row?;
        durations.insert(file, duration);
    }
    Ok(durations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::ExpressionSpan;
    use crate::evidence::tests::outcome;
    use tempfile::TempDir;

    fn timed(name: &str, file: &str, duration_ms: f64) -> TestOutcome {
        let mut result = outcome(name, true, &[("src/a.js", &[1])]);
        result.file = file.to_string();
        result.duration_ms = duration_ms;
        result
    }

    #[test]
    fn test_check_db_creates_then_verifies() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("db/history.db");
        check_db(&db_path).unwrap();
        assert!(db_path.exists());
        check_db(&db_path).unwrap();
    }

    #[test]
    fn test_check_db_rejects_foreign_schema() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("other.db");
        Connection::open(&db_path)
            .unwrap()
            .execute_batch("CREATE TABLE runs (id INTEGER PRIMARY KEY);")
            .unwrap();
        assert!(matches!(
            check_db(&db_path),
            Err(FaultError::InvalidInput(_))
        ));
        assert!(matches!(check_db(Path::new("")), Err(FaultError::MissingDbPath)));
    }

    #[test]
    fn test_store_and_load_history() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("history.db");
        check_db(&db_path).unwrap();

        let first = store_run(&db_path, "dstar", 1).unwrap();
        store_outcomes(
            &db_path,
            first,
            &[
                timed("a", "test/a.test.js", 10.0),
                timed("b", "test/a.test.js", 20.0),
                timed("c", "test/c.test.js", 5.0),
            ],
        )
        .unwrap();
        let second = store_run(&db_path, "dstar", 0).unwrap();
        assert!(second > first);
        store_outcomes(&db_path, second, &[timed("a", "test/a.test.js", 50.0)]).unwrap();

        let durations = load_test_durations(&db_path).unwrap();
        assert_eq!(durations["test/a.test.js"], 40.0);
        assert_eq!(durations["test/c.test.js"], 5.0);

        let faults = vec![
            Fault::new("src/a.js", ExpressionSpan::new((1, 0), (1, 4)), Some(2.0)),
            Fault::new("src/a.js", ExpressionSpan::new((2, 0), (2, 4)), None),
        ];
        store_faults(&db_path, second, &faults).unwrap();

        let connection = Connection::open(&db_path).unwrap();
        let (rank, score): (i64, Option<f64>) = connection
            .query_row(
                "SELECT rank, score FROM faults WHERE run_id = ?1 AND start_line = 2;",
                params![second],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!((rank, score), (2, None));
    }
}
