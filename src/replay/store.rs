//! SQLite-backed replay store.
//!
//! Owns the replay bookkeeping tables (`replay_tests`,
//! `replay_test_snapshots`, `replay_test_results`) and the domain tables the
//! engine rolls back (`signals`, `predictors`, `predictions`,
//! `analyst_assessments`, `ground_truth`).
//!
//! Every privileged primitive the engine depends on (locate, capture,
//! rollback, restore, cleanup) executes inside a single transaction, and
//! stage-advancing primitives update the test's status in that same
//! transaction, guarded by the expected current status. A crash mid-stage
//! therefore never leaves status and data disagreeing.
//!
//! Captured row payloads are schema-agnostic JSON maps read column-by-column
//! from the live table and reinserted verbatim on restore.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{AnalystAssessment, Direction, GroundTruth, Prediction, PredictorRecord, SignalRecord};
use crate::replay::error::{ReplayError, Result};
use crate::replay::lifecycle::ReplayStatus;
use crate::replay::locator::{AffectedRecordSet, AffectedTable, RollbackDepth};
use crate::replay::types::{ReplayConfig, ReplayTest, ReplayTestResult, ReplayTestSnapshot};
use crate::replay::aggregator::ReplaySummaryStats;

const SCHEMA_VERSION: u32 = 1;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS replay_tests (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    rollback_depth TEXT NOT NULL,
    rollback_to TEXT NOT NULL,
    universe_id TEXT NOT NULL,
    target_ids_json TEXT,
    config_json TEXT NOT NULL,
    status TEXT NOT NULL,
    results_json TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_replay_tests_org
    ON replay_tests(org_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_replay_tests_universe_status
    ON replay_tests(universe_id, status);

CREATE TABLE IF NOT EXISTS replay_test_snapshots (
    id TEXT PRIMARY KEY,
    test_id TEXT NOT NULL,
    table_name TEXT NOT NULL,
    rows_json TEXT NOT NULL,
    record_ids_json TEXT NOT NULL,
    row_count INTEGER NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_replay_snapshots_test
    ON replay_test_snapshots(test_id);

CREATE TABLE IF NOT EXISTS replay_test_results (
    id TEXT PRIMARY KEY,
    test_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    status TEXT NOT NULL,
    direction_match INTEGER NOT NULL,
    payload_json TEXT NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_replay_results_test
    ON replay_test_results(test_id);

-- Domain tables the rollback operates on.

CREATE TABLE IF NOT EXISTS signals (
    id TEXT PRIMARY KEY,
    target_id TEXT NOT NULL,
    universe_id TEXT NOT NULL,
    signal_type TEXT NOT NULL,
    strength REAL NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_signals_universe_created
    ON signals(universe_id, created_at);

CREATE TABLE IF NOT EXISTS predictors (
    id TEXT PRIMARY KEY,
    target_id TEXT NOT NULL,
    universe_id TEXT NOT NULL,
    name TEXT NOT NULL,
    score REAL NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_predictors_universe_created
    ON predictors(universe_id, created_at);

CREATE TABLE IF NOT EXISTS predictions (
    id TEXT PRIMARY KEY,
    target_id TEXT NOT NULL,
    universe_id TEXT NOT NULL,
    direction TEXT NOT NULL,
    confidence REAL NOT NULL,
    magnitude REAL NOT NULL,
    predicted_at TEXT NOT NULL,
    replay_test_id TEXT,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_predictions_universe_created
    ON predictions(universe_id, created_at);
CREATE INDEX IF NOT EXISTS idx_predictions_replay_tag
    ON predictions(replay_test_id) WHERE replay_test_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS analyst_assessments (
    id TEXT PRIMARY KEY,
    target_id TEXT NOT NULL,
    universe_id TEXT NOT NULL,
    analyst TEXT NOT NULL,
    direction TEXT NOT NULL,
    confidence REAL NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_assessments_universe_created
    ON analyst_assessments(universe_id, created_at);

CREATE TABLE IF NOT EXISTS ground_truth (
    target_id TEXT PRIMARY KEY,
    id TEXT NOT NULL,
    actual_direction TEXT NOT NULL,
    realized_move REAL NOT NULL,
    evaluated_at TEXT NOT NULL
) WITHOUT ROWID;
"#;

/// Canonical timestamp encoding: RFC 3339 UTC with fixed-width microsecond
/// precision, so lexicographic comparison matches chronological order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ReplayError::Corrupted(format!("bad timestamp '{}': {}", s, e)))
}

fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

/// SQLite-backed store for replay tests and the rolled-back domain tables.
pub struct ReplayStore {
    conn: Arc<Mutex<Connection>>,
}

impl ReplayStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// In-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match current {
            None => {
                conn.execute_batch(SCHEMA_SQL)?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    [SCHEMA_VERSION],
                )?;
                info!("Created replay store schema v{}", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("Replay store schema at v{}", SCHEMA_VERSION);
            }
            Some(v) => {
                warn!(
                    "Replay store schema version mismatch: expected {}, got {}",
                    SCHEMA_VERSION, v
                );
            }
        }

        Ok(())
    }

    // =========================================================================
    // REPLAY TEST CRUD
    // =========================================================================

    pub fn create_test(&self, test: &ReplayTest) -> Result<()> {
        let target_ids_json = test
            .target_ids
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let config_json = serde_json::to_string(&test.config)?;
        let results_json = test.results.as_ref().map(serde_json::to_string).transpose()?;

        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO replay_tests (
                id, org_id, name, description, rollback_depth, rollback_to,
                universe_id, target_ids_json, config_json, status, results_json,
                error_message, created_at, started_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            params![
                test.id,
                test.org_id,
                test.name,
                test.description,
                test.rollback_depth.as_str(),
                ts(test.rollback_to),
                test.universe_id,
                target_ids_json,
                config_json,
                test.status.as_str(),
                results_json,
                test.error_message,
                ts(test.created_at),
                test.started_at.map(ts),
                test.completed_at.map(ts),
            ],
        )?;
        debug!(test_id = %test.id, universe_id = %test.universe_id, "Created replay test");
        Ok(())
    }

    pub fn get_test(&self, test_id: &str) -> Result<ReplayTest> {
        let conn = self.conn.lock();
        Self::get_test_conn(&conn, test_id)
    }

    fn get_test_conn(conn: &Connection, test_id: &str) -> Result<ReplayTest> {
        let row: Option<RawTestRow> = conn
            .query_row(
                r#"SELECT id, org_id, name, description, rollback_depth, rollback_to,
                          universe_id, target_ids_json, config_json, status, results_json,
                          error_message, created_at, started_at, completed_at
                   FROM replay_tests WHERE id = ?"#,
                [test_id],
                RawTestRow::from_row,
            )
            .optional()?;

        match row {
            Some(raw) => raw.into_test(),
            None => Err(ReplayError::NotFound(format!("replay test {}", test_id))),
        }
    }

    pub fn list_tests_for_org(&self, org_id: &str) -> Result<Vec<ReplayTest>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"SELECT id, org_id, name, description, rollback_depth, rollback_to,
                      universe_id, target_ids_json, config_json, status, results_json,
                      error_message, created_at, started_at, completed_at
               FROM replay_tests WHERE org_id = ? ORDER BY created_at DESC, id"#,
        )?;
        let raws: Vec<RawTestRow> = stmt
            .query_map([org_id], RawTestRow::from_row)?
            .collect::<rusqlite::Result<_>>()?;
        raws.into_iter().map(RawTestRow::into_test).collect()
    }

    /// Id of a test already holding this universe's rollback window, if any.
    /// A test owns the window from capture until restore: `pending` tests
    /// have touched nothing and never block, `restored` tests are done.
    pub fn find_active_test(&self, universe_id: &str, exclude_test_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM replay_tests
                 WHERE universe_id = ? AND id != ?
                   AND status IN ('snapshot_created', 'running', 'completed', 'failed')
                 LIMIT 1",
                params![universe_id, exclude_test_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Flip a test to `failed` with the given message. No-op if the test is
    /// already failed or restored (the original failure wins; a restored
    /// test never regresses).
    pub fn mark_failed(&self, test_id: &str, message: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE replay_tests SET status = 'failed', error_message = ?
             WHERE id = ? AND status NOT IN ('failed', 'restored')",
            params![message, test_id],
        )?;
        if changed > 0 {
            warn!(test_id = %test_id, error = %message, "Replay test failed");
        }
        Ok(changed > 0)
    }

    /// Reconciliation for tests stuck in `running` (e.g. a crash between
    /// rollback and replay): force them to `failed` so restore becomes
    /// reachable. Returns the number of tests flipped.
    pub fn fail_stuck_tests(&self, started_before: DateTime<Utc>, message: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE replay_tests SET status = 'failed', error_message = ?
             WHERE status = 'running' AND started_at IS NOT NULL AND started_at <= ?",
            params![message, ts(started_before)],
        )?;
        if changed > 0 {
            warn!(count = changed, "Forced stuck replay tests to failed");
        }
        Ok(changed)
    }

    /// Delete a test and everything it owns (snapshots, results, tagged
    /// predictions). The engine only permits this for `pending`/`restored`
    /// tests.
    pub fn delete_test(&self, test_id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM replay_test_results WHERE test_id = ?", [test_id])?;
        tx.execute("DELETE FROM replay_test_snapshots WHERE test_id = ?", [test_id])?;
        tx.execute("DELETE FROM predictions WHERE replay_test_id = ?", [test_id])?;
        let deleted = tx.execute("DELETE FROM replay_tests WHERE id = ?", [test_id])?;
        if deleted == 0 {
            return Err(ReplayError::NotFound(format!("replay test {}", test_id)));
        }
        tx.commit()?;
        info!(test_id = %test_id, "Deleted replay test");
        Ok(())
    }

    // =========================================================================
    // PRIVILEGED PRIMITIVES: LOCATE / CAPTURE / ROLLBACK / RESTORE / CLEANUP
    // =========================================================================

    /// One query per affected table: ids of rows created at/after the cutoff
    /// whose target belongs to the universe (and target filter, if given).
    /// Replay-tagged predictions are never production state, so they are
    /// never located.
    pub fn locate_affected_records(
        &self,
        depth: RollbackDepth,
        cutoff: DateTime<Utc>,
        universe_id: &str,
        target_ids: Option<&[String]>,
    ) -> Result<Vec<AffectedRecordSet>> {
        let conn = self.conn.lock();
        let cutoff_s = ts(cutoff);
        let mut sets = Vec::new();

        for &table in depth.affected_tables() {
            let mut sql = format!(
                "SELECT id FROM {} WHERE universe_id = ? AND created_at >= ?",
                table.table_name()
            );
            if table == AffectedTable::Predictions {
                sql.push_str(" AND replay_test_id IS NULL");
            }
            let mut param_values: Vec<SqlValue> = vec![
                SqlValue::Text(universe_id.to_string()),
                SqlValue::Text(cutoff_s.clone()),
            ];
            if let Some(targets) = target_ids {
                sql.push_str(&format!(" AND target_id IN ({})", placeholders(targets.len())));
                param_values.extend(targets.iter().map(|t| SqlValue::Text(t.clone())));
            }
            sql.push_str(" ORDER BY id");

            let mut stmt = conn.prepare(&sql)?;
            let ids: Vec<String> = stmt
                .query_map(params_from_iter(param_values), |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;

            let row_count = ids.len();
            sets.push(AffectedRecordSet {
                table,
                record_ids: ids,
                row_count,
            });
        }

        debug!(
            universe_id = %universe_id,
            depth = depth.as_str(),
            total = sets.iter().map(|s| s.row_count).sum::<usize>(),
            "Located affected records"
        );
        Ok(sets)
    }

    /// Capture every located row into snapshots and advance the test from
    /// `pending` to `snapshot_created`, all in one transaction. If any table
    /// fails to capture, nothing commits and the test stays `pending`.
    pub fn capture_and_mark(
        &self,
        test_id: &str,
        sets: &[AffectedRecordSet],
    ) -> Result<Vec<ReplayTestSnapshot>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE replay_tests SET status = 'snapshot_created'
             WHERE id = ? AND status = 'pending'",
            [test_id],
        )?;
        if changed == 0 {
            let current = Self::get_test_conn(&tx, test_id)?.status;
            return Err(ReplayError::InvalidState {
                test_id: test_id.to_string(),
                expected: "pending",
                actual: current,
            });
        }

        let mut snapshots = Vec::new();
        for set in sets {
            if set.record_ids.is_empty() {
                continue;
            }
            let snapshot = Self::capture_table(&tx, test_id, set.table, &set.record_ids)?;
            snapshots.push(snapshot);
        }

        tx.commit()?;
        info!(
            test_id = %test_id,
            tables = snapshots.len(),
            rows = snapshots.iter().map(|s| s.row_count).sum::<usize>(),
            "Captured snapshot set"
        );
        Ok(snapshots)
    }

    /// Privileged capture primitive: copy the full row payloads for the
    /// given ids before any deletion. Standalone variant with its own
    /// transaction; returns the snapshot id.
    pub fn create_snapshot(
        &self,
        test_id: &str,
        table: AffectedTable,
        record_ids: &[String],
    ) -> Result<String> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let snapshot = Self::capture_table(&tx, test_id, table, record_ids)?;
        tx.commit()?;
        Ok(snapshot.id)
    }

    fn capture_table(
        tx: &Transaction<'_>,
        test_id: &str,
        table: AffectedTable,
        record_ids: &[String],
    ) -> Result<ReplayTestSnapshot> {
        let mut rows_out: Vec<Map<String, Value>> = Vec::with_capacity(record_ids.len());
        if !record_ids.is_empty() {
            let sql = format!(
                "SELECT * FROM {} WHERE id IN ({}) ORDER BY id",
                table.table_name(),
                placeholders(record_ids.len())
            );
            let mut stmt = tx.prepare(&sql)?;
            let columns: Vec<String> =
                stmt.column_names().iter().map(|c| c.to_string()).collect();

            let mut rows = stmt.query(params_from_iter(record_ids.iter()))?;
            while let Some(row) = rows.next()? {
                let mut map = Map::new();
                for (i, col) in columns.iter().enumerate() {
                    map.insert(col.clone(), value_ref_to_json(row.get_ref(i)?));
                }
                rows_out.push(map);
            }
        }

        if rows_out.len() != record_ids.len() {
            return Err(ReplayError::Corrupted(format!(
                "capture of {} found {} of {} located rows",
                table.table_name(),
                rows_out.len(),
                record_ids.len()
            )));
        }

        let snapshot = ReplayTestSnapshot {
            id: format!("snap_{}", Uuid::new_v4()),
            test_id: test_id.to_string(),
            table,
            record_ids: record_ids.to_vec(),
            row_count: rows_out.len(),
            rows: rows_out,
            created_at: Utc::now(),
        };

        tx.execute(
            r#"INSERT INTO replay_test_snapshots
               (id, test_id, table_name, rows_json, record_ids_json, row_count, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
            params![
                snapshot.id,
                snapshot.test_id,
                snapshot.table.table_name(),
                serde_json::to_string(&snapshot.rows)?,
                serde_json::to_string(&snapshot.record_ids)?,
                snapshot.row_count as i64,
                ts(snapshot.created_at),
            ],
        )?;
        debug!(
            test_id = %test_id,
            table = table.table_name(),
            rows = snapshot.row_count,
            "Captured table snapshot"
        );
        Ok(snapshot)
    }

    pub fn get_snapshots(&self, test_id: &str) -> Result<Vec<ReplayTestSnapshot>> {
        let conn = self.conn.lock();
        Self::get_snapshots_conn(&conn, test_id)
    }

    fn get_snapshots_conn(conn: &Connection, test_id: &str) -> Result<Vec<ReplayTestSnapshot>> {
        let mut stmt = conn.prepare(
            "SELECT id, test_id, table_name, rows_json, record_ids_json, row_count, created_at
             FROM replay_test_snapshots WHERE test_id = ? ORDER BY created_at, id",
        )?;
        let raws: Vec<RawSnapshotRow> = stmt
            .query_map([test_id], RawSnapshotRow::from_row)?
            .collect::<rusqlite::Result<_>>()?;
        raws.into_iter().map(RawSnapshotRow::into_snapshot).collect()
    }

    /// Delete exactly the snapshotted record ids from the live tables and
    /// advance the test from `snapshot_created` to `running` (stamping
    /// `started_at`), all in one transaction. Deleting from the snapshotted
    /// id sets, never from a fresh locate, is what guarantees the snapshot
    /// covers every deleted row.
    pub fn rollback_and_mark(&self, test_id: &str) -> Result<Vec<(AffectedTable, usize)>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE replay_tests SET status = 'running', started_at = ?2
             WHERE id = ?1 AND status = 'snapshot_created'",
            params![test_id, ts(Utc::now())],
        )?;
        if changed == 0 {
            let current = Self::get_test_conn(&tx, test_id)?.status;
            return Err(ReplayError::InvalidState {
                test_id: test_id.to_string(),
                expected: "snapshot_created",
                actual: current,
            });
        }

        let snapshots = Self::get_snapshots_conn(&tx, test_id)?;
        let mut counts = Vec::with_capacity(snapshots.len());
        for snapshot in &snapshots {
            let sql = format!(
                "DELETE FROM {} WHERE id IN ({})",
                snapshot.table.table_name(),
                placeholders(snapshot.record_ids.len())
            );
            let deleted = tx.execute(&sql, params_from_iter(snapshot.record_ids.iter()))?;
            counts.push((snapshot.table, deleted));
        }

        tx.commit()?;
        info!(
            test_id = %test_id,
            rows = counts.iter().map(|(_, n)| n).sum::<usize>(),
            "Rolled back located records"
        );
        Ok(counts)
    }

    /// Privileged restore primitive: reinsert one snapshot's captured
    /// payloads. `INSERT OR IGNORE` keeps it idempotent; afterwards every
    /// captured id must be present or the transaction rolls back. Returns
    /// the number of rows actually reinserted (0 on a fully redundant call).
    pub fn restore_snapshot(&self, snapshot_id: &str) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let snapshot = Self::get_snapshot_conn(&tx, snapshot_id)?;
        let reinserted = Self::restore_rows(&tx, &snapshot)?;
        tx.commit()?;
        Ok(reinserted)
    }

    fn get_snapshot_conn(conn: &Connection, snapshot_id: &str) -> Result<ReplayTestSnapshot> {
        let raw: Option<RawSnapshotRow> = conn
            .query_row(
                "SELECT id, test_id, table_name, rows_json, record_ids_json, row_count, created_at
                 FROM replay_test_snapshots WHERE id = ?",
                [snapshot_id],
                RawSnapshotRow::from_row,
            )
            .optional()?;
        match raw {
            Some(raw) => raw.into_snapshot(),
            None => Err(ReplayError::NotFound(format!("snapshot {}", snapshot_id))),
        }
    }

    fn restore_rows(tx: &Transaction<'_>, snapshot: &ReplayTestSnapshot) -> Result<usize> {
        let mut reinserted = 0usize;
        for row in &snapshot.rows {
            let columns: Vec<&str> = row.keys().map(String::as_str).collect();
            let values: Vec<SqlValue> = row.values().map(json_to_sql).collect();
            let sql = format!(
                "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
                snapshot.table.table_name(),
                columns.join(", "),
                placeholders(columns.len())
            );
            reinserted += tx.execute(&sql, params_from_iter(values))?;
        }

        // Restore is only done when every captured id is confirmed present.
        if !snapshot.record_ids.is_empty() {
            let sql = format!(
                "SELECT COUNT(*) FROM {} WHERE id IN ({})",
                snapshot.table.table_name(),
                placeholders(snapshot.record_ids.len())
            );
            let present: usize = tx.query_row(
                &sql,
                params_from_iter(snapshot.record_ids.iter()),
                |row| row.get(0),
            )?;
            if present != snapshot.row_count {
                return Err(ReplayError::Corrupted(format!(
                    "restore verification failed for {}: {} of {} rows present",
                    snapshot.table.table_name(),
                    present,
                    snapshot.row_count
                )));
            }
        }
        Ok(reinserted)
    }

    /// Reinsert every snapshot of the test and advance it to `restored`, in
    /// one transaction. Legal from `snapshot_created`, `completed`, and
    /// `failed`; calling it on an already `restored` test is a no-op.
    /// Returns the number of rows reinserted.
    pub fn restore_and_mark(&self, test_id: &str) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let test = Self::get_test_conn(&tx, test_id)?;
        if test.status == ReplayStatus::Restored {
            debug!(test_id = %test_id, "Restore on already-restored test is a no-op");
            return Ok(0);
        }
        if !test.status.can_restore() {
            return Err(ReplayError::InvalidState {
                test_id: test_id.to_string(),
                expected: "snapshot_created, completed, or failed",
                actual: test.status,
            });
        }

        let snapshots = Self::get_snapshots_conn(&tx, test_id)?;
        let mut reinserted = 0usize;
        for snapshot in &snapshots {
            reinserted += Self::restore_rows(&tx, snapshot)?;
        }

        let changed = tx.execute(
            "UPDATE replay_tests SET status = 'restored'
             WHERE id = ?1 AND status IN ('snapshot_created', 'completed', 'failed')",
            params![test_id],
        )?;
        if changed == 0 {
            // Status moved under us between the read and the update.
            let current = Self::get_test_conn(&tx, test_id)?.status;
            return Err(ReplayError::InvalidState {
                test_id: test_id.to_string(),
                expected: "snapshot_created, completed, or failed",
                actual: current,
            });
        }

        tx.commit()?;
        info!(test_id = %test_id, rows = reinserted, "Restored snapshot set");
        Ok(reinserted)
    }

    /// Purge artifacts that should not linger once restore is done:
    /// replay-tagged predictions and the snapshot payloads. Idempotent.
    pub fn cleanup(&self, test_id: &str) -> Result<(usize, usize)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let predictions = tx.execute(
            "DELETE FROM predictions WHERE replay_test_id = ?",
            [test_id],
        )?;
        let snapshots = tx.execute(
            "DELETE FROM replay_test_snapshots WHERE test_id = ?",
            [test_id],
        )?;
        tx.commit()?;
        debug!(
            test_id = %test_id,
            predictions_deleted = predictions,
            snapshots_deleted = snapshots,
            "Cleaned up replay artifacts"
        );
        Ok((predictions, snapshots))
    }

    // =========================================================================
    // RESULTS
    // =========================================================================

    /// Bulk-insert the comparison results, write the aggregate onto the
    /// test, and advance `running` to `completed`, all in one transaction, so
    /// `results` is populated exactly once, at the completed transition.
    pub fn complete_with_results(
        &self,
        test_id: &str,
        results: &[ReplayTestResult],
        stats: &ReplaySummaryStats,
    ) -> Result<()> {
        let results_json = serde_json::to_string(stats)?;
        let serialized: Vec<(String, String)> = results
            .iter()
            .map(|r| Ok((r.id.clone(), serde_json::to_string(r)?)))
            .collect::<Result<_>>()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE replay_tests
             SET status = 'completed', results_json = ?2, completed_at = ?3
             WHERE id = ?1 AND status = 'running' AND results_json IS NULL",
            params![test_id, results_json, ts(Utc::now())],
        )?;
        if changed == 0 {
            let current = Self::get_test_conn(&tx, test_id)?.status;
            return Err(ReplayError::InvalidState {
                test_id: test_id.to_string(),
                expected: "running",
                actual: current,
            });
        }

        for (result, (_, payload)) in results.iter().zip(&serialized) {
            tx.execute(
                r#"INSERT INTO replay_test_results
                   (id, test_id, target_id, status, direction_match, payload_json, created_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?)"#,
                params![
                    result.id,
                    result.test_id,
                    result.target_id,
                    result.status.as_str(),
                    result.direction_match as i32,
                    payload,
                    ts(result.created_at),
                ],
            )?;
        }

        tx.commit()?;
        info!(test_id = %test_id, results = results.len(), "Replay test completed");
        Ok(())
    }

    /// Insert result rows without touching test status (used when recording
    /// partial progress, e.g. rows stuck `running`).
    pub fn insert_results(&self, results: &[ReplayTestResult]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for result in results {
            tx.execute(
                r#"INSERT INTO replay_test_results
                   (id, test_id, target_id, status, direction_match, payload_json, created_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?)"#,
                params![
                    result.id,
                    result.test_id,
                    result.target_id,
                    result.status.as_str(),
                    result.direction_match as i32,
                    serde_json::to_string(result)?,
                    ts(result.created_at),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_results(&self, test_id: &str) -> Result<Vec<ReplayTestResult>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM replay_test_results
             WHERE test_id = ? ORDER BY target_id, id",
        )?;
        let payloads: Vec<String> = stmt
            .query_map([test_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        payloads
            .iter()
            .map(|p| serde_json::from_str(p).map_err(ReplayError::from))
            .collect()
    }

    /// All result rows across an organization's tests.
    pub fn get_results_for_org(&self, org_id: &str) -> Result<Vec<ReplayTestResult>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT r.payload_json FROM replay_test_results r
             JOIN replay_tests t ON t.id = r.test_id
             WHERE t.org_id = ? ORDER BY r.test_id, r.target_id",
        )?;
        let payloads: Vec<String> = stmt
            .query_map([org_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        payloads
            .iter()
            .map(|p| serde_json::from_str(p).map_err(ReplayError::from))
            .collect()
    }

    // =========================================================================
    // DOMAIN TABLES
    // =========================================================================

    pub fn insert_signal(&self, signal: &SignalRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO signals (id, target_id, universe_id, signal_type, strength, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                signal.id,
                signal.target_id,
                signal.universe_id,
                signal.signal_type,
                signal.strength,
                ts(signal.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn insert_predictor(&self, predictor: &PredictorRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO predictors (id, target_id, universe_id, name, score, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                predictor.id,
                predictor.target_id,
                predictor.universe_id,
                predictor.name,
                predictor.score,
                ts(predictor.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn insert_assessment(&self, assessment: &AnalystAssessment) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO analyst_assessments
             (id, target_id, universe_id, analyst, direction, confidence, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                assessment.id,
                assessment.target_id,
                assessment.universe_id,
                assessment.analyst,
                assessment.direction.as_str(),
                assessment.confidence,
                ts(assessment.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn insert_prediction(&self, prediction: &Prediction) -> Result<()> {
        let conn = self.conn.lock();
        Self::insert_prediction_conn(&conn, prediction)
    }

    fn insert_prediction_conn(conn: &Connection, prediction: &Prediction) -> Result<()> {
        conn.execute(
            r#"INSERT INTO predictions
               (id, target_id, universe_id, direction, confidence, magnitude,
                predicted_at, replay_test_id, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            params![
                prediction.id,
                prediction.target_id,
                prediction.universe_id,
                prediction.direction.as_str(),
                prediction.confidence,
                prediction.magnitude,
                ts(prediction.predicted_at),
                prediction.replay_test_id,
                ts(prediction.created_at),
            ],
        )?;
        Ok(())
    }

    /// Bulk-insert replay-tagged pipeline output in one transaction.
    pub fn insert_replay_predictions(&self, predictions: &[Prediction]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for prediction in predictions {
            Self::insert_prediction_conn(&tx, prediction)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_replay_predictions(&self, test_id: &str) -> Result<Vec<Prediction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, target_id, universe_id, direction, confidence, magnitude,
                    predicted_at, replay_test_id, created_at
             FROM predictions WHERE replay_test_id = ? ORDER BY target_id, id",
        )?;
        let raws: Vec<RawPredictionRow> = stmt
            .query_map([test_id], RawPredictionRow::from_row)?
            .collect::<rusqlite::Result<_>>()?;
        raws.into_iter().map(RawPredictionRow::into_prediction).collect()
    }

    /// Production-facing prediction read: replay-tagged rows are excluded by
    /// default.
    pub fn list_predictions(&self, universe_id: &str, include_replay: bool) -> Result<Vec<Prediction>> {
        let conn = self.conn.lock();
        let sql = if include_replay {
            "SELECT id, target_id, universe_id, direction, confidence, magnitude,
                    predicted_at, replay_test_id, created_at
             FROM predictions WHERE universe_id = ? ORDER BY created_at, id"
        } else {
            "SELECT id, target_id, universe_id, direction, confidence, magnitude,
                    predicted_at, replay_test_id, created_at
             FROM predictions WHERE universe_id = ? AND replay_test_id IS NULL
             ORDER BY created_at, id"
        };
        let mut stmt = conn.prepare(sql)?;
        let raws: Vec<RawPredictionRow> = stmt
            .query_map([universe_id], RawPredictionRow::from_row)?
            .collect::<rusqlite::Result<_>>()?;
        raws.into_iter().map(RawPredictionRow::into_prediction).collect()
    }

    pub fn upsert_ground_truth(&self, truth: &GroundTruth) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO ground_truth
             (target_id, id, actual_direction, realized_move, evaluated_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                truth.target_id,
                truth.id,
                truth.actual_direction.as_str(),
                truth.realized_move,
                ts(truth.evaluated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_ground_truth(&self, target_id: &str) -> Result<Option<GroundTruth>> {
        let conn = self.conn.lock();
        let raw: Option<(String, String, String, f64, String)> = conn
            .query_row(
                "SELECT target_id, id, actual_direction, realized_move, evaluated_at
                 FROM ground_truth WHERE target_id = ?",
                [target_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;

        match raw {
            None => Ok(None),
            Some((target_id, id, direction, realized_move, evaluated_at)) => {
                let actual_direction = Direction::parse(&direction).ok_or_else(|| {
                    ReplayError::Corrupted(format!("bad ground truth direction '{}'", direction))
                })?;
                Ok(Some(GroundTruth {
                    id,
                    target_id,
                    actual_direction,
                    realized_move,
                    evaluated_at: parse_ts(&evaluated_at)?,
                }))
            }
        }
    }

    /// Row count of one affected table (auditing and tests).
    pub fn count_rows(&self, table: AffectedTable) -> Result<usize> {
        let conn = self.conn.lock();
        let count: usize = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", table.table_name()),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

// =============================================================================
// ROW MAPPING
// =============================================================================

struct RawTestRow {
    id: String,
    org_id: String,
    name: String,
    description: Option<String>,
    rollback_depth: String,
    rollback_to: String,
    universe_id: String,
    target_ids_json: Option<String>,
    config_json: String,
    status: String,
    results_json: Option<String>,
    error_message: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl RawTestRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            org_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            rollback_depth: row.get(4)?,
            rollback_to: row.get(5)?,
            universe_id: row.get(6)?,
            target_ids_json: row.get(7)?,
            config_json: row.get(8)?,
            status: row.get(9)?,
            results_json: row.get(10)?,
            error_message: row.get(11)?,
            created_at: row.get(12)?,
            started_at: row.get(13)?,
            completed_at: row.get(14)?,
        })
    }

    fn into_test(self) -> Result<ReplayTest> {
        let rollback_depth = RollbackDepth::parse(&self.rollback_depth).ok_or_else(|| {
            ReplayError::Corrupted(format!("bad rollback depth '{}'", self.rollback_depth))
        })?;
        let status = ReplayStatus::parse(&self.status)
            .ok_or_else(|| ReplayError::Corrupted(format!("bad status '{}'", self.status)))?;
        let target_ids = self
            .target_ids_json
            .as_deref()
            .map(serde_json::from_str::<Vec<String>>)
            .transpose()?;
        let config: ReplayConfig = serde_json::from_str(&self.config_json)?;
        let results = self
            .results_json
            .as_deref()
            .map(serde_json::from_str::<ReplaySummaryStats>)
            .transpose()?;

        Ok(ReplayTest {
            id: self.id,
            org_id: self.org_id,
            name: self.name,
            description: self.description,
            rollback_depth,
            rollback_to: parse_ts(&self.rollback_to)?,
            universe_id: self.universe_id,
            target_ids,
            config,
            status,
            results,
            error_message: self.error_message,
            created_at: parse_ts(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

struct RawSnapshotRow {
    id: String,
    test_id: String,
    table_name: String,
    rows_json: String,
    record_ids_json: String,
    row_count: i64,
    created_at: String,
}

impl RawSnapshotRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            test_id: row.get(1)?,
            table_name: row.get(2)?,
            rows_json: row.get(3)?,
            record_ids_json: row.get(4)?,
            row_count: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_snapshot(self) -> Result<ReplayTestSnapshot> {
        let table = AffectedTable::parse(&self.table_name).ok_or_else(|| {
            ReplayError::Corrupted(format!("bad snapshot table '{}'", self.table_name))
        })?;
        Ok(ReplayTestSnapshot {
            id: self.id,
            test_id: self.test_id,
            table,
            rows: serde_json::from_str(&self.rows_json)?,
            record_ids: serde_json::from_str(&self.record_ids_json)?,
            row_count: self.row_count as usize,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct RawPredictionRow {
    id: String,
    target_id: String,
    universe_id: String,
    direction: String,
    confidence: f64,
    magnitude: f64,
    predicted_at: String,
    replay_test_id: Option<String>,
    created_at: String,
}

impl RawPredictionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            target_id: row.get(1)?,
            universe_id: row.get(2)?,
            direction: row.get(3)?,
            confidence: row.get(4)?,
            magnitude: row.get(5)?,
            predicted_at: row.get(6)?,
            replay_test_id: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_prediction(self) -> Result<Prediction> {
        let direction = Direction::parse(&self.direction).ok_or_else(|| {
            ReplayError::Corrupted(format!("bad prediction direction '{}'", self.direction))
        })?;
        Ok(Prediction {
            id: self.id,
            target_id: self.target_id,
            universe_id: self.universe_id,
            direction,
            confidence: self.confidence,
            magnitude: self.magnitude,
            predicted_at: parse_ts(&self.predicted_at)?,
            replay_test_id: self.replay_test_id,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

// =============================================================================
// OPAQUE PAYLOAD ENCODING
// =============================================================================

/// Encode one SQLite value as JSON, preserving enough type information to
/// reinsert it bit-identically. Blobs get a `{"$blob": [...]}` wrapper since
/// JSON has no byte-string type.
fn value_ref_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => {
            let mut wrapper = Map::new();
            wrapper.insert(
                "$blob".to_string(),
                Value::Array(b.iter().map(|&byte| Value::from(byte)).collect()),
            );
            Value::Object(wrapper)
        }
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Object(map) => {
            if let Some(Value::Array(bytes)) = map.get("$blob") {
                let blob: Vec<u8> = bytes
                    .iter()
                    .filter_map(|v| v.as_u64().map(|b| b as u8))
                    .collect();
                SqlValue::Blob(blob)
            } else {
                SqlValue::Text(value.to_string())
            }
        }
        Value::Array(_) => SqlValue::Text(value.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================
