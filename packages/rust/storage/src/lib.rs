//! Turso Embedded / libSQL storage layer for orchestrator state.
//!
//! The [`Storage`] struct wraps a local libSQL database holding:
//! - `lane_runs`: one row per export object, carrying its [`LaneState`]
//! - `run_summaries`: the outcome of every lane execution
//!
//! **Access rules:**
//! - lane runs and notifications: read-write via [`Storage::open`]
//! - inspection (`chatlake runs`): read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use chatlake_shared::{ChatlakeError, LaneKind, LaneState, Result, RunSummary};
use libsql::{Connection, Database, params};
use uuid::Uuid;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// Orchestrator record for one export object.
#[derive(Debug, Clone, PartialEq)]
pub struct LaneRun {
    /// `<lane>:<export_key>@<etag>`.
    pub run_id: String,
    pub lane: LaneKind,
    pub export_key: String,
    pub export_etag: String,
    pub state: LaneState,
    /// Transform job started for this run, once there is one.
    pub job_id: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last failure or note recorded against the run.
    pub detail: Option<String>,
}

/// Outcome of a lane execution as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRunSummary {
    pub id: String,
    pub lane: LaneKind,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `succeeded` or `failed`.
    pub status: String,
    pub error: Option<String>,
    pub summary: RunSummary,
}

fn storage_err(e: impl std::fmt::Display) -> ChatlakeError {
    ChatlakeError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ChatlakeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    ChatlakeError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ChatlakeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lane runs
    // -----------------------------------------------------------------------

    /// Insert a run unless one with the same `run_id` exists.
    /// Returns `false` when the run was already recorded.
    pub async fn insert_lane_run(&self, run: &LaneRun) -> Result<bool> {
        self.check_writable()?;
        let inserted = self
            .conn
            .execute(
                "INSERT INTO lane_runs (run_id, lane, export_key, export_etag, state, job_id, detected_at, updated_at, detail)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(run_id) DO NOTHING",
                params![
                    run.run_id.as_str(),
                    run.lane.as_str(),
                    run.export_key.as_str(),
                    run.export_etag.as_str(),
                    run.state.as_str(),
                    run.job_id.as_deref(),
                    run.detected_at.to_rfc3339(),
                    run.updated_at.to_rfc3339(),
                    run.detail.as_deref(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(inserted > 0)
    }

    /// Get a run by ID.
    pub async fn get_lane_run(&self, run_id: &str) -> Result<Option<LaneRun>> {
        self.query_one_run(
            "SELECT run_id, lane, export_key, export_etag, state, job_id, detected_at, updated_at, detail
             FROM lane_runs WHERE run_id = ?1",
            run_id,
        )
        .await
    }

    /// Find the run a transform job belongs to.
    pub async fn find_run_by_job(&self, job_id: &str) -> Result<Option<LaneRun>> {
        self.query_one_run(
            "SELECT run_id, lane, export_key, export_etag, state, job_id, detected_at, updated_at, detail
             FROM lane_runs WHERE job_id = ?1",
            job_id,
        )
        .await
    }

    async fn query_one_run(&self, sql: &str, arg: &str) -> Result<Option<LaneRun>> {
        let mut rows = self
            .conn
            .query(sql, params![arg])
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_lane_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Move a run from `from` to `to`, optionally recording a job id and detail.
    ///
    /// Compare-and-set on the current state: returns `false` (and changes
    /// nothing) if the run is no longer in `from`.
    pub async fn transition_lane_run(
        &self,
        run_id: &str,
        from: LaneState,
        to: LaneState,
        job_id: Option<&str>,
        detail: Option<&str>,
    ) -> Result<bool> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE lane_runs
                 SET state = ?1,
                     job_id = COALESCE(?2, job_id),
                     detail = COALESCE(?3, detail),
                     updated_at = ?4
                 WHERE run_id = ?5 AND state = ?6",
                params![to.as_str(), job_id, detail, now.as_str(), run_id, from.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    /// Record a note on a run without changing its state.
    pub async fn set_lane_run_detail(&self, run_id: &str, detail: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE lane_runs SET detail = ?1, updated_at = ?2 WHERE run_id = ?3",
                params![detail, now.as_str(), run_id],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Runs of a lane currently in `state`, oldest first.
    pub async fn lane_runs_in_state(
        &self,
        lane: LaneKind,
        state: LaneState,
    ) -> Result<Vec<LaneRun>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_id, lane, export_key, export_etag, state, job_id, detected_at, updated_at, detail
                 FROM lane_runs WHERE lane = ?1 AND state = ?2 ORDER BY detected_at, run_id",
                params![lane.as_str(), state.as_str()],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_lane_run(&row)?);
        }
        Ok(results)
    }

    /// Most recent runs first, optionally for one lane.
    pub async fn list_lane_runs(&self, lane: Option<LaneKind>, limit: u32) -> Result<Vec<LaneRun>> {
        let lane = lane.map(LaneKind::as_str);
        let mut rows = self
            .conn
            .query(
                "SELECT run_id, lane, export_key, export_etag, state, job_id, detected_at, updated_at, detail
                 FROM lane_runs
                 WHERE ?1 IS NULL OR lane = ?1
                 ORDER BY detected_at DESC, run_id DESC
                 LIMIT ?2",
                params![lane, limit],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_lane_run(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Run summaries
    // -----------------------------------------------------------------------

    /// Persist the outcome of a lane execution. Returns the generated ID.
    pub async fn insert_run_summary(
        &self,
        lane: LaneKind,
        run_date: NaiveDate,
        started_at: DateTime<Utc>,
        error: Option<&str>,
        summary: &RunSummary,
    ) -> Result<String> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let finished_at = Utc::now().to_rfc3339();
        let status = if error.is_some() { "failed" } else { "succeeded" };
        let summary_json = serde_json::to_string(summary)?;
        self.conn
            .execute(
                "INSERT INTO run_summaries (id, lane, run_date, started_at, finished_at, status, rows_written, malformed, error, summary_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id.as_str(),
                    lane.as_str(),
                    run_date.to_string(),
                    started_at.to_rfc3339(),
                    finished_at.as_str(),
                    status,
                    summary.rows_written as i64,
                    summary.malformed_count as i64,
                    error,
                    summary_json.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(id)
    }

    /// Most recent summaries first, optionally for one lane.
    pub async fn list_run_summaries(
        &self,
        lane: Option<LaneKind>,
        limit: u32,
    ) -> Result<Vec<StoredRunSummary>> {
        let lane = lane.map(LaneKind::as_str);
        let mut rows = self
            .conn
            .query(
                "SELECT id, lane, run_date, started_at, finished_at, status, error, summary_json
                 FROM run_summaries
                 WHERE ?1 IS NULL OR lane = ?1
                 ORDER BY started_at DESC, id DESC
                 LIMIT ?2",
                params![lane, limit],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_summary(&row)?);
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn get_string(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(storage_err)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ChatlakeError::Storage(format!("invalid date: {e}")))
}

fn parse_lane(raw: &str) -> Result<LaneKind> {
    raw.parse().map_err(ChatlakeError::Storage)
}

/// Convert a database row to a [`LaneRun`].
fn row_to_lane_run(row: &libsql::Row) -> Result<LaneRun> {
    Ok(LaneRun {
        run_id: get_string(row, 0)?,
        lane: parse_lane(&get_string(row, 1)?)?,
        export_key: get_string(row, 2)?,
        export_etag: get_string(row, 3)?,
        state: get_string(row, 4)?
            .parse()
            .map_err(ChatlakeError::Storage)?,
        job_id: row.get::<String>(5).ok(),
        detected_at: parse_time(&get_string(row, 6)?)?,
        updated_at: parse_time(&get_string(row, 7)?)?,
        detail: row.get::<String>(8).ok(),
    })
}

/// Convert a database row to a [`StoredRunSummary`].
fn row_to_summary(row: &libsql::Row) -> Result<StoredRunSummary> {
    let run_date = get_string(row, 2)?;
    Ok(StoredRunSummary {
        id: get_string(row, 0)?,
        lane: parse_lane(&get_string(row, 1)?)?,
        run_date: run_date
            .parse()
            .map_err(|e| ChatlakeError::Storage(format!("invalid run date {run_date}: {e}")))?,
        started_at: parse_time(&get_string(row, 3)?)?,
        finished_at: parse_time(&get_string(row, 4)?)?,
        status: get_string(row, 5)?,
        error: row.get::<String>(6).ok(),
        summary: serde_json::from_str(&get_string(row, 7)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("cl_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn run(run_id: &str, lane: LaneKind, state: LaneState) -> LaneRun {
        let now = Utc::now();
        LaneRun {
            run_id: run_id.into(),
            lane,
            export_key: "reports/normalized/2025-08-04/usuarios_normalizados.csv".into(),
            export_etag: "abc".into(),
            state,
            job_id: None,
            detected_at: now,
            updated_at: now,
            detail: None,
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("cl_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn insert_is_idempotent_per_run_id() {
        let storage = test_storage().await;
        let r = run("normalization:k@abc", LaneKind::Normalization, LaneState::ExportDetected);

        assert!(storage.insert_lane_run(&r).await.expect("insert"));
        assert!(!storage.insert_lane_run(&r).await.expect("duplicate insert"));

        let found = storage
            .get_lane_run("normalization:k@abc")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(found.state, LaneState::ExportDetected);
        assert_eq!(found.lane, LaneKind::Normalization);
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let storage = test_storage().await;
        let r = run("tokens:k@1", LaneKind::Tokens, LaneState::ExportDetected);
        storage.insert_lane_run(&r).await.unwrap();

        let moved = storage
            .transition_lane_run(
                &r.run_id,
                LaneState::ExportDetected,
                LaneState::TransformRunning,
                Some("job-1"),
                None,
            )
            .await
            .unwrap();
        assert!(moved);

        // Second attempt from the stale state changes nothing.
        let moved_again = storage
            .transition_lane_run(
                &r.run_id,
                LaneState::ExportDetected,
                LaneState::TransformRunning,
                Some("job-2"),
                None,
            )
            .await
            .unwrap();
        assert!(!moved_again);

        let by_job = storage.find_run_by_job("job-1").await.unwrap().unwrap();
        assert_eq!(by_job.run_id, r.run_id);
        assert_eq!(by_job.state, LaneState::TransformRunning);
        assert!(storage.find_run_by_job("job-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_and_filter_runs() {
        let storage = test_storage().await;
        storage
            .insert_lane_run(&run("normalization:a@1", LaneKind::Normalization, LaneState::Queryable))
            .await
            .unwrap();
        storage
            .insert_lane_run(&run("tokens:b@1", LaneKind::Tokens, LaneState::CatalogRefreshing))
            .await
            .unwrap();

        assert_eq!(storage.list_lane_runs(None, 10).await.unwrap().len(), 2);
        let tokens = storage
            .list_lane_runs(Some(LaneKind::Tokens), 10)
            .await
            .unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].run_id, "tokens:b@1");

        let refreshing = storage
            .lane_runs_in_state(LaneKind::Tokens, LaneState::CatalogRefreshing)
            .await
            .unwrap();
        assert_eq!(refreshing.len(), 1);
    }

    #[tokio::test]
    async fn run_summary_roundtrip() {
        let storage = test_storage().await;
        let mut summary = RunSummary {
            rows_written: 3,
            export_key: Some("reports/normalized/2025-08-04/usuarios_normalizados.csv".into()),
            ..RunSummary::default()
        };
        summary.record_malformed("USER#1/CONVERSATION#x", "no conversation id");

        let date = NaiveDate::from_ymd_opt(2025, 8, 4).unwrap();
        storage
            .insert_run_summary(LaneKind::Normalization, date, Utc::now(), None, &summary)
            .await
            .expect("insert summary");
        storage
            .insert_run_summary(
                LaneKind::Tokens,
                date,
                Utc::now(),
                Some("source unavailable: down"),
                &RunSummary::default(),
            )
            .await
            .expect("insert failed summary");

        let all = storage.list_run_summaries(None, 10).await.unwrap();
        assert_eq!(all.len(), 2);

        let normalization = storage
            .list_run_summaries(Some(LaneKind::Normalization), 10)
            .await
            .unwrap();
        assert_eq!(normalization[0].status, "succeeded");
        assert_eq!(normalization[0].summary, summary);
        assert_eq!(normalization[0].run_date, date);

        let tokens = storage
            .list_run_summaries(Some(LaneKind::Tokens), 10)
            .await
            .unwrap();
        assert_eq!(tokens[0].status, "failed");
        assert!(tokens[0].error.as_deref().unwrap().contains("down"));
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("cl_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.insert_lane_run(&run("tokens:a@1", LaneKind::Tokens, LaneState::ExportDetected))
            .await
            .unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.list_lane_runs(None, 5).await.unwrap().len(), 1);
        let result = ro
            .insert_lane_run(&run("tokens:b@1", LaneKind::Tokens, LaneState::ExportDetected))
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
