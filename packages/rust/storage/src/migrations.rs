//! SQL migration definitions for the chatlake state database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: lane_runs",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per export object observed by the orchestrator
CREATE TABLE IF NOT EXISTS lane_runs (
    run_id      TEXT PRIMARY KEY,
    lane        TEXT NOT NULL,
    export_key  TEXT NOT NULL,
    export_etag TEXT NOT NULL,
    state       TEXT NOT NULL,
    job_id      TEXT,
    detected_at TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    detail      TEXT
);

CREATE INDEX IF NOT EXISTS idx_lane_runs_lane ON lane_runs(lane, detected_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_lane_runs_job ON lane_runs(job_id) WHERE job_id IS NOT NULL;

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Run summaries for lane executions",
            sql: r#"
CREATE TABLE IF NOT EXISTS run_summaries (
    id           TEXT PRIMARY KEY,
    lane         TEXT NOT NULL,
    run_date     TEXT NOT NULL,
    started_at   TEXT NOT NULL,
    finished_at  TEXT NOT NULL,
    status       TEXT NOT NULL,
    rows_written INTEGER NOT NULL DEFAULT 0,
    malformed    INTEGER NOT NULL DEFAULT 0,
    error        TEXT,
    summary_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_run_summaries_lane ON run_summaries(lane, started_at);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
