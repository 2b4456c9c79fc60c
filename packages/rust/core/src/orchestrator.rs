//! Stage orchestrator: export → columnar transform → catalog refresh.
//!
//! Each export object is one run, keyed `<lane>:<key>@<etag>` and persisted
//! in the state database with an explicit [`LaneState`]. Notifications are
//! delivered at least once, so every handler first looks the run up and
//! only acts through compare-and-set transitions:
//!
//! ```text
//! Idle ─object created─▶ ExportDetected ─job started─▶ TransformRunning
//!   TransformRunning ─SUCCEEDED─▶ TransformSucceeded ─refresh started─▶ CatalogRefreshing ─▶ Queryable
//!   TransformRunning ─FAILED|TIMEOUT|STOPPED|ERROR─▶ TransformFailed
//!   TransformFailed ─export rewritten─▶ ExportDetected
//! ```
//!
//! A failed trigger leaves the run where it was and returns the error; a
//! redelivered notification retries it. A failed transform stays failed
//! until the lane is rerun and rewrites the export; notifications for the
//! old object are duplicates.

use std::fmt;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use chatlake_artifacts::ObjectStore;
use chatlake_shared::{AppConfig, ChatlakeError, LaneKind, LaneState, Result};
use chatlake_storage::{LaneRun, Storage};

use crate::catalog::{CatalogRefresher, CatalogRequest};
use crate::jobs::{JobRequest, JobRunner};

/// Job states that end a transform unsuccessfully.
const FAILED_JOB_STATES: [&str; 4] = ["FAILED", "TIMEOUT", "STOPPED", "ERROR"];

/// Job states reported while a transform is still in flight.
const PENDING_JOB_STATES: [&str; 4] = ["STARTING", "RUNNING", "STOPPING", "WAITING"];

/// External notification consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// An object was written to the destination store.
    ObjectCreated { key: String, etag: Option<String> },
    /// A transform job changed state.
    JobStateChanged { job_id: String, state: String },
    /// Schema discovery finished for a catalog target.
    CatalogRefreshed { target: String },
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ObjectCreated { key, .. } => write!(f, "object-created {key}"),
            Self::JobStateChanged { job_id, state } => write!(f, "job {job_id} {state}"),
            Self::CatalogRefreshed { target } => write!(f, "catalog-refreshed {target}"),
        }
    }
}

/// What a notification did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Transition {
        run_id: String,
        from: LaneState,
        to: LaneState,
    },
    /// The run already passed the stage this notification announces.
    Duplicate { run_id: String, state: LaneState },
    /// The notification does not concern any tracked export.
    Ignored { reason: String },
}

impl TransitionOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        Self::Ignored {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for TransitionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transition { run_id, from, to } => write!(f, "{run_id}: {from} -> {to}"),
            Self::Duplicate { run_id, state } => write!(f, "{run_id}: duplicate (already {state})"),
            Self::Ignored { reason } => write!(f, "ignored: {reason}"),
        }
    }
}

/// Run identity derived from the export object.
pub fn run_id(lane: LaneKind, key: &str, etag: &str) -> String {
    format!("{lane}:{key}@{etag}")
}

/// Event-driven controller for both lanes.
pub struct Orchestrator<'a> {
    config: &'a AppConfig,
    storage: &'a Storage,
    store: &'a dyn ObjectStore,
    jobs: &'a dyn JobRunner,
    catalog: &'a dyn CatalogRefresher,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a AppConfig,
        storage: &'a Storage,
        store: &'a dyn ObjectStore,
        jobs: &'a dyn JobRunner,
        catalog: &'a dyn CatalogRefresher,
    ) -> Self {
        Self {
            config,
            storage,
            store,
            jobs,
            catalog,
        }
    }

    /// Apply one notification.
    #[instrument(skip_all, fields(event = %event))]
    pub async fn handle(&self, event: &PipelineEvent) -> Result<Vec<TransitionOutcome>> {
        let outcomes = match event {
            PipelineEvent::ObjectCreated { key, etag } => {
                self.on_object_created(key, etag.as_deref()).await?
            }
            PipelineEvent::JobStateChanged { job_id, state } => {
                self.on_job_state(job_id, state).await?
            }
            PipelineEvent::CatalogRefreshed { target } => self.on_catalog_refreshed(target).await?,
        };
        for outcome in &outcomes {
            debug!(%outcome, "notification handled");
        }
        Ok(outcomes)
    }

    // -----------------------------------------------------------------------
    // Export detection
    // -----------------------------------------------------------------------

    async fn on_object_created(
        &self,
        key: &str,
        etag: Option<&str>,
    ) -> Result<Vec<TransitionOutcome>> {
        let Some(lane) = self.lane_for_export(key) else {
            return Ok(vec![TransitionOutcome::ignored(format!(
                "{key} is not under an export prefix"
            ))]);
        };
        if !key.ends_with(".csv") {
            return Ok(vec![TransitionOutcome::ignored(format!(
                "{key} is not a CSV export"
            ))]);
        }

        // Only the most recent export is transformed.
        let prefix = &self.config.lanes.get(lane).export_prefix;
        let latest = self
            .store
            .list(prefix)
            .await?
            .into_iter()
            .filter(|meta| meta.key.ends_with(".csv"))
            .next_back();
        let Some(latest) = latest else {
            return Ok(vec![TransitionOutcome::ignored(format!(
                "{key} no longer exists"
            ))]);
        };
        if latest.key != key {
            return Ok(vec![TransitionOutcome::ignored(format!(
                "{key} superseded by {}",
                latest.key
            ))]);
        }
        let etag = match etag {
            Some(etag) if etag != latest.etag => {
                return Ok(vec![TransitionOutcome::ignored(format!(
                    "{key} was overwritten since etag {etag}"
                ))]);
            }
            Some(etag) => etag.to_string(),
            None => latest.etag,
        };

        let run_id = run_id(lane, key, &etag);
        if let Some(existing) = self.storage.get_lane_run(&run_id).await? {
            return match existing.state {
                // Earlier delivery failed to start the job.
                LaneState::ExportDetected => Ok(vec![self.start_transform(&existing).await?]),
                LaneState::TransformFailed if latest.last_modified > existing.updated_at => {
                    self.retry_failed(&existing).await
                }
                state => Ok(vec![TransitionOutcome::Duplicate { run_id, state }]),
            };
        }

        let now = Utc::now();
        let run = LaneRun {
            run_id: run_id.clone(),
            lane,
            export_key: key.to_string(),
            export_etag: etag,
            state: LaneState::ExportDetected,
            job_id: None,
            detected_at: now,
            updated_at: now,
            detail: None,
        };
        if !self.storage.insert_lane_run(&run).await? {
            return Ok(vec![self.current_state(&run_id).await?]);
        }
        info!(%lane, %run_id, "export detected");

        let detected = TransitionOutcome::Transition {
            run_id,
            from: LaneState::Idle,
            to: LaneState::ExportDetected,
        };
        let started = self.start_transform(&run).await?;
        Ok(vec![detected, started])
    }

    /// The lane rewrote the export of a failed run: start a new attempt.
    async fn retry_failed(&self, run: &LaneRun) -> Result<Vec<TransitionOutcome>> {
        let moved = self
            .storage
            .transition_lane_run(
                &run.run_id,
                LaneState::TransformFailed,
                LaneState::ExportDetected,
                None,
                Some("export rewritten after failed transform"),
            )
            .await?;
        if !moved {
            return Ok(vec![self.current_state(&run.run_id).await?]);
        }
        info!(run_id = %run.run_id, "export rewritten; retrying failed transform");

        let retried = TransitionOutcome::Transition {
            run_id: run.run_id.clone(),
            from: LaneState::TransformFailed,
            to: LaneState::ExportDetected,
        };
        let started = self.start_transform(run).await?;
        Ok(vec![retried, started])
    }

    async fn start_transform(&self, run: &LaneRun) -> Result<TransitionOutcome> {
        let request = JobRequest {
            lane: run.lane,
            run_id: run.run_id.clone(),
            input_uri: self.store.uri(&run.export_key),
            output_uri: self.columnar_uri(run.lane),
        };

        let job_id = match self.jobs.start(&request).await {
            Ok(job_id) => job_id,
            Err(e) => {
                warn!(run_id = %run.run_id, error = %e, "transform job could not be started");
                self.storage
                    .set_lane_run_detail(&run.run_id, &e.to_string())
                    .await?;
                return Err(e);
            }
        };

        let moved = self
            .storage
            .transition_lane_run(
                &run.run_id,
                LaneState::ExportDetected,
                LaneState::TransformRunning,
                Some(&job_id),
                None,
            )
            .await?;
        if !moved {
            debug!(run_id = %run.run_id, %job_id, "run advanced concurrently; extra job is harmless");
            return self.current_state(&run.run_id).await;
        }

        info!(run_id = %run.run_id, %job_id, "transform running");
        Ok(TransitionOutcome::Transition {
            run_id: run.run_id.clone(),
            from: LaneState::ExportDetected,
            to: LaneState::TransformRunning,
        })
    }

    // -----------------------------------------------------------------------
    // Job status
    // -----------------------------------------------------------------------

    async fn on_job_state(&self, job_id: &str, state: &str) -> Result<Vec<TransitionOutcome>> {
        let Some(run) = self.storage.find_run_by_job(job_id).await? else {
            return Ok(vec![TransitionOutcome::ignored(format!(
                "unknown job id {job_id}"
            ))]);
        };
        let state = state.trim().to_ascii_uppercase();

        if state == "SUCCEEDED" {
            return match run.state {
                LaneState::TransformRunning => {
                    let moved = self
                        .storage
                        .transition_lane_run(
                            &run.run_id,
                            LaneState::TransformRunning,
                            LaneState::TransformSucceeded,
                            None,
                            None,
                        )
                        .await?;
                    if !moved {
                        return Ok(vec![self.current_state(&run.run_id).await?]);
                    }
                    info!(run_id = %run.run_id, %job_id, "transform succeeded");
                    let succeeded = TransitionOutcome::Transition {
                        run_id: run.run_id.clone(),
                        from: LaneState::TransformRunning,
                        to: LaneState::TransformSucceeded,
                    };
                    let refreshing = self.refresh_catalog(&run).await?;
                    Ok(vec![succeeded, refreshing])
                }
                // Earlier delivery failed to start the refresh.
                LaneState::TransformSucceeded => Ok(vec![self.refresh_catalog(&run).await?]),
                other => Ok(vec![TransitionOutcome::Duplicate {
                    run_id: run.run_id,
                    state: other,
                }]),
            };
        }

        if FAILED_JOB_STATES.contains(&state.as_str()) {
            let reason = ChatlakeError::TransformFailed {
                job_id: job_id.to_string(),
                state: state.clone(),
            }
            .to_string();
            let moved = self
                .storage
                .transition_lane_run(
                    &run.run_id,
                    LaneState::TransformRunning,
                    LaneState::TransformFailed,
                    None,
                    Some(&reason),
                )
                .await?;
            if !moved {
                return Ok(vec![self.current_state(&run.run_id).await?]);
            }
            warn!(run_id = %run.run_id, %job_id, %state, "transform failed; run halted");
            return Ok(vec![TransitionOutcome::Transition {
                run_id: run.run_id,
                from: LaneState::TransformRunning,
                to: LaneState::TransformFailed,
            }]);
        }

        let reason = if PENDING_JOB_STATES.contains(&state.as_str()) {
            format!("job {job_id} still in progress ({state})")
        } else {
            format!("job {job_id} reported unknown state {state}")
        };
        Ok(vec![TransitionOutcome::ignored(reason)])
    }

    // -----------------------------------------------------------------------
    // Catalog
    // -----------------------------------------------------------------------

    async fn refresh_catalog(&self, run: &LaneRun) -> Result<TransitionOutcome> {
        let request = CatalogRequest {
            target: self.config.lanes.get(run.lane).catalog_target.clone(),
            path: self.columnar_uri(run.lane),
        };

        if let Err(e) = self.catalog.refresh(&request).await {
            warn!(run_id = %run.run_id, error = %e, "catalog refresh could not be started");
            self.storage
                .set_lane_run_detail(&run.run_id, &e.to_string())
                .await?;
            return Err(e);
        }

        let moved = self
            .storage
            .transition_lane_run(
                &run.run_id,
                LaneState::TransformSucceeded,
                LaneState::CatalogRefreshing,
                None,
                None,
            )
            .await?;
        if !moved {
            return self.current_state(&run.run_id).await;
        }
        Ok(TransitionOutcome::Transition {
            run_id: run.run_id.clone(),
            from: LaneState::TransformSucceeded,
            to: LaneState::CatalogRefreshing,
        })
    }

    async fn on_catalog_refreshed(&self, target: &str) -> Result<Vec<TransitionOutcome>> {
        let lane = LaneKind::ALL
            .into_iter()
            .find(|lane| self.config.lanes.get(*lane).catalog_target == target);
        let Some(lane) = lane else {
            return Ok(vec![TransitionOutcome::ignored(format!(
                "no lane uses catalog target {target}"
            ))]);
        };

        let runs = self
            .storage
            .lane_runs_in_state(lane, LaneState::CatalogRefreshing)
            .await?;
        if runs.is_empty() {
            return Ok(vec![TransitionOutcome::ignored(format!(
                "no {lane} run awaiting catalog refresh"
            ))]);
        }

        let mut outcomes = Vec::with_capacity(runs.len());
        for run in runs {
            let moved = self
                .storage
                .transition_lane_run(
                    &run.run_id,
                    LaneState::CatalogRefreshing,
                    LaneState::Queryable,
                    None,
                    None,
                )
                .await?;
            if moved {
                info!(run_id = %run.run_id, "run queryable");
                outcomes.push(TransitionOutcome::Transition {
                    run_id: run.run_id,
                    from: LaneState::CatalogRefreshing,
                    to: LaneState::Queryable,
                });
            }
        }
        Ok(outcomes)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn lane_for_export(&self, key: &str) -> Option<LaneKind> {
        LaneKind::ALL
            .into_iter()
            .find(|lane| key.starts_with(&self.config.lanes.get(*lane).export_prefix))
    }

    /// Fixed columnar output location of a lane.
    fn columnar_uri(&self, lane: LaneKind) -> String {
        self.store
            .uri(&format!("{}{lane}/", self.config.destination.columnar_prefix))
    }

    async fn current_state(&self, run_id: &str) -> Result<TransitionOutcome> {
        let run = self
            .storage
            .get_lane_run(run_id)
            .await?
            .ok_or_else(|| ChatlakeError::Storage(format!("run {run_id} vanished")))?;
        Ok(TransitionOutcome::Duplicate {
            run_id: run.run_id,
            state: run.state,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chatlake_artifacts::LocalObjectStore;
    use uuid::Uuid;

    use super::*;

    const NORM_PREFIX: &str = "reports/normalized/";

    #[derive(Default)]
    struct RecordingJobs {
        requests: Mutex<Vec<JobRequest>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl JobRunner for RecordingJobs {
        async fn start(&self, request: &JobRequest) -> Result<String> {
            if *self.fail.lock().unwrap() {
                return Err(ChatlakeError::Trigger("job service down".into()));
            }
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            Ok(format!("jr_{}", requests.len()))
        }
    }

    #[derive(Default)]
    struct RecordingCatalog {
        requests: Mutex<Vec<CatalogRequest>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl CatalogRefresher for RecordingCatalog {
        async fn refresh(&self, request: &CatalogRequest) -> Result<()> {
            if *self.fail.lock().unwrap() {
                return Err(ChatlakeError::Trigger("catalog down".into()));
            }
            self.requests.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        config: AppConfig,
        storage: Storage,
        store: LocalObjectStore,
        jobs: RecordingJobs,
        catalog: RecordingCatalog,
    }

    impl Harness {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let db = std::env::temp_dir().join(format!("cl_test_{}.db", Uuid::now_v7()));
            Self {
                config: AppConfig::default(),
                storage: Storage::open(&db).await.unwrap(),
                store: LocalObjectStore::new(dir.path()),
                _dir: dir,
                jobs: RecordingJobs::default(),
                catalog: RecordingCatalog::default(),
            }
        }

        fn orchestrator(&self) -> Orchestrator<'_> {
            Orchestrator::new(
                &self.config,
                &self.storage,
                &self.store,
                &self.jobs,
                &self.catalog,
            )
        }

        async fn export(&self, date: &str) -> PipelineEvent {
            let key = format!("{NORM_PREFIX}{date}/usuarios_normalizados.csv");
            let meta = self
                .store
                .put(&key, date.as_bytes(), "text/csv")
                .await
                .unwrap();
            PipelineEvent::ObjectCreated {
                key,
                etag: Some(meta.etag),
            }
        }

        async fn single_run(&self) -> LaneRun {
            let runs = self.storage.list_lane_runs(None, 10).await.unwrap();
            assert_eq!(runs.len(), 1);
            runs.into_iter().next().unwrap()
        }
    }

    fn job(job_id: &str, state: &str) -> PipelineEvent {
        PipelineEvent::JobStateChanged {
            job_id: job_id.into(),
            state: state.into(),
        }
    }

    fn states(outcomes: &[TransitionOutcome]) -> Vec<LaneState> {
        outcomes
            .iter()
            .filter_map(|o| match o {
                TransitionOutcome::Transition { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn happy_path_reaches_queryable() {
        let h = Harness::new().await;
        let orch = h.orchestrator();

        let out = orch.handle(&h.export("2025-08-04").await).await.unwrap();
        assert_eq!(
            states(&out),
            vec![LaneState::ExportDetected, LaneState::TransformRunning]
        );
        {
            let requests = h.jobs.requests.lock().unwrap();
            assert_eq!(requests.len(), 1);
            assert!(requests[0].input_uri.ends_with("2025-08-04/usuarios_normalizados.csv"));
            assert!(requests[0].output_uri.ends_with("reports/columnar/normalization/"));
        }

        let out = orch.handle(&job("jr_1", "SUCCEEDED")).await.unwrap();
        assert_eq!(
            states(&out),
            vec![LaneState::TransformSucceeded, LaneState::CatalogRefreshing]
        );
        {
            let requests = h.catalog.requests.lock().unwrap();
            assert_eq!(requests.len(), 1);
            assert_eq!(requests[0].target, h.config.lanes.normalization.catalog_target);
            assert!(requests[0].path.ends_with("reports/columnar/normalization/"));
        }

        let target = h.config.lanes.normalization.catalog_target.clone();
        let out = orch
            .handle(&PipelineEvent::CatalogRefreshed { target })
            .await
            .unwrap();
        assert_eq!(states(&out), vec![LaneState::Queryable]);

        let run = h.single_run().await;
        assert_eq!(run.state, LaneState::Queryable);
        assert_eq!(run.job_id.as_deref(), Some("jr_1"));
    }

    #[tokio::test]
    async fn non_export_paths_never_start_a_job() {
        let h = Harness::new().await;
        let orch = h.orchestrator();
        h.store
            .put("reports/normalized/manifest.json", b"{}", "application/json")
            .await
            .unwrap();

        for key in ["reports/normalized/manifest.json", "uploads/2025-08-04/x.csv"] {
            let out = orch
                .handle(&PipelineEvent::ObjectCreated {
                    key: key.into(),
                    etag: None,
                })
                .await
                .unwrap();
            assert!(matches!(out[..], [TransitionOutcome::Ignored { .. }]), "{key}");
        }
        assert!(h.jobs.requests.lock().unwrap().is_empty());
        assert!(h.storage.list_lane_runs(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_object_notification_is_noop() {
        let h = Harness::new().await;
        let orch = h.orchestrator();
        let event = h.export("2025-08-04").await;

        orch.handle(&event).await.unwrap();
        let out = orch.handle(&event).await.unwrap();
        assert!(matches!(
            out[..],
            [TransitionOutcome::Duplicate {
                state: LaneState::TransformRunning,
                ..
            }]
        ));
        assert_eq!(h.jobs.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn superseded_export_is_ignored() {
        let h = Harness::new().await;
        let orch = h.orchestrator();
        let old = h.export("2025-08-03").await;
        let new = h.export("2025-08-04").await;

        let out = orch.handle(&old).await.unwrap();
        assert!(matches!(out[..], [TransitionOutcome::Ignored { .. }]));
        let out = orch.handle(&new).await.unwrap();
        assert_eq!(states(&out).len(), 2);
        assert_eq!(h.jobs.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_success_refreshes_at_most_once() {
        let h = Harness::new().await;
        let orch = h.orchestrator();
        orch.handle(&h.export("2025-08-04").await).await.unwrap();

        orch.handle(&job("jr_1", "SUCCEEDED")).await.unwrap();
        let out = orch.handle(&job("jr_1", "succeeded")).await.unwrap();
        assert!(matches!(
            out[..],
            [TransitionOutcome::Duplicate {
                state: LaneState::CatalogRefreshing,
                ..
            }]
        ));
        assert_eq!(h.catalog.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_job_is_terminal() {
        let h = Harness::new().await;
        let orch = h.orchestrator();
        orch.handle(&h.export("2025-08-04").await).await.unwrap();

        let out = orch.handle(&job("jr_1", "TIMEOUT")).await.unwrap();
        assert_eq!(states(&out), vec![LaneState::TransformFailed]);

        // A late success cannot revive the run.
        let out = orch.handle(&job("jr_1", "SUCCEEDED")).await.unwrap();
        assert!(matches!(
            out[..],
            [TransitionOutcome::Duplicate {
                state: LaneState::TransformFailed,
                ..
            }]
        ));
        let run = h.single_run().await;
        assert_eq!(run.state, LaneState::TransformFailed);
        assert!(run.detail.unwrap().contains("TIMEOUT"));
        assert!(h.catalog.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rerun_after_failed_transform_starts_new_job() {
        let h = Harness::new().await;
        let orch = h.orchestrator();
        let event = h.export("2025-08-04").await;
        orch.handle(&event).await.unwrap();
        orch.handle(&job("jr_1", "FAILED")).await.unwrap();

        // Redelivery of the original notification does not revive the run.
        let out = orch.handle(&event).await.unwrap();
        assert!(matches!(
            out[..],
            [TransitionOutcome::Duplicate {
                state: LaneState::TransformFailed,
                ..
            }]
        ));

        // Same-date rerun rewrites identical bytes.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let rerun = h.export("2025-08-04").await;
        assert_eq!(rerun, event);
        let out = orch.handle(&rerun).await.unwrap();
        assert_eq!(
            states(&out),
            vec![LaneState::ExportDetected, LaneState::TransformRunning]
        );
        assert_eq!(h.jobs.requests.lock().unwrap().len(), 2);

        let run = h.single_run().await;
        assert_eq!(run.state, LaneState::TransformRunning);
        assert_eq!(run.job_id.as_deref(), Some("jr_2"));

        // The failed job no longer maps to the run.
        let out = orch.handle(&job("jr_1", "SUCCEEDED")).await.unwrap();
        assert!(matches!(out[..], [TransitionOutcome::Ignored { .. }]));
        let out = orch.handle(&job("jr_2", "SUCCEEDED")).await.unwrap();
        assert_eq!(
            states(&out),
            vec![LaneState::TransformSucceeded, LaneState::CatalogRefreshing]
        );
    }

    #[tokio::test]
    async fn pending_and_unknown_jobs_are_ignored() {
        let h = Harness::new().await;
        let orch = h.orchestrator();
        orch.handle(&h.export("2025-08-04").await).await.unwrap();

        for event in [job("jr_1", "RUNNING"), job("jr_1", "EXPLODED"), job("jr_99", "SUCCEEDED")] {
            let out = orch.handle(&event).await.unwrap();
            assert!(matches!(out[..], [TransitionOutcome::Ignored { .. }]));
        }
        assert_eq!(h.single_run().await.state, LaneState::TransformRunning);
    }

    #[tokio::test]
    async fn failed_job_trigger_is_retried_on_redelivery() {
        let h = Harness::new().await;
        let orch = h.orchestrator();
        let event = h.export("2025-08-04").await;

        *h.jobs.fail.lock().unwrap() = true;
        let err = orch.handle(&event).await.unwrap_err();
        assert!(matches!(err, ChatlakeError::Trigger(_)));
        let run = h.single_run().await;
        assert_eq!(run.state, LaneState::ExportDetected);
        assert!(run.detail.unwrap().contains("job service down"));

        *h.jobs.fail.lock().unwrap() = false;
        let out = orch.handle(&event).await.unwrap();
        assert_eq!(states(&out), vec![LaneState::TransformRunning]);
    }

    #[tokio::test]
    async fn failed_catalog_trigger_is_retried_on_redelivery() {
        let h = Harness::new().await;
        let orch = h.orchestrator();
        orch.handle(&h.export("2025-08-04").await).await.unwrap();

        *h.catalog.fail.lock().unwrap() = true;
        assert!(orch.handle(&job("jr_1", "SUCCEEDED")).await.is_err());
        assert_eq!(h.single_run().await.state, LaneState::TransformSucceeded);

        *h.catalog.fail.lock().unwrap() = false;
        let out = orch.handle(&job("jr_1", "SUCCEEDED")).await.unwrap();
        assert_eq!(states(&out), vec![LaneState::CatalogRefreshing]);
    }

    #[tokio::test]
    async fn catalog_notification_for_unknown_target_is_ignored() {
        let h = Harness::new().await;
        let out = h
            .orchestrator()
            .handle(&PipelineEvent::CatalogRefreshed {
                target: "someone_else".into(),
            })
            .await
            .unwrap();
        assert!(matches!(out[..], [TransitionOutcome::Ignored { .. }]));
    }

    #[test]
    fn run_id_format() {
        assert_eq!(
            run_id(LaneKind::Tokens, "reports/tokens/2025-08-04/token_usage.csv", "ab"),
            "tokens:reports/tokens/2025-08-04/token_usage.csv@ab"
        );
    }
}
