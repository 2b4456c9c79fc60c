//! Lane runners: scan → build → encode → export.
//!
//! Each lane is a single pass over its source table. Record-level problems
//! are absorbed into the [`RunSummary`]; anything else aborts the run before
//! an export is written, so a failed run leaves no new object behind.

use std::pin::pin;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use futures::TryStreamExt;
use tracing::{debug, info, instrument, warn};

use chatlake_artifacts::{
    CSV_CONTENT_TYPE, JSON_CONTENT_TYPE, MANIFEST_FILE, NORMALIZED_FILE, ObjectMeta, ObjectStore,
    TOKEN_USAGE_FILE, encode_normalized, encode_token_usage, export_key, manifest,
};
use chatlake_shared::{
    AppConfig, ChatlakeError, ConversationRecord, LaneKind, Result, RunSummary, TokenUsageRow,
};
use chatlake_source::{ItemKind, KeyValueSource, item_key, parse_item, scan};
use chatlake_storage::Storage;

use crate::dataset::Dataset;
use crate::normalize::normalize;
use crate::tokens::{TokenEstimate, TokenEstimator, summarize};

/// How often (in items) scan progress is reported.
const PROGRESS_EVERY: usize = 250;

/// Collaborators shared by both lanes.
pub struct LaneContext<'a> {
    pub config: &'a AppConfig,
    pub source: &'a dyn KeyValueSource,
    pub store: &'a dyn ObjectStore,
    pub storage: &'a Storage,
}

/// Result of a successful lane run.
#[derive(Debug, Clone)]
pub struct LaneReport {
    pub lane: LaneKind,
    pub run_date: NaiveDate,
    pub summary: RunSummary,
    /// The export object written by this run.
    pub export: ObjectMeta,
    pub elapsed: Duration,
}

/// Progress callback for lane runs.
pub trait ProgressReporter: Send + Sync {
    /// Called when a new phase starts.
    fn phase(&self, name: &str);
    /// Called periodically while the source is scanned.
    fn items_scanned(&self, count: usize);
    /// Called once the export is written.
    fn done(&self, report: &LaneReport);
}

/// No-op progress reporter.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn items_scanned(&self, _count: usize) {}
    fn done(&self, _report: &LaneReport) {}
}

/// Run one lane for `run_date` and record its summary.
///
/// The summary is stored for failed runs too, with the error message.
#[instrument(skip_all, fields(lane = %lane, date = %run_date))]
pub async fn run_lane(
    ctx: &LaneContext<'_>,
    lane: LaneKind,
    run_date: NaiveDate,
    progress: &dyn ProgressReporter,
) -> Result<LaneReport> {
    let started_at = Utc::now();
    let start = Instant::now();
    let mut summary = RunSummary::default();

    let result = match lane {
        LaneKind::Normalization => run_normalization(ctx, run_date, progress, &mut summary).await,
        LaneKind::Tokens => run_tokens(ctx, run_date, progress, &mut summary).await,
    };

    match result {
        Ok(export) => {
            ctx.storage
                .insert_run_summary(lane, run_date, started_at, None, &summary)
                .await?;
            let report = LaneReport {
                lane,
                run_date,
                summary,
                export,
                elapsed: start.elapsed(),
            };
            info!(
                key = %report.export.key,
                rows = report.summary.rows_written,
                scanned = report.summary.items_scanned,
                malformed = report.summary.malformed_count,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "lane run complete"
            );
            progress.done(&report);
            Ok(report)
        }
        Err(e) => {
            warn!(error = %e, "lane run failed; no export written");
            let message = e.to_string();
            if let Err(store_err) = ctx
                .storage
                .insert_run_summary(lane, run_date, started_at, Some(&message), &summary)
                .await
            {
                warn!(error = %store_err, "failed to record run summary");
            }
            Err(e)
        }
    }
}

async fn run_normalization(
    ctx: &LaneContext<'_>,
    run_date: NaiveDate,
    progress: &dyn ProgressReporter,
    summary: &mut RunSummary,
) -> Result<ObjectMeta> {
    let lane = ctx.config.lanes.get(LaneKind::Normalization);

    progress.phase("Scanning");
    let data = collect(ctx, &lane.table, progress, summary).await?;

    progress.phase("Normalizing");
    let rows = normalize(&data);
    let body = encode_normalized(&rows)?;

    progress.phase("Exporting");
    let key = export_key(&lane.export_prefix, run_date, NORMALIZED_FILE);
    let export = ctx.store.put(&key, &body, CSV_CONTENT_TYPE).await?;

    // Best effort once the export exists.
    let manifest_key = format!("{}{MANIFEST_FILE}", lane.export_prefix);
    match write_manifest(ctx, &manifest_key, &key).await {
        Ok(()) => debug!(%manifest_key, "dashboard manifest updated"),
        Err(e) => warn!(%manifest_key, error = %e, "dashboard manifest not updated"),
    }

    summary.rows_written = rows.len();
    summary.export_key = Some(export.key.clone());
    summary.export_etag = Some(export.etag.clone());
    Ok(export)
}

async fn write_manifest(
    ctx: &LaneContext<'_>,
    manifest_key: &str,
    export_key: &str,
) -> Result<()> {
    let body = manifest(&ctx.store.uri(export_key))?;
    ctx.store.put(manifest_key, &body, JSON_CONTENT_TYPE).await?;
    Ok(())
}

async fn run_tokens(
    ctx: &LaneContext<'_>,
    run_date: NaiveDate,
    progress: &dyn ProgressReporter,
    summary: &mut RunSummary,
) -> Result<ObjectMeta> {
    let lane = ctx.config.lanes.get(LaneKind::Tokens);
    // Fail on an unknown model before touching the source.
    let estimator = TokenEstimator::from_config(&ctx.config.estimator)?;

    progress.phase("Scanning");
    let data = collect(ctx, &lane.table, progress, summary).await?;

    progress.phase("Estimating");
    let mut conversations: Vec<&ConversationRecord> = data.conversations().collect();
    conversations.sort_by(|a, b| a.chronological(b));
    let estimates: Vec<TokenEstimate> = conversations
        .into_iter()
        .map(|c| estimator.estimate(c))
        .collect();

    let totals = summarize(&estimates);
    info!(
        conversations = totals.conversations,
        input_tokens = totals.input_tokens,
        output_tokens = totals.output_tokens,
        input_cost_usd = totals.input_cost_usd,
        output_cost_usd = totals.output_cost_usd,
        total_cost_usd = totals.total_cost_usd,
        average_cost_usd = totals.average_cost_per_conversation,
        "token usage estimated"
    );

    let rows: Vec<TokenUsageRow> = estimates.into_iter().map(|e| e.row).collect();
    let body = encode_token_usage(&rows)?;

    progress.phase("Exporting");
    let key = export_key(&lane.export_prefix, run_date, TOKEN_USAGE_FILE);
    let export = ctx.store.put(&key, &body, CSV_CONTENT_TYPE).await?;

    summary.rows_written = rows.len();
    summary.export_key = Some(export.key.clone());
    summary.export_etag = Some(export.etag.clone());
    summary.token_totals = Some(totals);
    Ok(export)
}

/// Scan `table` into a [`Dataset`], filling the scan counters of `summary`.
async fn collect(
    ctx: &LaneContext<'_>,
    table: &str,
    progress: &dyn ProgressReporter,
    summary: &mut RunSummary,
) -> Result<Dataset> {
    let since = ctx.config.source.since;
    let mut data = Dataset::new();
    let mut items = pin!(scan(ctx.source, table));

    while let Some(item) = items.try_next().await? {
        summary.items_scanned += 1;
        if summary.items_scanned % PROGRESS_EVERY == 0 {
            progress.items_scanned(summary.items_scanned);
        }

        let parsed = match parse_item(&item) {
            Ok(parsed) => parsed,
            Err(ChatlakeError::RecordMalformed { key, reason }) => {
                warn!(%key, %reason, "skipping malformed item");
                summary.record_malformed(key, reason);
                continue;
            }
            Err(e) => return Err(e),
        };

        if let Some(profile) = parsed.profile {
            data.add_profile(profile);
        }

        match parsed.kind {
            ItemKind::Conversation(record) => {
                // Undated conversations cannot be placed before `since`; keep them.
                if since.is_some_and(|since| record.date().is_some_and(|date| date < since)) {
                    summary.filtered_items += 1;
                    continue;
                }
                if let Some(issue) = parsed.history_issue {
                    debug!(key = %item_key(&item), %issue, "conversation kept without history");
                    summary.malformed_histories += 1;
                }
                if !data.add_conversation(record) {
                    debug!(key = %item_key(&item), "repeated conversation");
                }
            }
            ItemKind::Feedback(entries) => {
                for entry in entries {
                    data.add_feedback(entry);
                }
            }
            ItemKind::Register => {}
            ItemKind::Ignored => summary.ignored_items += 1,
        }
    }
    progress.items_scanned(summary.items_scanned);

    summary.conversations = data.conversation_count();
    summary.feedback_entries = data.feedback().len();
    summary.profiles = data.profile_count();
    info!(
        %table,
        scanned = summary.items_scanned,
        conversations = summary.conversations,
        feedback = summary.feedback_entries,
        malformed = summary.malformed_count,
        "scan complete"
    );
    Ok(data)
}
