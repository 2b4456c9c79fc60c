//! Core domain logic and pipeline orchestration for chatlake.
//!
//! - [`classify`], [`normalize`], [`tokens`]: pure per-run computations
//! - [`pipeline`]: the normalization and token lanes (scan → export)
//! - [`orchestrator`]: export → transform → catalog state machine, driven by
//!   notifications decoded in [`notification`]
//! - [`jobs`], [`catalog`]: external collaborators the orchestrator triggers

pub mod catalog;
pub mod classify;
pub mod dataset;
pub mod jobs;
pub mod normalize;
pub mod notification;
pub mod orchestrator;
pub mod pipeline;
pub mod tokens;

pub use catalog::{
    CatalogRefresher, CatalogRequest, HttpCatalogRefresher, LogOnlyCatalogRefresher, refresher_for,
};
pub use classify::{classify_feedback, classify_ratings};
pub use dataset::Dataset;
pub use jobs::{CommandJobRunner, JobRequest, JobRunner};
pub use normalize::normalize;
pub use notification::parse_notifications;
pub use orchestrator::{Orchestrator, PipelineEvent, TransitionOutcome, run_id};
pub use pipeline::{LaneContext, LaneReport, ProgressReporter, SilentProgress, run_lane};
pub use tokens::{TariffTable, TokenEstimate, TokenEstimator, estimate_tokens, summarize};
