//! Shared types, error model, and configuration for chatlake.
//!
//! This crate is the foundation depended on by all other chatlake crates.
//! It provides:
//! - [`ChatlakeError`], the unified error type
//! - Domain types ([`ConversationRecord`], [`FeedbackEntry`], [`NormalizedRow`],
//!   [`TokenUsageRow`], [`LaneState`], [`RunSummary`])
//! - Configuration ([`AppConfig`], config loading and validation)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CatalogConfig, DestinationConfig, EstimatorConfig, LaneConfig, LanesConfig,
    SourceConfig, StateConfig, TariffRate, TransformConfig, config_dir, config_file_path,
    init_config, load_config, load_config_from,
};
pub use error::{ChatlakeError, Result};
pub use types::{
    ConversationRecord, FeedbackEntry, FeedbackLabel, INVALID_DATE_SENTINEL, LaneKind, LaneState,
    MALFORMED_SAMPLE_LIMIT, MalformedSample, NO_DATE_SENTINEL, NORMALIZED_COLUMNS, NormalizedRow,
    REPORT_DATE_FORMAT, RawRating, Role, RunSummary, TOKEN_USAGE_COLUMNS, TokenTotals,
    TokenUsageRow, Turn, UserProfile, format_report_date,
};
