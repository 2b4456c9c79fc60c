//! Core domain types for chatlake: source records, export rows, lane state.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// Date format used in every exported row (`DD/MM/YYYY`).
pub const REPORT_DATE_FORMAT: &str = "%d/%m/%Y";

/// Stable sentinel for `fecha_primera_conversacion` when a user has no dated conversation.
pub const NO_DATE_SENTINEL: &str = "Sin fecha";

/// `fecha` of a token row whose conversation has no readable timestamp.
pub const INVALID_DATE_SENTINEL: &str = "Fecha inválida";

/// Column order of the row-oriented normalization export.
pub const NORMALIZED_COLUMNS: [&str; 12] = [
    "usuario_id",
    "nombre",
    "gerencia",
    "ciudad",
    "fecha_primera_conversacion",
    "numero_conversaciones",
    "conversacion_completa",
    "feedback_total",
    "numero_feedback",
    "pregunta_conversacion",
    "feedback",
    "respuesta_feedback",
];

/// Column order of the token usage export.
pub const TOKEN_USAGE_COLUMNS: [&str; 9] = [
    "conversation_id",
    "user_id",
    "fecha",
    "token_pregunta",
    "token_respuesta",
    "tokens_total",
    "costo_estimado_usd",
    "modelo",
    "region",
];

/// Format a date the way every export presents it.
pub fn format_report_date(date: NaiveDate) -> String {
    date.format(REPORT_DATE_FORMAT).to_string()
}

// ---------------------------------------------------------------------------
// Source records
// ---------------------------------------------------------------------------

/// Snapshot of a user's profile as seen at extraction time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: String,
    pub name: Option<String>,
    pub department: Option<String>,
    pub city: Option<String>,
}

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Resolve the role names found in source data (`usuario`, `bot`, `instruction`, ...).
    pub fn from_alias(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" | "usuario" | "human" => Some(Self::User),
            "assistant" | "bot" | "catia" => Some(Self::Assistant),
            "system" | "instruction" => Some(Self::System),
            _ => None,
        }
    }

    /// Short label used when rendering a conversation transcript.
    pub fn transcript_label(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "bot",
            Self::System => "system",
        }
    }
}

/// One turn of a conversation, optionally with retrieval chunks attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub chunks: Vec<String>,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            chunks: Vec::new(),
        }
    }
}

/// A conversation as read from the source table.
///
/// `history` is `None` when the stored history was missing or could not be
/// parsed, and `timestamp` is `None` when no readable creation time was
/// stored. Either way the conversation still counts toward per-user totals.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    pub user_id: String,
    pub conversation_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub history: Option<Vec<Turn>>,
}

impl ConversationRecord {
    /// Oldest first, undated conversations last, ties broken by id.
    pub fn chronological(&self, other: &Self) -> std::cmp::Ordering {
        match (self.timestamp, other.timestamp) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
        .then_with(|| self.conversation_id.cmp(&other.conversation_id))
    }

    /// Calendar date of the conversation, if it has one.
    pub fn date(&self) -> Option<NaiveDate> {
        self.timestamp.map(|ts| ts.date_naive())
    }
}

/// Rating attached to a feedback entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawRating {
    Like,
    Dislike,
    Unset,
}

impl RawRating {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("like") => Self::Like,
            Some("dislike") => Self::Dislike,
            _ => Self::Unset,
        }
    }

    pub fn as_str(self) -> Option<&'static str> {
        match self {
            Self::Like => Some("like"),
            Self::Dislike => Some("dislike"),
            Self::Unset => None,
        }
    }
}

/// A single piece of user feedback. `conversation_id` may be absent.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackEntry {
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub raw_rating: RawRating,
    pub comment: Option<String>,
    /// Structured choice data, kept as decoded JSON.
    pub options: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Per-user feedback label written to the `feedback` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackLabel {
    /// No rated feedback at all. Written as `"none"`, never left empty.
    None,
    Like,
    Dislike,
    Mixed,
}

impl FeedbackLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Like => "like",
            Self::Dislike => "dislike",
            Self::Mixed => "mixed",
        }
    }
}

impl std::fmt::Display for FeedbackLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Export rows
// ---------------------------------------------------------------------------

/// One row of the normalization export, one per user per run.
///
/// Field order is the column order of the exported file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRow {
    pub usuario_id: String,
    pub nombre: String,
    pub gerencia: String,
    pub ciudad: String,
    pub fecha_primera_conversacion: String,
    pub numero_conversaciones: usize,
    pub conversacion_completa: String,
    pub feedback_total: String,
    pub numero_feedback: usize,
    pub pregunta_conversacion: String,
    pub feedback: FeedbackLabel,
    pub respuesta_feedback: String,
}

/// One row of the token usage export, one per conversation per run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenUsageRow {
    pub conversation_id: String,
    pub user_id: String,
    pub fecha: String,
    pub token_pregunta: u64,
    pub token_respuesta: u64,
    pub tokens_total: u64,
    #[serde(serialize_with = "serialize_usd")]
    pub costo_estimado_usd: f64,
    pub modelo: String,
    pub region: String,
}

/// USD amounts are written with a fixed six decimal places.
fn serialize_usd<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{value:.6}"))
}

// ---------------------------------------------------------------------------
// Lanes and runs
// ---------------------------------------------------------------------------

/// An independently scheduled, independently sourced sub-pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaneKind {
    Normalization,
    Tokens,
}

impl LaneKind {
    pub const ALL: [LaneKind; 2] = [LaneKind::Normalization, LaneKind::Tokens];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normalization => "normalization",
            Self::Tokens => "tokens",
        }
    }
}

impl std::fmt::Display for LaneKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LaneKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "normalization" => Ok(Self::Normalization),
            "tokens" => Ok(Self::Tokens),
            other => Err(format!("unknown lane '{other}'")),
        }
    }
}

/// Stage of one export run as it moves through the downstream pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LaneState {
    Idle,
    ExportDetected,
    TransformRunning,
    TransformSucceeded,
    TransformFailed,
    CatalogRefreshing,
    Queryable,
}

impl LaneState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ExportDetected => "export_detected",
            Self::TransformRunning => "transform_running",
            Self::TransformSucceeded => "transform_succeeded",
            Self::TransformFailed => "transform_failed",
            Self::CatalogRefreshing => "catalog_refreshing",
            Self::Queryable => "queryable",
        }
    }

}

impl std::fmt::Display for LaneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LaneState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "export_detected" => Ok(Self::ExportDetected),
            "transform_running" => Ok(Self::TransformRunning),
            "transform_succeeded" => Ok(Self::TransformSucceeded),
            "transform_failed" => Ok(Self::TransformFailed),
            "catalog_refreshing" => Ok(Self::CatalogRefreshing),
            "queryable" => Ok(Self::Queryable),
            other => Err(format!("unknown lane state '{other}'")),
        }
    }
}

/// A record-level problem kept for the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedSample {
    pub key: String,
    pub reason: String,
}

/// Aggregated outcome of one lane run, persisted alongside lane state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub items_scanned: usize,
    pub conversations: usize,
    pub feedback_entries: usize,
    pub profiles: usize,
    pub ignored_items: usize,
    pub filtered_items: usize,
    pub malformed_count: usize,
    pub malformed_sample: Vec<MalformedSample>,
    pub malformed_histories: usize,
    pub rows_written: usize,
    pub export_key: Option<String>,
    pub export_etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_totals: Option<TokenTotals>,
}

/// Maximum number of malformed records kept verbatim in a summary.
pub const MALFORMED_SAMPLE_LIMIT: usize = 20;

impl RunSummary {
    /// Record a skipped item, keeping only a bounded sample of details.
    pub fn record_malformed(&mut self, key: impl Into<String>, reason: impl Into<String>) {
        self.malformed_count += 1;
        if self.malformed_sample.len() < MALFORMED_SAMPLE_LIMIT {
            self.malformed_sample.push(MalformedSample {
                key: key.into(),
                reason: reason.into(),
            });
        }
    }
}

/// Aggregate token and cost figures for a token-lane run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub conversations: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub input_cost_usd: f64,
    pub output_cost_usd: f64,
    pub total_cost_usd: f64,
    pub average_cost_per_conversation: f64,
    pub average_input_tokens: f64,
    pub average_output_tokens: f64,
}
