//! Normalizer: one [`NormalizedRow`] per user from profiles, conversations and feedback.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use chatlake_shared::{
    ConversationRecord, FeedbackEntry, NO_DATE_SENTINEL, NormalizedRow, Role, format_report_date,
};

use crate::classify::classify_feedback;
use crate::dataset::Dataset;

/// Name used when no profile carried one.
pub const DEFAULT_NAME: &str = "Usuario Anónimo";

/// Department/city used when neither is known.
pub const DEFAULT_LOCATION: &str = "No especificada";

/// Longest rendering of a single conversation in `conversacion_completa`.
const TRANSCRIPT_LIMIT: usize = 300;

const FIELD_SEPARATOR: &str = " | ";
const CONVERSATION_SEPARATOR: &str = " || ";

#[derive(Default)]
struct UserRecords<'a> {
    conversations: Vec<&'a ConversationRecord>,
    feedback: Vec<&'a FeedbackEntry>,
}

/// Build one row per user present in either conversations or feedback,
/// ordered by user id.
pub fn normalize(dataset: &Dataset) -> Vec<NormalizedRow> {
    let mut users: BTreeMap<&str, UserRecords<'_>> = BTreeMap::new();
    for conversation in dataset.conversations() {
        users
            .entry(conversation.user_id.as_str())
            .or_default()
            .conversations
            .push(conversation);
    }
    for entry in dataset.feedback() {
        users
            .entry(entry.user_id.as_str())
            .or_default()
            .feedback
            .push(entry);
    }

    users
        .into_iter()
        .map(|(user_id, mut records)| {
            records
                .conversations
                .sort_by(|a, b| a.chronological(b));
            build_row(dataset, user_id, &records)
        })
        .collect()
}

fn build_row(dataset: &Dataset, user_id: &str, records: &UserRecords<'_>) -> NormalizedRow {
    let profile = dataset.profile(user_id);
    let name = profile.and_then(|p| p.name.clone());
    let department = profile.and_then(|p| p.department.clone());
    let city = profile.and_then(|p| p.city.clone());

    // Conversations are sorted with undated ones last, so the first one
    // carries the minimum timestamp when any is dated.
    let first_date = records
        .conversations
        .first()
        .and_then(|c| c.date())
        .map(format_report_date)
        .unwrap_or_else(|| NO_DATE_SENTINEL.to_string());

    NormalizedRow {
        usuario_id: user_id.to_string(),
        nombre: name.unwrap_or_else(|| DEFAULT_NAME.to_string()),
        gerencia: department
            .clone()
            .or_else(|| city.clone())
            .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
        ciudad: city
            .or(department)
            .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
        fecha_primera_conversacion: first_date,
        numero_conversaciones: records.conversations.len(),
        conversacion_completa: render_transcripts(&records.conversations),
        feedback_total: render_feedback_total(&records.feedback),
        numero_feedback: records.feedback.len(),
        pregunta_conversacion: user_questions(&records.conversations),
        feedback: classify_feedback(records.feedback.iter().copied()),
        respuesta_feedback: feedback_responses(&records.feedback),
    }
}

/// Collapse runs of whitespace (including newlines) into single spaces.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// User-turn texts across conversations, in chronological order.
/// Conversations whose history is unusable are skipped.
fn user_questions(conversations: &[&ConversationRecord]) -> String {
    conversations
        .iter()
        .filter_map(|c| c.history.as_deref())
        .flatten()
        .filter(|turn| turn.role == Role::User)
        .map(|turn| collapse_whitespace(&turn.text))
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(FIELD_SEPARATOR)
}

/// `user: … | bot: …` per conversation, each capped at [`TRANSCRIPT_LIMIT`] characters.
fn render_transcripts(conversations: &[&ConversationRecord]) -> String {
    conversations
        .iter()
        .filter_map(|c| c.history.as_deref())
        .map(|turns| {
            let rendered = turns
                .iter()
                .map(|turn| {
                    format!(
                        "{}: {}",
                        turn.role.transcript_label(),
                        collapse_whitespace(&turn.text)
                    )
                })
                .collect::<Vec<_>>()
                .join(FIELD_SEPARATOR);
            truncate_chars(&rendered, TRANSCRIPT_LIMIT)
        })
        .filter(|rendered| !rendered.is_empty())
        .collect::<Vec<_>>()
        .join(CONVERSATION_SEPARATOR)
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

#[derive(Serialize)]
struct FeedbackJson<'a> {
    #[serde(rename = "type")]
    kind: Option<&'static str>,
    comment: Option<&'a str>,
    option: Option<&'a Value>,
}

/// Compact JSON of each entry, joined in entry order.
fn render_feedback_total(entries: &[&FeedbackEntry]) -> String {
    entries
        .iter()
        .filter_map(|entry| {
            serde_json::to_string(&FeedbackJson {
                kind: entry.raw_rating.as_str(),
                comment: entry.comment.as_deref(),
                option: entry.options.as_ref(),
            })
            .ok()
        })
        .collect::<Vec<_>>()
        .join(FIELD_SEPARATOR)
}

/// Comments and rendered options across entries, in entry order.
fn feedback_responses(entries: &[&FeedbackEntry]) -> String {
    entries
        .iter()
        .flat_map(|entry| {
            [
                entry.comment.as_deref().map(collapse_whitespace),
                entry.options.as_ref().map(render_options),
            ]
        })
        .flatten()
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(FIELD_SEPARATOR)
}

/// Strings as-is, lists joined with `, `, maps as `key: value` pairs.
pub fn render_options(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => collapse_whitespace(s),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(render_options)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k, render_options(v)))
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join(", "),
    }
}
