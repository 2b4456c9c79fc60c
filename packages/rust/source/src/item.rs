//! Item → record parsing.
//!
//! Items are keyed `PK = "USER#<user_id>"` and a sort key whose content
//! decides the item's shape (`CONVERSATION`, `FEEDBACK`, `REGISTER`). No
//! schema is enforced at the source, so every attribute is optional here and
//! shape problems surface as [`ChatlakeError::RecordMalformed`].

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use chatlake_shared::{
    ChatlakeError, ConversationRecord, FeedbackEntry, RawRating, Result, Role, Turn, UserProfile,
};

use crate::attr::RawItem;

const USER_PREFIX: &str = "USER#";

/// Placeholder strings that mean "no value" in source data.
const EMPTY_MARKERS: [&str; 3] = ["none", "null", "nan"];

/// What a single item contributed.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemKind {
    Conversation(ConversationRecord),
    Feedback(Vec<FeedbackEntry>),
    /// Registration item: carries only the user profile.
    Register,
    /// Any other sort key.
    Ignored,
}

/// A parsed item plus the profile snapshot it carried, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedItem {
    pub user_id: String,
    pub profile: Option<UserProfile>,
    pub kind: ItemKind,
    /// Why the conversation history could not be used, when it could not.
    pub history_issue: Option<String>,
}

/// Identifier of an item for logs and run summaries (`PK/SK`).
pub fn item_key(item: &RawItem) -> String {
    format!(
        "{}/{}",
        str_attr(item, "PK").unwrap_or("?"),
        str_attr(item, "SK").unwrap_or("?")
    )
}

/// Parse one decoded item.
pub fn parse_item(item: &RawItem) -> Result<ParsedItem> {
    let key = item_key(item);
    let pk = str_attr(item, "PK").ok_or_else(|| ChatlakeError::malformed(&key, "missing PK"))?;
    let user_id = pk.strip_prefix(USER_PREFIX).unwrap_or(pk).trim().to_string();
    if user_id.is_empty() {
        return Err(ChatlakeError::malformed(&key, "empty user id"));
    }
    let sk = str_attr(item, "SK").unwrap_or_default();
    let sk_upper = sk.to_ascii_uppercase();

    let profile = item
        .get("UserData")
        .and_then(|v| parse_profile(&user_id, v));

    let mut history_issue = None;
    let kind = if sk_upper.contains("FEEDBACK") {
        ItemKind::Feedback(parse_feedback(&key, &user_id, item)?)
    } else if sk_upper.contains("REGISTER") {
        ItemKind::Register
    } else if sk_upper.contains("CONV")
        || item.contains_key("Conversation")
        || item.contains_key("MessageMap")
    {
        let conversation_id = conversation_id(item, sk)
            .ok_or_else(|| ChatlakeError::malformed(&key, "no conversation id"))?;
        let timestamp = item_timestamp(item);
        if timestamp.is_none() {
            debug!(%key, "conversation has no readable timestamp");
        }
        let history = match parse_history(item) {
            Ok(turns) => Some(turns),
            Err(reason) => {
                debug!(%key, %reason, "conversation history unusable");
                history_issue = Some(reason);
                None
            }
        };
        ItemKind::Conversation(ConversationRecord {
            user_id: user_id.clone(),
            conversation_id,
            timestamp,
            history,
        })
    } else {
        ItemKind::Ignored
    };

    Ok(ParsedItem {
        user_id,
        profile,
        kind,
        history_issue,
    })
}

// ---------------------------------------------------------------------------
// Attribute helpers
// ---------------------------------------------------------------------------

fn str_attr<'a>(item: &'a RawItem, name: &str) -> Option<&'a str> {
    item.get(name).and_then(Value::as_str)
}

/// Trimmed text of a value, with empty placeholders mapped to `None`.
fn text_of(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.is_empty() || EMPTY_MARKERS.contains(&text.to_ascii_lowercase().as_str()) {
        None
    } else {
        Some(text)
    }
}

/// Values may be stored inline or as a JSON document inside a string.
fn inline_or_json(value: &Value) -> std::result::Result<Value, String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(trimmed).map_err(|e| format!("invalid embedded JSON: {e}"))
        }
        other => Ok(other.clone()),
    }
}

fn conversation_id(item: &RawItem, sk: &str) -> Option<String> {
    item.get("ConversationId")
        .and_then(text_of)
        .or_else(|| {
            sk.rsplit_once('#')
                .map(|(_, suffix)| suffix.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
}

fn item_timestamp(item: &RawItem) -> Option<DateTime<Utc>> {
    item.get("CreatedAt")
        .and_then(parse_timestamp)
        .or_else(|| item.get("CreateTime").and_then(parse_timestamp))
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD`, or epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ms) = s.parse::<i64>() {
                return Utc.timestamp_millis_opt(ms).single();
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Some(naive.and_utc());
                }
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

fn parse_profile(user_id: &str, value: &Value) -> Option<UserProfile> {
    let data = inline_or_json(value).ok()?;
    let map = data.as_object()?;
    let field = |name: &str| map.get(name).and_then(text_of);

    let profile = UserProfile {
        user_id: user_id.to_string(),
        name: field("nombre"),
        department: field("gerencia").map(|s| strip_qualifier(&s)),
        city: field("ciudad").map(|s| strip_qualifier(&s)),
    };
    (profile.name.is_some() || profile.department.is_some() || profile.city.is_some())
        .then_some(profile)
}

/// `"Bogotá (Centro)"` → `"Bogotá"`.
fn strip_qualifier(raw: &str) -> String {
    match (raw.find('('), raw.ends_with(')')) {
        (Some(open), true) if open > 0 => raw[..open].trim().to_string(),
        _ => raw.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

fn parse_feedback(key: &str, user_id: &str, item: &RawItem) -> Result<Vec<FeedbackEntry>> {
    let raw = item
        .get("Feedback")
        .ok_or_else(|| ChatlakeError::malformed(key, "missing Feedback attribute"))?;
    let value = inline_or_json(raw).map_err(|reason| ChatlakeError::malformed(key, reason))?;
    let item_conversation = item.get("ConversationId").and_then(text_of);

    let maps: Vec<&Map<String, Value>> = match &value {
        Value::Object(map) => vec![map],
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_object()
                    .ok_or_else(|| ChatlakeError::malformed(key, "feedback list entry is not a map"))
            })
            .collect::<Result<_>>()?,
        _ => return Err(ChatlakeError::malformed(key, "Feedback is not a map or list")),
    };

    Ok(maps
        .into_iter()
        .map(|map| {
            let rating = map.get("type").or_else(|| map.get("rating")).and_then(text_of);
            let options = map
                .get("option")
                .or_else(|| map.get("options"))
                .filter(|v| !v.is_null())
                .cloned();
            FeedbackEntry {
                user_id: user_id.to_string(),
                conversation_id: map
                    .get("conversation_id")
                    .or_else(|| map.get("conversationId"))
                    .and_then(text_of)
                    .or_else(|| item_conversation.clone()),
                raw_rating: RawRating::parse(rating.as_deref()),
                comment: map.get("comment").and_then(text_of),
                options,
            }
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Conversation history
// ---------------------------------------------------------------------------

/// Parse the item's history. `Err` carries the reason it is unusable.
fn parse_history(item: &RawItem) -> std::result::Result<Vec<Turn>, String> {
    if let Some(raw) = item.get("Conversation") {
        let value = inline_or_json(raw)?;
        return match value {
            Value::Array(raw_turns) => {
                let mut turns = Vec::with_capacity(raw_turns.len());
                for raw_turn in &raw_turns {
                    if let Some(turn) = parse_listed_turn(raw_turn)? {
                        turns.push(turn);
                    }
                }
                Ok(turns)
            }
            Value::Null => Err("empty Conversation attribute".into()),
            _ => Err("Conversation is not a list".into()),
        };
    }
    if let Some(raw) = item.get("MessageMap") {
        let value = inline_or_json(raw)?;
        return match value {
            Value::Object(map) => parse_message_map(&map),
            Value::Null => Err("empty MessageMap attribute".into()),
            _ => Err("MessageMap is not a map".into()),
        };
    }
    Err("no conversation history".into())
}

/// `{from|role, text|content, chunks?}`. `Ok(None)` drops a turn with an unknown role.
fn parse_listed_turn(value: &Value) -> std::result::Result<Option<Turn>, String> {
    let map = value.as_object().ok_or("conversation turn is not a map")?;
    let raw_role = map
        .get("from")
        .or_else(|| map.get("role"))
        .and_then(Value::as_str)
        .ok_or("conversation turn has no role")?;
    let Some(role) = Role::from_alias(raw_role) else {
        debug!(role = raw_role, "dropping turn with unknown role");
        return Ok(None);
    };
    let text = map
        .get("text")
        .or_else(|| map.get("content"))
        .map(content_text)
        .unwrap_or_default();
    let chunks = map.get("chunks").map(chunk_texts).unwrap_or_default();
    Ok(Some(Turn { role, text, chunks }))
}

/// `{<id>: {role, content: [{body}], used_chunks?, create_time?}}`, ordered by `create_time`.
fn parse_message_map(map: &Map<String, Value>) -> std::result::Result<Vec<Turn>, String> {
    let mut messages = Vec::with_capacity(map.len());
    for (id, value) in map {
        let message = value
            .as_object()
            .ok_or_else(|| format!("message {id} is not a map"))?;
        let created = message
            .get("create_time")
            .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .unwrap_or(0.0);
        messages.push((created, id.as_str(), message));
    }
    messages.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let mut turns = Vec::with_capacity(messages.len());
    for (_, id, message) in messages {
        let raw_role = message
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or(id);
        let Some(role) = Role::from_alias(raw_role) else {
            debug!(role = raw_role, message = id, "dropping message with unknown role");
            continue;
        };
        turns.push(Turn {
            role,
            text: message.get("content").map(content_text).unwrap_or_default(),
            chunks: message.get("used_chunks").map(chunk_texts).unwrap_or_default(),
        });
    }
    Ok(turns)
}

/// Content is a string or a list of `{body}` parts.
fn content_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(s) => Some(s.as_str()),
                Value::Object(map) => map
                    .get("body")
                    .or_else(|| map.get("text"))
                    .and_then(Value::as_str),
                _ => None,
            })
            .collect(),
        _ => String::new(),
    }
}

/// Retrieval chunks: strings or maps carrying `content|body|text`, possibly JSON-encoded.
fn chunk_texts(value: &Value) -> Vec<String> {
    let Ok(Value::Array(chunks)) = inline_or_json(value) else {
        return Vec::new();
    };
    chunks
        .iter()
        .filter_map(|chunk| match chunk {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => ["content", "body", "text"]
                .iter()
                .find_map(|k| map.get(*k))
                .map(content_text),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(value: Value) -> RawItem {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn parses_conversation_list_item() {
        let parsed = parse_item(&item(json!({
            "PK": "USER#u1",
            "SK": "CONVERSATION#c9",
            "CreatedAt": "2025-08-05 10:00:00",
            "UserData": {"nombre": "Ana", "ciudad": "Bogotá (Centro)"},
            "Conversation": [
                {"from": "user", "text": "hola"},
                {"from": "bot", "text": "buenos días"},
                {"from": "tool", "text": "ignored"}
            ]
        })))
        .expect("parse");

        assert_eq!(parsed.user_id, "u1");
        let profile = parsed.profile.expect("profile");
        assert_eq!(profile.name.as_deref(), Some("Ana"));
        assert_eq!(profile.city.as_deref(), Some("Bogotá"));
        let ItemKind::Conversation(conv) = parsed.kind else {
            panic!("expected conversation");
        };
        assert_eq!(conv.conversation_id, "c9");
        assert_eq!(conv.timestamp.unwrap().to_rfc3339(), "2025-08-05T10:00:00+00:00");
        let history = conv.history.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, Role::Assistant);
    }

    #[test]
    fn parses_message_map_in_create_time_order() {
        let map = json!({
            "b": {"role": "assistant", "content": [{"body": "respuesta"}], "create_time": 2},
            "a": {"role": "user", "content": [{"body": "pregunta"}], "create_time": 1,
                  "used_chunks": [{"content": "fragmento"}]},
            "system": {"role": "system", "content": [{"body": "eres útil"}], "create_time": 0}
        });
        let parsed = parse_item(&item(json!({
            "PK": "u2",
            "SK": "u2#CONV#abc",
            "CreateTime": 1754390000000_i64,
            "MessageMap": map.to_string()
        })))
        .expect("parse");

        let ItemKind::Conversation(conv) = parsed.kind else {
            panic!("expected conversation");
        };
        assert_eq!(conv.conversation_id, "abc");
        let turns = conv.history.expect("history");
        let roles: Vec<_> = turns.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(turns[1].chunks, vec!["fragmento".to_string()]);
    }

    #[test]
    fn malformed_history_is_not_fatal() {
        let parsed = parse_item(&item(json!({
            "PK": "USER#u3",
            "SK": "CONVERSATION#1",
            "CreatedAt": "2025-08-05",
            "Conversation": "{not json"
        })))
        .expect("parse");
        assert!(parsed.history_issue.is_some());
        let ItemKind::Conversation(conv) = parsed.kind else {
            panic!("expected conversation");
        };
        assert!(conv.history.is_none());
    }

    #[test]
    fn conversation_without_timestamp_is_kept_undated() {
        for stored in [json!(null), json!("yesterday")] {
            let parsed = parse_item(&item(json!({
                "PK": "USER#u3",
                "SK": "CONVERSATION#1",
                "CreatedAt": stored,
                "Conversation": [{"from": "user", "text": "hola"}]
            })))
            .expect("parse");
            let ItemKind::Conversation(conv) = parsed.kind else {
                panic!("expected conversation");
            };
            assert!(conv.timestamp.is_none());
            assert_eq!(conv.history.expect("history").len(), 1);
        }
    }

    #[test]
    fn parses_feedback_list() {
        let parsed = parse_item(&item(json!({
            "PK": "USER#u4",
            "SK": "FEEDBACK#f1",
            "ConversationId": "c1",
            "Feedback": [
                {"type": "like", "comment": "muy bien"},
                {"type": "dislike", "comment": "None", "option": ["lento", "incompleto"]}
            ]
        })))
        .expect("parse");
        let ItemKind::Feedback(entries) = parsed.kind else {
            panic!("expected feedback");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].raw_rating, RawRating::Like);
        assert_eq!(entries[0].conversation_id.as_deref(), Some("c1"));
        assert_eq!(entries[1].comment, None);
        assert_eq!(entries[1].options, Some(json!(["lento", "incompleto"])));
    }

    #[test]
    fn register_and_unknown_items() {
        let parsed = parse_item(&item(json!({
            "PK": "USER#u5",
            "SK": "REGISTER",
            "UserData": "{\"nombre\": \"Luis\", \"gerencia\": \"Finanzas\"}"
        })))
        .expect("parse");
        assert_eq!(parsed.kind, ItemKind::Register);
        assert_eq!(
            parsed.profile.and_then(|p| p.department),
            Some("Finanzas".to_string())
        );

        let parsed = parse_item(&item(json!({"PK": "USER#u5", "SK": "SETTINGS"}))).expect("parse");
        assert_eq!(parsed.kind, ItemKind::Ignored);
    }

    #[test]
    fn missing_pk_is_malformed() {
        let err = parse_item(&item(json!({"SK": "CONVERSATION#1"}))).unwrap_err();
        assert!(matches!(err, ChatlakeError::RecordMalformed { .. }));
        assert!(err.to_string().contains("missing PK"));
    }

    #[test]
    fn timestamp_formats() {
        let expected = "2025-08-04T00:00:00+00:00";
        for raw in [
            json!("2025-08-04T00:00:00Z"),
            json!("2025-08-04 00:00:00"),
            json!("2025-08-04"),
            json!(1754265600000_i64),
            json!("1754265600000"),
        ] {
            let ts = parse_timestamp(&raw).expect("timestamp");
            assert_eq!(ts.to_rfc3339(), expected, "input {raw}");
        }
        assert!(parse_timestamp(&json!("yesterday")).is_none());
    }
}
