//! Decoding of notification payloads into [`PipelineEvent`]s.
//!
//! Accepted documents:
//! - storage events: `{"Records":[{"eventName":"ObjectCreated:Put","s3":{"object":{"key":..,"eTag":..}}}]}`
//! - job events: `{"detail-type":"Glue Job State Change","detail":{"jobRunId":..,"state":..}}`
//! - catalog events: `{"detail-type":"Glue Crawler State Change","detail":{"crawlerName":..,"state":"Succeeded"}}`
//!
//! A JSON array of any of the above is also accepted.

use serde_json::Value;

use chatlake_shared::{ChatlakeError, Result};

use crate::orchestrator::PipelineEvent;

const JOB_STATE_CHANGE: &str = "Glue Job State Change";
const CRAWLER_STATE_CHANGE: &str = "Glue Crawler State Change";

/// Parse one notification document. Storage events may carry several records.
pub fn parse_notifications(input: &str) -> Result<Vec<PipelineEvent>> {
    let doc: Value = serde_json::from_str(input)
        .map_err(|e| ChatlakeError::validation(format!("notification is not JSON: {e}")))?;

    match doc {
        Value::Array(docs) => {
            let mut events = Vec::new();
            for doc in &docs {
                events.extend(parse_document(doc)?);
            }
            Ok(events)
        }
        doc => parse_document(&doc),
    }
}

fn parse_document(doc: &Value) -> Result<Vec<PipelineEvent>> {
    if let Some(records) = doc.get("Records").and_then(Value::as_array) {
        return parse_storage_records(records);
    }

    let detail_type = doc.get("detail-type").and_then(Value::as_str);
    let detail = doc.get("detail");
    match (detail_type, detail) {
        (Some(JOB_STATE_CHANGE), Some(detail)) => {
            let job_id = required_str(detail, "jobRunId")?;
            let state = required_str(detail, "state")?;
            Ok(vec![PipelineEvent::JobStateChanged {
                job_id: job_id.to_string(),
                state: state.to_string(),
            }])
        }
        (Some(CRAWLER_STATE_CHANGE), Some(detail)) => {
            let target = required_str(detail, "crawlerName")?;
            let state = required_str(detail, "state")?;
            if state.eq_ignore_ascii_case("Succeeded") {
                Ok(vec![PipelineEvent::CatalogRefreshed {
                    target: target.to_string(),
                }])
            } else {
                Ok(Vec::new())
            }
        }
        (Some(other), _) => Err(ChatlakeError::validation(format!(
            "unsupported notification type '{other}'"
        ))),
        (None, _) => Err(ChatlakeError::validation(
            "notification has neither Records nor detail-type",
        )),
    }
}

fn parse_storage_records(records: &[Value]) -> Result<Vec<PipelineEvent>> {
    let mut events = Vec::with_capacity(records.len());
    for record in records {
        // Deletions and other event kinds never start a run.
        let created = record
            .get("eventName")
            .and_then(Value::as_str)
            .is_none_or(|name| name.starts_with("ObjectCreated"));
        if !created {
            continue;
        }

        let object = record
            .get("s3")
            .and_then(|s3| s3.get("object"))
            .ok_or_else(|| ChatlakeError::validation("storage record without s3.object"))?;
        let raw_key = required_str(object, "key")?;
        let etag = object
            .get("eTag")
            .or_else(|| object.get("etag"))
            .and_then(Value::as_str)
            .map(|e| e.trim_matches('"').to_string())
            .filter(|e| !e.is_empty());

        events.push(PipelineEvent::ObjectCreated {
            key: decode_key(raw_key),
            etag,
        });
    }
    Ok(events)
}

/// Object keys arrive form-encoded (`+` for spaces, `%XX` escapes).
fn decode_key(raw: &str) -> String {
    url::form_urlencoded::parse(raw.as_bytes())
        .next()
        .map(|(key, value)| {
            if value.is_empty() {
                key.into_owned()
            } else {
                format!("{key}={value}")
            }
        })
        .unwrap_or_default()
}

fn required_str<'a>(value: &'a Value, field: &str) -> Result<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ChatlakeError::validation(format!("notification missing '{field}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_event_with_encoded_key() {
        let doc = r#"{"Records":[{"eventName":"ObjectCreated:Put","s3":{"object":{
            "key":"reports/normalized/2025-08-04/usuarios+normalizados%282%29.csv",
            "eTag":"\"abc123\""}}}]}"#;
        let events = parse_notifications(doc).unwrap();
        assert_eq!(
            events,
            vec![PipelineEvent::ObjectCreated {
                key: "reports/normalized/2025-08-04/usuarios normalizados(2).csv".into(),
                etag: Some("abc123".into()),
            }]
        );
    }

    #[test]
    fn removal_records_are_skipped() {
        let doc = r#"{"Records":[
            {"eventName":"ObjectRemoved:Delete","s3":{"object":{"key":"a.csv"}}},
            {"s3":{"object":{"key":"b.csv"}}}
        ]}"#;
        let events = parse_notifications(doc).unwrap();
        assert_eq!(
            events,
            vec![PipelineEvent::ObjectCreated {
                key: "b.csv".into(),
                etag: None
            }]
        );
    }

    #[test]
    fn job_state_change() {
        let doc = r#"{"detail-type":"Glue Job State Change","source":"aws.glue",
            "detail":{"jobName":"x","jobRunId":"jr_1","state":"SUCCEEDED"}}"#;
        assert_eq!(
            parse_notifications(doc).unwrap(),
            vec![PipelineEvent::JobStateChanged {
                job_id: "jr_1".into(),
                state: "SUCCEEDED".into()
            }]
        );
    }

    #[test]
    fn crawler_success_and_other_states() {
        let ok = r#"{"detail-type":"Glue Crawler State Change",
            "detail":{"crawlerName":"chatlake_tokens","state":"Succeeded"}}"#;
        assert_eq!(
            parse_notifications(ok).unwrap(),
            vec![PipelineEvent::CatalogRefreshed {
                target: "chatlake_tokens".into()
            }]
        );

        let started = r#"{"detail-type":"Glue Crawler State Change",
            "detail":{"crawlerName":"chatlake_tokens","state":"Started"}}"#;
        assert!(parse_notifications(started).unwrap().is_empty());
    }

    #[test]
    fn array_of_documents() {
        let doc = r#"[
            {"Records":[{"s3":{"object":{"key":"k.csv","eTag":"e"}}}]},
            {"detail-type":"Glue Job State Change","detail":{"jobRunId":"j","state":"FAILED"}}
        ]"#;
        assert_eq!(parse_notifications(doc).unwrap().len(), 2);
    }

    #[test]
    fn rejects_unknown_documents() {
        for doc in [
            "not json",
            r#"{"hello":"world"}"#,
            r#"{"detail-type":"Something Else","detail":{}}"#,
            r#"{"detail-type":"Glue Job State Change","detail":{"state":"FAILED"}}"#,
        ] {
            let err = parse_notifications(doc).unwrap_err();
            assert!(matches!(err, ChatlakeError::Validation { .. }), "{doc}");
        }
    }
}
