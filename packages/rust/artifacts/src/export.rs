//! Row-oriented export files: CSV encoding, run-dated keys, dashboard manifest.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::json;

use chatlake_shared::{
    ChatlakeError, NORMALIZED_COLUMNS, NormalizedRow, Result, TOKEN_USAGE_COLUMNS, TokenUsageRow,
};

/// File name of the normalization export inside its run-dated folder.
pub const NORMALIZED_FILE: &str = "usuarios_normalizados.csv";

/// File name of the token usage export inside its run-dated folder.
pub const TOKEN_USAGE_FILE: &str = "token_usage.csv";

/// Dashboard manifest written next to the normalization exports.
pub const MANIFEST_FILE: &str = "manifest.json";

pub const CSV_CONTENT_TYPE: &str = "text/csv; charset=utf-8";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// `<prefix><YYYY-MM-DD>/<file>`. Same date, same key.
pub fn export_key(prefix: &str, run_date: NaiveDate, file: &str) -> String {
    format!("{prefix}{}/{file}", run_date.format("%Y-%m-%d"))
}

/// Encode normalization rows. The header row is always present.
pub fn encode_normalized(rows: &[NormalizedRow]) -> Result<Vec<u8>> {
    encode_rows(&NORMALIZED_COLUMNS, rows)
}

/// Encode token usage rows. The header row is always present.
pub fn encode_token_usage(rows: &[TokenUsageRow]) -> Result<Vec<u8>> {
    encode_rows(&TOKEN_USAGE_COLUMNS, rows)
}

fn encode_rows<T: Serialize>(columns: &[&str], rows: &[T]) -> Result<Vec<u8>> {
    let csv_err = |e: csv::Error| ChatlakeError::Serialization(e.to_string());

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(columns).map_err(csv_err)?;
    for row in rows {
        writer.serialize(row).map_err(csv_err)?;
    }
    writer
        .into_inner()
        .map_err(|e| ChatlakeError::Serialization(e.to_string()))
}

/// Manifest pointing the dashboard at one export.
pub fn manifest(export_uri: &str) -> Result<Vec<u8>> {
    let doc = json!({
        "fileLocations": [{ "URIs": [export_uri] }],
        "globalUploadSettings": {
            "format": "CSV",
            "containsHeader": "true"
        }
    });
    Ok(serde_json::to_vec_pretty(&doc)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatlake_shared::FeedbackLabel;

    fn row(id: &str) -> NormalizedRow {
        NormalizedRow {
            usuario_id: id.into(),
            nombre: "Ana".into(),
            gerencia: "Finanzas".into(),
            ciudad: "Bogotá".into(),
            fecha_primera_conversacion: "04/08/2025".into(),
            numero_conversaciones: 2,
            conversacion_completa: "user: hola, ¿cómo va? | bot: bien".into(),
            feedback_total: String::new(),
            numero_feedback: 0,
            pregunta_conversacion: "hola, ¿cómo va?".into(),
            feedback: FeedbackLabel::None,
            respuesta_feedback: String::new(),
        }
    }

    #[test]
    fn export_key_is_run_dated() {
        let date = NaiveDate::from_ymd_opt(2025, 8, 4).unwrap();
        assert_eq!(
            export_key("reports/normalized/", date, NORMALIZED_FILE),
            "reports/normalized/2025-08-04/usuarios_normalizados.csv"
        );
    }

    #[test]
    fn normalized_csv_has_header_and_quoting() {
        let body = String::from_utf8(encode_normalized(&[row("u1")]).unwrap()).unwrap();
        let mut lines = body.lines();
        assert_eq!(lines.next().unwrap(), NORMALIZED_COLUMNS.join(","));
        let data = lines.next().unwrap();
        assert!(data.starts_with("u1,Ana,Finanzas,Bogotá,04/08/2025,2,"));
        assert!(data.contains("\"hola, ¿cómo va?\""));
        assert!(data.ends_with(",none,"));
    }

    #[test]
    fn empty_export_still_has_header() {
        let body = String::from_utf8(encode_token_usage(&[]).unwrap()).unwrap();
        assert_eq!(body, format!("{}\n", TOKEN_USAGE_COLUMNS.join(",")));
    }

    #[test]
    fn token_cost_has_six_decimals() {
        let rows = [TokenUsageRow {
            conversation_id: "c1".into(),
            user_id: "u1".into(),
            fecha: "04/08/2025".into(),
            token_pregunta: 100,
            token_respuesta: 200,
            tokens_total: 300,
            costo_estimado_usd: 0.0033,
            modelo: "m".into(),
            region: "us-east-1".into(),
        }];
        let body = String::from_utf8(encode_token_usage(&rows).unwrap()).unwrap();
        assert!(body.contains("c1,u1,04/08/2025,100,200,300,0.003300,m,us-east-1"));
    }

    #[test]
    fn manifest_shape() {
        let body = manifest("file:///lake/reports/n/2025-08-04/x.csv").unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            doc["fileLocations"][0]["URIs"][0],
            "file:///lake/reports/n/2025-08-04/x.csv"
        );
        assert_eq!(doc["globalUploadSettings"]["containsHeader"], "true");
    }
}
