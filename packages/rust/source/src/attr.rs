//! Decoding of the key-value store's typed attribute wire format.
//!
//! Items can arrive either as plain JSON or wrapped in single-key type
//! descriptors (`{"S": "x"}`, `{"N": "4"}`, `{"M": {...}}`, ...). Both are
//! decoded recursively into plain [`serde_json::Value`]s.

use serde_json::{Map, Number, Value};

/// One raw item as returned by a scan page.
pub type RawItem = Map<String, Value>;

/// Decode every attribute of an item.
pub fn decode_item(item: RawItem) -> RawItem {
    item.into_iter().map(|(k, v)| (k, decode_value(v))).collect()
}

/// Decode a single attribute value, recursing into lists and maps.
pub fn decode_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(decoded) = map
                    .iter()
                    .next()
                    .and_then(|(tag, inner)| decode_descriptor(tag, inner))
                {
                    return decoded;
                }
            }
            Value::Object(map.into_iter().map(|(k, v)| (k, decode_value(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(decode_value).collect()),
        other => other,
    }
}

/// Returns `None` when `tag` is not a type descriptor (or its payload does
/// not have the descriptor's shape), so the map is treated as plain JSON.
fn decode_descriptor(tag: &str, inner: &Value) -> Option<Value> {
    match (tag, inner) {
        ("S", Value::String(s)) => Some(Value::String(s.clone())),
        ("N", Value::String(s)) => Some(parse_number(s)),
        ("N", Value::Number(n)) => Some(Value::Number(n.clone())),
        ("BOOL", Value::Bool(b)) => Some(Value::Bool(*b)),
        ("NULL", Value::Bool(_)) => Some(Value::Null),
        ("L", Value::Array(items)) => Some(Value::Array(
            items.iter().cloned().map(decode_value).collect(),
        )),
        ("M", Value::Object(map)) => Some(Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), decode_value(v.clone())))
                .collect(),
        )),
        ("SS" | "BS", Value::Array(items)) => Some(Value::Array(items.clone())),
        ("NS", Value::Array(items)) => Some(Value::Array(
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => parse_number(s),
                    other => other.clone(),
                })
                .collect(),
        )),
        _ => None,
    }
}

/// Numbers travel as strings; integers stay integers.
fn parse_number(raw: &str) -> Value {
    let raw = raw.trim();
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Number(i.into());
    }
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_scalar_descriptors() {
        assert_eq!(decode_value(json!({"S": "hola"})), json!("hola"));
        assert_eq!(decode_value(json!({"N": "1723000000000"})), json!(1723000000000_i64));
        assert_eq!(decode_value(json!({"N": "0.5"})), json!(0.5));
        assert_eq!(decode_value(json!({"BOOL": true})), json!(true));
        assert_eq!(decode_value(json!({"NULL": true})), Value::Null);
    }

    #[test]
    fn decodes_nested_collections() {
        let wire = json!({
            "M": {
                "nombre": {"S": "Ana"},
                "tags": {"SS": ["a", "b"]},
                "scores": {"NS": ["1", "2.5"]},
                "turns": {"L": [{"M": {"from": {"S": "user"}}}]}
            }
        });
        let plain = decode_value(wire);
        assert_eq!(
            plain,
            json!({
                "nombre": "Ana",
                "tags": ["a", "b"],
                "scores": [1, 2.5],
                "turns": [{"from": "user"}]
            })
        );
    }

    #[test]
    fn plain_json_passes_through() {
        let plain = json!({"type": "like", "comment": "ok", "option": ["x"]});
        assert_eq!(decode_value(plain.clone()), plain);
    }

    #[test]
    fn single_key_map_with_foreign_shape_is_plain() {
        // "S" holding a number is not a descriptor.
        let value = json!({"S": 3});
        assert_eq!(decode_value(value.clone()), value);
    }

    #[test]
    fn decode_item_decodes_every_attribute() {
        let mut item = RawItem::new();
        item.insert("PK".into(), json!({"S": "USER#7"}));
        item.insert("SK".into(), json!("CONVERSATION#1"));
        let item = decode_item(item);
        assert_eq!(item["PK"], json!("USER#7"));
        assert_eq!(item["SK"], json!("CONVERSATION#1"));
    }
}
