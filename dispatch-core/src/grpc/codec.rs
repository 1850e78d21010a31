//! Conversions between JSON and the tunnel's wire messages.

use std::collections::{BTreeMap, HashMap};

use prost_types::{ListValue, Struct, value::Kind};
use serde_json::{Map, Number, Value};

use super::proto::{FileBlob as WireFile, FileList};
use crate::client::FileBlob;

pub fn json_to_struct(map: &Map<String, Value>) -> Struct {
    Struct {
        fields: map
            .iter()
            .map(|(key, value)| (key.clone(), json_to_value(value)))
            .collect(),
    }
}

pub fn struct_to_json(message: &Struct) -> Map<String, Value> {
    message
        .fields
        .iter()
        .map(|(key, value)| (key.clone(), value_to_json(value)))
        .collect()
}

fn json_to_value(value: &Value) -> prost_types::Value {
    let kind = match value {
        Value::Null => Kind::NullValue(0),
        Value::Bool(b) => Kind::BoolValue(*b),
        Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or_default()),
        Value::String(s) => Kind::StringValue(s.clone()),
        Value::Array(items) => Kind::ListValue(ListValue {
            values: items.iter().map(json_to_value).collect(),
        }),
        Value::Object(map) => Kind::StructValue(json_to_struct(map)),
    };
    prost_types::Value { kind: Some(kind) }
}

fn value_to_json(value: &prost_types::Value) -> Value {
    match &value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(*b),
        Some(Kind::NumberValue(n)) => number_to_json(*n),
        Some(Kind::StringValue(s)) => Value::String(s.clone()),
        Some(Kind::ListValue(list)) => Value::Array(list.values.iter().map(value_to_json).collect()),
        Some(Kind::StructValue(s)) => Value::Object(struct_to_json(s)),
    }
}

/// `Struct` numbers are doubles; whole values come back as integers.
fn number_to_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

/// Body fields as the wire carries them: each value JSON-encoded.
pub fn encode_body_fields(payload: &Map<String, Value>) -> HashMap<String, String> {
    payload
        .iter()
        .map(|(key, value)| (key.clone(), value.to_string()))
        .collect()
}

/// Inverse of `encode_body_fields`. Values that are not valid JSON are kept
/// as strings.
pub fn decode_body_fields(fields: &HashMap<String, String>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(key, raw)| {
            let value =
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
            (key.clone(), value)
        })
        .collect()
}

pub fn encode_files(files: &BTreeMap<String, Vec<FileBlob>>) -> HashMap<String, FileList> {
    files
        .iter()
        .map(|(field, blobs)| {
            let files = blobs
                .iter()
                .map(|blob| WireFile {
                    name: blob.name.clone(),
                    content_type: blob.content_type.clone(),
                    content: blob.content.clone(),
                })
                .collect();
            (field.clone(), FileList { files })
        })
        .collect()
}

/// `path?query` with the query url-encoded; no `?` when empty.
pub fn endpoint_with_query(path: &str, query: &[(String, String)]) -> String {
    if query.is_empty() {
        return path.to_string();
    }
    match serde_urlencoded::to_string(query) {
        Ok(encoded) if !encoded.is_empty() => format!("{path}?{encoded}"),
        _ => path.to_string(),
    }
}

/// `multipart/form-data` body: one text part per JSON-encoded field, one
/// part per file.
pub fn encode_multipart(
    boundary: &str,
    fields: &HashMap<String, String>,
    files: &HashMap<String, FileList>,
) -> Vec<u8> {
    let mut body = Vec::new();

    let mut names: Vec<_> = fields.keys().collect();
    names.sort();
    for name in names {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                escape_quoted(name)
            )
            .as_bytes(),
        );
        body.extend_from_slice(fields[name].as_bytes());
        body.extend_from_slice(b"\r\n");
    }

    let mut file_fields: Vec<_> = files.keys().collect();
    file_fields.sort();
    for field in file_fields {
        for file in &files[field].files {
            let content_type = if file.content_type.is_empty() {
                "application/octet-stream"
            } else {
                &file.content_type
            };
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                    escape_quoted(field),
                    escape_quoted(&file.name),
                    content_type
                )
                .as_bytes(),
            );
            body.extend_from_slice(&file.content);
            body.extend_from_slice(b"\r\n");
        }
    }

    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}

fn escape_quoted(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_struct_keeps_shape() {
        let claims = json!({
            "sub": "user-1",
            "roles": ["admin", "billing"],
            "tenant": {"id": 7, "active": true},
            "ratio": 0.5,
            "none": null,
        });
        let map = claims.as_object().unwrap();
        assert_eq!(Value::Object(struct_to_json(&json_to_struct(map))), claims);
    }

    #[test]
    fn test_body_fields_are_json_encoded() {
        let payload = json!({"name": "a", "count": 3, "tags": ["x"]});
        let encoded = encode_body_fields(payload.as_object().unwrap());
        assert_eq!(encoded["name"], "\"a\"");
        assert_eq!(encoded["count"], "3");

        let mut raw = encoded.clone();
        raw.insert("loose".into(), "not json".into());
        let decoded = decode_body_fields(&raw);
        assert_eq!(decoded["tags"], json!(["x"]));
        assert_eq!(decoded["loose"], json!("not json"));
    }

    #[test]
    fn test_endpoint_with_query() {
        assert_eq!(endpoint_with_query("/api/v1/ping", &[]), "/api/v1/ping");
        let query = vec![
            ("q".to_string(), "a b".to_string()),
            ("page".to_string(), "2".to_string()),
        ];
        assert_eq!(
            endpoint_with_query("/api/v1/search", &query),
            "/api/v1/search?q=a+b&page=2"
        );
    }

    #[test]
    fn test_multipart_layout() {
        let mut fields = HashMap::new();
        fields.insert("title".to_string(), "\"report\"".to_string());
        let mut files = HashMap::new();
        files.insert(
            "doc".to_string(),
            FileList {
                files: vec![WireFile {
                    name: "a.txt".into(),
                    content_type: "text/plain".into(),
                    content: b"hello".to_vec(),
                }],
            },
        );

        let body = String::from_utf8(encode_multipart("XYZ", &fields, &files)).unwrap();
        assert!(body.starts_with("--XYZ\r\nContent-Disposition: form-data; name=\"title\""));
        assert!(body.contains("filename=\"a.txt\"\r\nContent-Type: text/plain\r\n\r\nhello\r\n"));
        assert!(body.ends_with("--XYZ--\r\n"));
    }
}
