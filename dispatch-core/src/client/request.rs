//! Transport-neutral description of one outbound call and its outcome.

use std::collections::BTreeMap;
use std::time::Duration;

use http::{Method, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};

use super::error::DispatchError;
use super::transport::TransportKind;

/// A file attached to a multipart dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlob {
    pub name: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

impl FileBlob {
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            content: content.into(),
        }
    }
}

/// One logical outbound call.
///
/// `endpoint` is relative to `/api/<version>/` unless it starts with `/`.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub method: Method,
    pub endpoint: String,
    pub query: Vec<(String, String)>,
    pub payload: Map<String, Value>,
    pub files: BTreeMap<String, Vec<FileBlob>>,
    pub headers: BTreeMap<String, String>,
    /// Raise `Upstream` for responses with status >= 400 instead of
    /// returning them as data.
    pub propagate_error: bool,
    pub timeout: Option<Duration>,
    pub retry_count: Option<u32>,
    /// Fields whose values failed to serialize; the request is refused.
    rejected_fields: Vec<String>,
}

impl DispatchRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            query: Vec::new(),
            payload: Map::new(),
            files: BTreeMap::new(),
            headers: BTreeMap::new(),
            propagate_error: false,
            timeout: None,
            retry_count: None,
            rejected_fields: Vec::new(),
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::POST, endpoint)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(Method::PUT, endpoint)
    }

    pub fn patch(endpoint: impl Into<String>) -> Self {
        Self::new(Method::PATCH, endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(Method::DELETE, endpoint)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Add one body field.
    ///
    /// A value that fails to serialize is left out and makes every dispatch
    /// of this request fail with `DispatchError::Unknown`.
    pub fn field(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let key = key.into();
        match serde_json::to_value(value) {
            Ok(value) => {
                self.payload.insert(key, value);
            }
            Err(e) => {
                tracing::warn!(field = %key, error = %e, "Body field failed to serialize");
                self.rejected_fields.push(key);
            }
        }
        self
    }

    /// Check the request can be sent to `service`.
    pub fn validate(&self, service: &str) -> Result<(), DispatchError> {
        if self.rejected_fields.is_empty() {
            return Ok(());
        }
        Err(DispatchError::Unknown {
            service: service.to_string(),
            detail: format!(
                "body fields failed to serialize: {}",
                self.rejected_fields.join(", ")
            ),
        })
    }

    /// Replace the body with the fields of a JSON object.
    ///
    /// Non-object values are ignored.
    pub fn json(mut self, body: Value) -> Self {
        if let Value::Object(map) = body {
            self.payload = map;
        }
        self
    }

    pub fn file(mut self, field: impl Into<String>, blob: FileBlob) -> Self {
        self.files.entry(field.into()).or_default().push(blob);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn propagate_error(mut self, propagate: bool) -> Self {
        self.propagate_error = propagate;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn has_files(&self) -> bool {
        self.files.values().any(|blobs| !blobs.is_empty())
    }
}

/// The `(body, status)` pair handed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResponse {
    pub status: StatusCode,
    pub body: Value,
    pub transport: TransportKind,
}

impl DispatchResponse {
    pub fn new(status: StatusCode, body: Value, transport: TransportKind) -> Self {
        Self {
            status,
            body,
            transport,
        }
    }

    /// A failure returned as data.
    pub fn from_error(err: &DispatchError, transport: TransportKind) -> Self {
        Self {
            status: err.status_code(),
            body: err.body(),
            transport,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn into_parts(self) -> (Value, StatusCode) {
        (self.body, self.status)
    }
}

/// Decode a response body: empty is `null`, non-JSON is kept as a string.
pub fn decode_body(bytes: &[u8]) -> Value {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}
