//! Header injection shared by both transports.

use std::collections::BTreeMap;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, DATE};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};

use crate::context::OutboundContext;
use crate::observability::{REQUEST_ID_HEADER, TRACEPARENT_HEADER, TRACESTATE_HEADER, inject_trace_headers};

/// Base64 JSON of the calling user's claims.
pub const CALLER_USER_HEADER: &str = "x-caller-user";

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Headers callers cannot override through `DispatchRequest::header`.
const PROTECTED: [&str; 8] = [
    "authorization",
    "content-type",
    "content-length",
    "host",
    CALLER_USER_HEADER,
    REQUEST_ID_HEADER,
    TRACEPARENT_HEADER,
    TRACESTATE_HEADER,
];

pub fn encode_claims(claims: &Map<String, Value>) -> String {
    let json = serde_json::to_vec(claims).unwrap_or_else(|_| b"{}".to_vec());
    STANDARD.encode(json)
}

/// `None` for anything that is not base64 of a JSON object.
pub fn decode_claims(encoded: &str) -> Option<Map<String, Value>> {
    let bytes = STANDARD.decode(encoded.trim()).ok()?;
    match serde_json::from_slice(&bytes).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// RFC 1123 timestamp, as used in the `date` header.
pub fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Build the headers of one outbound call.
///
/// When `multipart` is set the transport supplies the content type itself.
pub fn outbound_headers(
    ctx: &OutboundContext,
    token: &str,
    multipart: bool,
    extra: &BTreeMap<String, String>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in extra {
        if PROTECTED.contains(&name.as_str()) {
            tracing::debug!(header = %name, "Ignoring protected outbound header");
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "Dropping invalid outbound header"),
        }
    }

    insert(&mut headers, DATE, &http_date());
    insert(&mut headers, AUTHORIZATION, &format!("Bearer {token}"));
    insert(
        &mut headers,
        HeaderName::from_static(CALLER_USER_HEADER),
        &encode_claims(&ctx.caller_user),
    );
    if !headers.contains_key(ACCEPT) {
        headers.insert(ACCEPT, HeaderValue::from_static(JSON_CONTENT_TYPE));
    }
    if !multipart {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    }

    inject_trace_headers(&mut headers, Some(ctx.correlation_id()));
    headers
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
