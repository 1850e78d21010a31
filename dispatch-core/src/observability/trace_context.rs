//! W3C Trace Context propagation for outbound dispatches.
//!
//! See: https://www.w3.org/TR/trace-context/

use http::HeaderMap;
use opentelemetry::trace::TraceContextExt;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub const TRACEPARENT_HEADER: &str = "traceparent";

pub const TRACESTATE_HEADER: &str = "tracestate";

/// Header carrying the correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// `traceparent` of the current span, if it has a valid OpenTelemetry context.
pub fn current_traceparent() -> Option<(String, Option<String>)> {
    let context = Span::current().context();
    let otel_span = context.span();
    let span_context = otel_span.span_context();

    if !span_context.is_valid() {
        return None;
    }

    // version-trace_id-span_id-trace_flags
    let traceparent = format!(
        "00-{}-{}-{:02x}",
        span_context.trace_id(),
        span_context.span_id(),
        span_context.trace_flags().to_u8()
    );
    let tracestate = span_context.trace_state().header();
    let tracestate = (!tracestate.is_empty()).then_some(tracestate);

    Some((traceparent, tracestate))
}

/// Inject the current trace context into outbound headers.
pub fn inject_trace_context(headers: &mut HeaderMap) {
    let Some((traceparent, tracestate)) = current_traceparent() else {
        return;
    };

    if let Ok(value) = traceparent.parse() {
        headers.insert(TRACEPARENT_HEADER, value);
    }
    if let Some(tracestate) = tracestate
        && let Ok(value) = tracestate.parse()
    {
        headers.insert(TRACESTATE_HEADER, value);
    }
}

/// Inject trace context and the correlation id.
pub fn inject_trace_headers(headers: &mut HeaderMap, request_id: Option<&str>) {
    inject_trace_context(headers);

    if let Some(id) = request_id
        && let Ok(value) = id.parse()
    {
        headers.insert(REQUEST_ID_HEADER, value);
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

pub fn extract_traceparent(headers: &HeaderMap) -> Option<String> {
    header(headers, TRACEPARENT_HEADER)
}

pub fn extract_request_id(headers: &HeaderMap) -> Option<String> {
    header(headers, REQUEST_ID_HEADER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_without_span() {
        let mut headers = HeaderMap::new();
        inject_trace_headers(&mut headers, Some("abc-123"));
        assert!(headers.get(TRACEPARENT_HEADER).is_none());
        assert_eq!(extract_request_id(&headers), Some("abc-123".to_string()));
    }

    #[test]
    fn test_extract_traceparent() {
        let mut headers = HeaderMap::new();
        headers.insert(
            TRACEPARENT_HEADER,
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"
                .parse()
                .unwrap(),
        );
        assert_eq!(
            extract_traceparent(&headers).as_deref(),
            Some("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01")
        );
    }
}
