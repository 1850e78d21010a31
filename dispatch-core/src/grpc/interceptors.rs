//! Trace context and correlation id on tunnel metadata.

use tonic::{Request, Status};

use crate::observability::{
    REQUEST_ID_HEADER, TRACEPARENT_HEADER, TRACESTATE_HEADER, current_traceparent,
};

/// Server interceptor: records the inbound correlation id on the current span.
#[allow(clippy::result_large_err)]
pub fn trace_context_interceptor(request: Request<()>) -> Result<Request<()>, Status> {
    if let Some(traceparent) = request.metadata().get(TRACEPARENT_HEADER)
        && let Ok(traceparent_str) = traceparent.to_str()
    {
        tracing::debug!(traceparent = %traceparent_str, "Received trace context");
    }

    if let Some(request_id) = extract_request_id(&request) {
        tracing::Span::current().record("request_id", request_id.as_str());
    }

    Ok(request)
}

/// Inject the current trace context into outgoing call metadata.
pub fn inject_trace_context<T>(request: &mut Request<T>) {
    let Some((traceparent, tracestate)) = current_traceparent() else {
        return;
    };

    if let Ok(value) = traceparent.parse() {
        request.metadata_mut().insert(TRACEPARENT_HEADER, value);
    }
    if let Some(tracestate) = tracestate
        && let Ok(value) = tracestate.parse()
    {
        request.metadata_mut().insert(TRACESTATE_HEADER, value);
    }
}

pub fn inject_trace_context_with_request_id<T>(request: &mut Request<T>, request_id: &str) {
    inject_trace_context(request);

    if let Ok(value) = request_id.parse() {
        request.metadata_mut().insert(REQUEST_ID_HEADER, value);
    }
}

pub fn extract_request_id<T>(request: &Request<T>) -> Option<String> {
    request
        .metadata()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
