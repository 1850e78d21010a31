pub mod access_log;
pub mod logging;
pub mod metrics;
pub mod trace_context;

pub use access_log::AccessRecord;
pub use logging::{init_tracing, shutdown_tracing};
pub use metrics::{get_metrics, init_metrics};
pub use trace_context::{
    REQUEST_ID_HEADER, TRACEPARENT_HEADER, TRACESTATE_HEADER, current_traceparent,
    extract_request_id, extract_traceparent, inject_trace_context, inject_trace_headers,
};
