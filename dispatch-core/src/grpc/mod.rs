//! gRPC side of dispatch.
//!
//! This module provides:
//! - The `DispatchService` tunnel contract and its generated code
//! - The server adapter that replays tunneled calls on an axum `Router`
//! - Translation of gRPC statuses into dispatch errors
//! - Interceptors for trace context propagation
//! - Health check service implementation
//! - The tunnel server builder

pub mod adapter;
pub mod codec;
pub mod health;
pub mod interceptors;
pub mod server;
pub mod status;
pub mod tracker;

pub mod proto {
    tonic::include_proto!("dispatch.v1");

    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("dispatch_descriptor");
}

/// Fully qualified name of the tunnel service, also the name its health
/// is reported under.
pub const DISPATCH_SERVICE_NAME: &str = "dispatch.v1.DispatchService";

/// Message size limit of tunnel clients and servers unless configured.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

pub use adapter::{DispatchGrpcService, TunneledCall, parse_grpc_timeout};
pub use health::{HealthComponents, HealthReporter, HealthStatus, create_health_service};
pub use interceptors::{
    extract_request_id, inject_trace_context, inject_trace_context_with_request_id,
    trace_context_interceptor,
};
pub use server::{TunnelServer, TunnelServerError, create_reflection_service};
pub use status::{CLIENT_CLOSED_REQUEST, to_http_status, translate_status};
pub use tracker::ConnectionTracker;

pub use tonic::{Code, Status};
