//! dispatch-core: inter-service dispatch between HTTP services.
//!
//! Every service owns one `ServiceRegistry` and reaches its peers through
//! the `ServiceClient`s it hands out. Calls go over the gRPC tunnel first
//! and fall back to HTTP; the receiving side replays tunneled calls on its
//! ordinary axum `Router`.
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod grpc;
pub mod middleware;
pub mod observability;

pub use client::{
    DispatchError, DispatchRequest, DispatchResponse, FileBlob, ServiceClient, ServiceIdentity,
    ServiceRegistry, TransportKind,
};
pub use config::DispatchSettings;
pub use context::{OutboundContext, RequestScope};
pub use error::AppError;

pub use async_trait;
pub use axum;
pub use prost;
pub use secrecy;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tonic;
pub use tower;
pub use tower_http;
pub use tracing;
