use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use http::HeaderMap;
use serde::Serialize;
use serde_json::{Map, Value};

use super::descriptor::ResolvedEndpoint;
use super::error::DispatchError;
use super::request::{DispatchRequest, DispatchResponse};
use crate::context::OutboundContext;

/// Which wire a dispatch travelled over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Grpc,
    Http,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Grpc => "grpc",
            TransportKind::Http => "http",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a transport needs for a single attempt.
pub struct OutboundCall<'a> {
    pub target: &'a str,
    pub request: &'a DispatchRequest,
    pub context: &'a OutboundContext,
    pub endpoint: &'a ResolvedEndpoint,
    /// Injected headers, identical for both transports.
    pub headers: &'a HeaderMap,
    /// Identity claims of the calling service.
    pub service_claims: &'a Map<String, Value>,
    pub timeout: Duration,
}

impl OutboundCall<'_> {
    /// Request path with the `/api/<version>/` prefix applied.
    pub fn path(&self) -> String {
        self.endpoint.request_path(&self.request.endpoint)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// One attempt, no retries. Any received response is `Ok`, whatever
    /// its status.
    async fn send(&self, call: &OutboundCall<'_>) -> Result<DispatchResponse, DispatchError>;

    /// Drop pooled connections. Safe to call more than once.
    async fn close(&self);
}
