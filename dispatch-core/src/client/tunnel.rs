//! Client side of the tunneled transport.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tonic::Code;
use tonic::transport::{Channel, Endpoint};
use tonic_health::pb::HealthCheckRequest;
use tonic_health::pb::health_client::HealthClient;

use super::descriptor::ResolvedEndpoint;
use super::error::{DispatchError, Unavailability};
use super::request::{DispatchResponse, decode_body};
use super::transport::{OutboundCall, Transport, TransportKind};
use crate::grpc::codec::{encode_body_fields, encode_files, endpoint_with_query, json_to_struct};
use crate::grpc::interceptors::inject_trace_context_with_request_id;
use crate::grpc::proto::TunneledRequest;
use crate::grpc::proto::dispatch_service_client::DispatchServiceClient;
use crate::grpc::status::{is_connection_refused, translate_status};
use crate::grpc::{DEFAULT_MAX_MESSAGE_SIZE, DISPATCH_SERVICE_NAME, HealthStatus};

struct CachedChannel {
    uri: String,
    channel: Channel,
}

/// One lazily connected HTTP/2 channel per target, multiplexing every
/// tunneled call and health probe.
pub struct TunneledTransport {
    target: String,
    connect_timeout: Duration,
    max_message_size: usize,
    channel: RwLock<Option<CachedChannel>>,
}

impl TunneledTransport {
    pub fn new(target: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            target: target.into(),
            connect_timeout,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            channel: RwLock::new(None),
        }
    }

    pub fn with_max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    /// The shared channel, rebuilt if the endpoint moved since it was made.
    async fn channel(&self, endpoint: &ResolvedEndpoint) -> Result<Channel, DispatchError> {
        let uri = endpoint.tunnel_uri();

        {
            let cached = self.channel.read().await;
            if let Some(cached) = cached.as_ref()
                && cached.uri == uri
            {
                return Ok(cached.channel.clone());
            }
        }

        let mut cached = self.channel.write().await;
        // Double-check after acquiring write lock
        if let Some(existing) = cached.as_ref()
            && existing.uri == uri
        {
            return Ok(existing.channel.clone());
        }

        let channel = Endpoint::from_shared(uri.clone())
            .map_err(|e| DispatchError::Unavailable {
                service: self.target.clone(),
                reason: Unavailability::Resolution,
                detail: e.to_string(),
            })?
            .connect_timeout(self.connect_timeout)
            .tcp_nodelay(true)
            .connect_lazy();

        tracing::debug!(service = %self.target, uri = %uri, "Created tunnel channel");
        *cached = Some(CachedChannel {
            uri,
            channel: channel.clone(),
        });
        Ok(channel)
    }

    /// `grpc.health.v1.Health/Check` for the dispatch service.
    pub async fn probe(&self, endpoint: &ResolvedEndpoint, timeout: Duration) -> HealthStatus {
        let channel = match self.channel(endpoint).await {
            Ok(channel) => channel,
            Err(_) => return HealthStatus::Unknown,
        };

        let mut client = HealthClient::new(channel);
        let mut request = tonic::Request::new(HealthCheckRequest {
            service: DISPATCH_SERVICE_NAME.to_string(),
        });
        request.set_timeout(timeout);

        match tokio::time::timeout(timeout, client.check(request)).await {
            Ok(Ok(response)) => HealthStatus::from_proto(response.into_inner().status),
            Ok(Err(status)) if is_connection_refused(&status) => HealthStatus::ServiceUnknown,
            // tonic-health answers NOT_FOUND for names it never registered.
            Ok(Err(status)) if status.code() == Code::NotFound => HealthStatus::ServiceUnknown,
            Ok(Err(status)) => {
                tracing::debug!(
                    service = %self.target,
                    code = ?status.code(),
                    message = status.message(),
                    "Health probe failed"
                );
                HealthStatus::Unknown
            }
            Err(_) => HealthStatus::Unknown,
        }
    }
}

fn wire_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

#[async_trait]
impl Transport for TunneledTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Grpc
    }

    async fn send(&self, call: &OutboundCall<'_>) -> Result<DispatchResponse, DispatchError> {
        let channel = self.channel(call.endpoint).await?;
        let mut client = DispatchServiceClient::new(channel)
            .max_encoding_message_size(self.max_message_size)
            .max_decoding_message_size(self.max_message_size);

        let message = TunneledRequest {
            method: call.request.method.to_string(),
            endpoint: endpoint_with_query(&call.path(), &call.request.query).into_bytes(),
            headers: wire_headers(call.headers),
            user: Some(json_to_struct(&call.context.caller_user)),
            service: Some(json_to_struct(call.service_claims)),
            request_id: call.context.correlation_id().to_string(),
            body: encode_body_fields(&call.request.payload),
            files: encode_files(&call.request.files),
        };

        let mut request = tonic::Request::new(message);
        request.set_timeout(call.timeout);
        inject_trace_context_with_request_id(&mut request, call.context.correlation_id());

        let started = Instant::now();
        let response = match tokio::time::timeout(call.timeout, client.dispatch(request)).await {
            Ok(Ok(response)) => response.into_inner(),
            Ok(Err(status)) => {
                return Err(translate_status(
                    &self.target,
                    &status,
                    Some(call.timeout),
                    started.elapsed(),
                ));
            }
            Err(_) => {
                return Err(DispatchError::Timeout {
                    service: self.target.clone(),
                    timeout: call.timeout,
                });
            }
        };

        let status = u16::try_from(response.status_code)
            .ok()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or_else(|| DispatchError::Protocol {
                service: self.target.clone(),
                detail: format!("invalid tunneled status code {}", response.status_code),
            })?;

        Ok(DispatchResponse::new(
            status,
            decode_body(&response.body),
            TransportKind::Grpc,
        ))
    }

    async fn close(&self) {
        if self.channel.write().await.take().is_some() {
            tracing::debug!(service = %self.target, "Closed tunnel channel");
        }
    }
}
