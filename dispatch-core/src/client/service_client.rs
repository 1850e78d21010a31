//! Per-target client: transport selection, fallback, retries and result
//! settling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tracing::{instrument, warn};

use super::descriptor::{
    CachedResolver, ConfigResolver, ResolvedEndpoint, ServiceDescriptor, ServiceResolver,
};
use super::error::{DispatchError, Unavailability, UpstreamBody};
use super::headers::outbound_headers;
use super::health::{GrpcHealthProbe, HealthProbe, HealthStatusCache};
use super::http::{HttpPoolConfig, HttpTransport};
use super::identity::ServiceIdentity;
use super::request::{DispatchRequest, DispatchResponse};
use super::retry::{RetryPolicy, retry_dispatch};
use super::transport::{OutboundCall, Transport, TransportKind};
use super::tunnel::TunneledTransport;
use crate::config::DispatchSettings;
use crate::context::OutboundContext;

/// Service token and its claims, signed once per client.
struct Credentials {
    token: String,
    claims: Map<String, Value>,
}

pub struct ServiceClientBuilder {
    name: String,
    settings: Arc<DispatchSettings>,
    identity: Arc<ServiceIdentity>,
    resolver: Option<Arc<dyn ServiceResolver>>,
    health_probe: Option<Arc<dyn HealthProbe>>,
}

impl ServiceClientBuilder {
    /// Replace service discovery. The resolver is used as given, without an
    /// extra cache in front of it.
    pub fn resolver(mut self, resolver: Arc<dyn ServiceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Replace the tunnel health probe.
    pub fn health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.health_probe = Some(probe);
        self
    }

    pub fn build(self) -> ServiceClient {
        let settings = self.settings;
        let descriptor = ServiceDescriptor::from_settings(&self.name, &settings);

        let resolver = self.resolver.unwrap_or_else(|| {
            Arc::new(CachedResolver::new(
                Arc::new(ConfigResolver),
                settings.resolve_ttl(),
            ))
        });

        let tunnel = Arc::new(
            TunneledTransport::new(&self.name, settings.connect_timeout())
                .with_max_message_size(settings.max_message_bytes),
        );

        let probe = self.health_probe.unwrap_or_else(|| {
            Arc::new(GrpcHealthProbe::new(
                descriptor.clone(),
                resolver.clone(),
                tunnel.clone(),
                settings.health_probe_timeout(),
            ))
        });

        let http = HttpTransport::new(
            &self.name,
            HttpPoolConfig {
                connect_timeout: settings.connect_timeout(),
                max_idle_per_host: settings.max_keepalive_connections,
                permits: settings.dispatch_permits(),
            },
        );

        ServiceClient {
            health: HealthStatusCache::new(&self.name, probe, settings.health_ttl()),
            retry: RetryPolicy::from_settings(&settings),
            request_timeout: settings.request_timeout(),
            identity: self.identity,
            credentials: OnceCell::new(),
            closed: AtomicBool::new(false),
            descriptor,
            resolver,
            http,
            tunnel,
        }
    }
}

/// The façade every outbound call to one target goes through.
///
/// Owns one HTTP pool and one tunnel channel, both created on first use.
pub struct ServiceClient {
    descriptor: ServiceDescriptor,
    identity: Arc<ServiceIdentity>,
    resolver: Arc<dyn ServiceResolver>,
    health: HealthStatusCache,
    http: HttpTransport,
    tunnel: Arc<TunneledTransport>,
    retry: RetryPolicy,
    request_timeout: Duration,
    credentials: OnceCell<Credentials>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("name", &self.descriptor.name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ServiceClient {
    pub fn builder(
        name: impl Into<String>,
        settings: Arc<DispatchSettings>,
        identity: Arc<ServiceIdentity>,
    ) -> ServiceClientBuilder {
        ServiceClientBuilder {
            name: name.into(),
            settings,
            identity,
            resolver: None,
            health_probe: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn health(&self) -> &HealthStatusCache {
        &self.health
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tunnel first when the target reports serving, HTTP otherwise.
    ///
    /// A refused tunnel connection or a protocol error retries the same call
    /// over HTTP. A timeout is returned as-is.
    #[instrument(
        skip(self, ctx, request),
        fields(
            target_service = %self.descriptor.name,
            method = %request.method,
            endpoint = %request.endpoint,
            request_id = %ctx.correlation_id(),
            transport
        )
    )]
    pub async fn dispatch(
        &self,
        ctx: &OutboundContext,
        request: DispatchRequest,
    ) -> Result<DispatchResponse, DispatchError> {
        let started = Instant::now();

        let (transport, outcome) = if self.health.is_serving().await {
            match self.send(&*self.tunnel, ctx, &request).await {
                Err(err) if err.allows_fallback() => {
                    warn!(error = %err, "Tunnel unusable, falling back to HTTP");
                    counter!(
                        "dispatch_fallbacks_total",
                        "target" => self.descriptor.name.clone()
                    )
                    .increment(1);
                    (
                        TransportKind::Http,
                        self.send(&self.http, ctx, &request).await,
                    )
                }
                outcome => (TransportKind::Grpc, outcome),
            }
        } else {
            (
                TransportKind::Http,
                self.send(&self.http, ctx, &request).await,
            )
        };

        tracing::Span::current().record("transport", transport.as_str());
        self.settle(transport, outcome, &request, started)
    }

    /// HTTP only, with the retry policy applied.
    pub async fn http_dispatch(
        &self,
        ctx: &OutboundContext,
        request: DispatchRequest,
    ) -> Result<DispatchResponse, DispatchError> {
        let started = Instant::now();
        let outcome = self.send(&self.http, ctx, &request).await;
        self.settle(TransportKind::Http, outcome, &request, started)
    }

    /// Tunnel only: no health gate, no fallback, no retries.
    pub async fn grpc_dispatch(
        &self,
        ctx: &OutboundContext,
        request: DispatchRequest,
    ) -> Result<DispatchResponse, DispatchError> {
        let started = Instant::now();
        let outcome = self.send(&*self.tunnel, ctx, &request).await;
        self.settle(TransportKind::Grpc, outcome, &request, started)
    }

    async fn send(
        &self,
        transport: &dyn Transport,
        ctx: &OutboundContext,
        request: &DispatchRequest,
    ) -> Result<DispatchResponse, DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::Unavailable {
                service: self.descriptor.name.clone(),
                reason: Unavailability::Closed,
                detail: "client was closed".to_string(),
            });
        }
        request.validate(&self.descriptor.name)?;

        let endpoint = self.resolve().await?;
        let credentials = self.credentials().await?;
        let headers = outbound_headers(ctx, &credentials.token, request.has_files(), &request.headers);

        let call = OutboundCall {
            target: &self.descriptor.name,
            request,
            context: ctx,
            endpoint: &endpoint,
            headers: &headers,
            service_claims: &credentials.claims,
            timeout: request.timeout.unwrap_or(self.request_timeout),
        };

        match transport.kind() {
            TransportKind::Http => {
                retry_dispatch(
                    &self.retry,
                    &self.descriptor.name,
                    &request.method,
                    request.retry_count,
                    |_| transport.send(&call),
                )
                .await
            }
            TransportKind::Grpc => transport.send(&call).await,
        }
    }

    async fn resolve(&self) -> Result<ResolvedEndpoint, DispatchError> {
        self.resolver
            .resolve(&self.descriptor)
            .await
            .map_err(|e| DispatchError::Unavailable {
                service: self.descriptor.name.clone(),
                reason: Unavailability::Resolution,
                detail: e.to_string(),
            })
    }

    async fn credentials(&self) -> Result<&Credentials, DispatchError> {
        self.credentials
            .get_or_try_init(|| async {
                let issued = self
                    .identity
                    .issue(&self.descriptor.name)
                    .map_err(|e| DispatchError::Unknown {
                        service: self.descriptor.name.clone(),
                        detail: format!("failed to sign service token: {e}"),
                    })?;
                Ok::<_, DispatchError>(Credentials {
                    claims: issued.claims.to_map(),
                    token: issued.token,
                })
            })
            .await
    }

    /// Apply `propagate_error`: raise failures and >= 400 responses, or hand
    /// them back as `(body, status)`.
    fn settle(
        &self,
        transport: TransportKind,
        outcome: Result<DispatchResponse, DispatchError>,
        request: &DispatchRequest,
        started: Instant,
    ) -> Result<DispatchResponse, DispatchError> {
        let outcome = match outcome {
            Ok(response) if request.propagate_error && response.status.as_u16() >= 400 => {
                Err(DispatchError::Upstream {
                    service: self.descriptor.name.clone(),
                    status: response.status.as_u16(),
                    body: UpstreamBody::from_json(response.body),
                })
            }
            other => other,
        };

        let label = match &outcome {
            Ok(response) if response.status.is_success() => "success".to_string(),
            Ok(response) => response.status.as_u16().to_string(),
            Err(err) => err.error_code().to_string(),
        };
        counter!(
            "dispatch_requests_total",
            "target" => self.descriptor.name.clone(),
            "transport" => transport.as_str(),
            "outcome" => label
        )
        .increment(1);
        histogram!(
            "dispatch_duration_seconds",
            "target" => self.descriptor.name.clone(),
            "transport" => transport.as_str()
        )
        .record(started.elapsed().as_secs_f64());

        match outcome {
            Err(err) if !request.propagate_error => {
                tracing::debug!(error = %err, "Returning dispatch failure as data");
                Ok(DispatchResponse::from_error(&err, transport))
            }
            other => other,
        }
    }

    /// Close both transports. Later dispatches fail as `Unavailable`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.http.close().await;
        self.tunnel.close().await;
        tracing::info!(service = %self.descriptor.name, "Service client closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::HealthStatus;
    use async_trait::async_trait;
    use secrecy::Secret;

    struct FixedProbe(HealthStatus);

    #[async_trait]
    impl HealthProbe for FixedProbe {
        async fn probe(&self) -> HealthStatus {
            self.0
        }
    }

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn client(status: HealthStatus) -> ServiceClient {
        let mut settings = DispatchSettings {
            host_template: "127.0.0.1".into(),
            port: closed_port(),
            ..Default::default()
        };
        settings.request_timeout_secs = 2;
        let identity = Arc::new(ServiceIdentity::new(
            "caller",
            &Secret::new("secret".to_string()),
        ));

        ServiceClient::builder("ghost", Arc::new(settings), identity)
            .health_probe(Arc::new(FixedProbe(status)))
            .build()
    }

    #[tokio::test]
    async fn test_debug_names_target() {
        let client = client(HealthStatus::Serving);
        assert_eq!(format!("{client:?}"), r#"ServiceClient { name: "ghost", closed: false, .. }"#);
        client.close().await;
        assert!(format!("{client:?}").contains("closed: true"));
    }

    #[tokio::test]
    async fn test_unserializable_field_never_sent() {
        let client = client(HealthStatus::Serving);
        let mut amounts = std::collections::HashMap::new();
        amounts.insert((1, 2), 10);

        let err = client
            .grpc_dispatch(
                &OutboundContext::new("req-1"),
                DispatchRequest::post("invoices")
                    .field("amounts", amounts)
                    .propagate_error(true),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unknown { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_unreachable_target_returned_as_data() {
        let client = client(HealthStatus::NotServing);
        let response = client
            .dispatch(&OutboundContext::new("req-1"), DispatchRequest::post("ping"))
            .await
            .unwrap();

        assert_eq!(response.status, http::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.transport, TransportKind::Http);
        assert_eq!(response.body["error_code"], "service_unavailable");
    }

    #[tokio::test]
    async fn test_unreachable_target_raised_when_propagating() {
        let client = client(HealthStatus::Serving);
        let err = client
            .dispatch(
                &OutboundContext::new("req-1"),
                DispatchRequest::post("ping").propagate_error(true),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Unavailable { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let client = client(HealthStatus::NotServing);
        client.close().await;
        client.close().await;
        assert!(client.is_closed());

        let err = client
            .http_dispatch(
                &OutboundContext::default(),
                DispatchRequest::get("ping").propagate_error(true),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Unavailable {
                reason: Unavailability::Closed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_credentials_signed_once() {
        let client = client(HealthStatus::NotServing);
        let first = client.credentials().await.unwrap().token.clone();
        let second = client.credentials().await.unwrap().token.clone();
        assert_eq!(first, second);
        assert_eq!(client.credentials().await.unwrap().claims["aud"], "ghost");
    }
}
