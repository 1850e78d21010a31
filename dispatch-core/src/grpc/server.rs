//! Tunnel server: the dispatch service, standard health, and optional
//! reflection on one tonic server.

use std::future::Future;
use std::time::Duration;

use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Server;
use tonic_reflection::server::Builder as ReflectionBuilder;

use super::adapter::DispatchGrpcService;
use super::health::HealthComponents;
use super::interceptors::trace_context_interceptor;
use super::proto::FILE_DESCRIPTOR_SET;
use super::proto::dispatch_service_server::DispatchServiceServer;
use super::tracker::ConnectionTracker;
use super::DEFAULT_MAX_MESSAGE_SIZE;

#[derive(Debug, Error)]
pub enum TunnelServerError {
    #[error("tunnel transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("failed to build reflection service: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),
}

/// Builder for the tunnel server.
pub struct TunnelServer {
    service_name: String,
    enable_reflection: bool,
    http2_keepalive_interval: Option<Duration>,
    http2_keepalive_timeout: Option<Duration>,
    concurrency_limit: Option<usize>,
    max_message_size: usize,
    sweep_interval: Duration,
    idle_peer_timeout: Duration,
    tracker: ConnectionTracker,
}

impl TunnelServer {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            enable_reflection: true,
            http2_keepalive_interval: Some(Duration::from_secs(30)),
            http2_keepalive_timeout: Some(Duration::from_secs(10)),
            concurrency_limit: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            sweep_interval: Duration::from_secs(30),
            idle_peer_timeout: Duration::from_secs(120),
            tracker: ConnectionTracker::new(),
        }
    }

    /// Enable or disable gRPC reflection (enabled by default).
    pub fn with_reflection(mut self, enable: bool) -> Self {
        self.enable_reflection = enable;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.http2_keepalive_interval = Some(interval);
        self
    }

    pub fn with_keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.http2_keepalive_timeout = Some(timeout);
        self
    }

    /// Concurrent tunneled calls accepted per connection.
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    /// Largest tunneled request decoded or response encoded.
    pub fn with_max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    /// How often idle peer entries are pruned, and after how long.
    pub fn with_sweep(mut self, every: Duration, idle: Duration) -> Self {
        self.sweep_interval = every;
        self.idle_peer_timeout = idle;
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn reflection_enabled(&self) -> bool {
        self.enable_reflection
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    fn build_server(&self) -> Server {
        let mut server = Server::builder();

        if let Some(interval) = self.http2_keepalive_interval {
            server = server.http2_keepalive_interval(Some(interval));
        }

        if let Some(timeout) = self.http2_keepalive_timeout {
            server = server.http2_keepalive_timeout(Some(timeout));
        }

        if let Some(limit) = self.concurrency_limit {
            server = server.concurrency_limit_per_connection(limit);
        }

        server
    }

    /// Serve tunneled requests against `router` until `shutdown` resolves.
    ///
    /// The health reporter is flipped to not-serving before the server
    /// stops, so `Watch` clients see the change.
    pub async fn serve<H, F>(
        self,
        router: Router,
        health: HealthComponents<H>,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<(), TunnelServerError>
    where
        H: tonic_health::pb::health_server::Health,
        F: Future<Output = ()> + Send,
    {
        let reflection = if self.enable_reflection {
            Some(create_reflection_service(&[FILE_DESCRIPTOR_SET])?)
        } else {
            None
        };

        let dispatch = DispatchServiceServer::new(DispatchGrpcService::new(
            router,
            self.tracker.clone(),
        ))
        .max_decoding_message_size(self.max_message_size)
        .max_encoding_message_size(self.max_message_size);
        let stop_sweeper = CancellationToken::new();
        let sweeper = self.tracker.spawn_sweeper(
            self.sweep_interval,
            self.idle_peer_timeout,
            stop_sweeper.clone(),
        );

        let addr = listener.local_addr().ok();
        tracing::info!(service = %self.service_name, addr = ?addr, "Tunnel server listening");

        let reporter = health.reporter.clone();
        let result = self
            .build_server()
            .add_service(health.server)
            .add_service(InterceptedService::new(dispatch, trace_context_interceptor))
            .add_optional_service(reflection)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                shutdown.await;
                reporter.set_not_serving().await;
            })
            .await;

        stop_sweeper.cancel();
        let _ = sweeper.await;
        tracing::info!(service = %self.service_name, "Tunnel server stopped");

        result.map_err(TunnelServerError::from)
    }
}

/// Reflection over the given encoded file descriptor sets.
pub fn create_reflection_service(
    file_descriptor_sets: &[&[u8]],
) -> Result<
    tonic_reflection::server::ServerReflectionServer<
        impl tonic_reflection::server::ServerReflection,
    >,
    tonic_reflection::server::Error,
> {
    let mut builder = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET);

    for fds in file_descriptor_sets {
        builder = builder.register_encoded_file_descriptor_set(fds);
    }

    builder.build_v1()
}
