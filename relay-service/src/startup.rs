//! Application startup and lifecycle management.

use crate::config::RelayConfig;
use crate::handlers::{api, health, AppState};
use axum::routing::{any, get, post};
use axum::Router;
use dispatch_core::client::ServiceRegistry;
use dispatch_core::error::AppError;
use dispatch_core::grpc::{create_health_service, TunnelServer, DISPATCH_SERVICE_NAME};
use dispatch_core::middleware::apply_standard_layers;
use dispatch_core::observability::init_metrics;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    tunnel_port: u16,
    http_listener: TcpListener,
    tunnel_listener: TcpListener,
    state: AppState,
    config: RelayConfig,
    shutdown: CancellationToken,
}

impl Application {
    /// Build the application and bind both listeners.
    pub async fn build(config: RelayConfig) -> Result<Self, AppError> {
        init_metrics();

        let registry = Arc::new(ServiceRegistry::new(Arc::new(config.dispatch.clone())));
        let state = AppState {
            service_name: config.service_name().to_string(),
            registry,
        };

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.dispatch.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        let tunnel_addr = SocketAddr::from(([0, 0, 0, 0], config.tunnel_port(http_port)?));
        let tunnel_listener = TcpListener::bind(tunnel_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %tunnel_addr, "Failed to bind tunnel listener");
            AppError::from(e)
        })?;
        let tunnel_port = tunnel_listener.local_addr()?.port();

        tracing::info!(http_port, tunnel_port, "Relay service listeners bound");

        Ok(Self {
            http_port,
            tunnel_port,
            http_listener,
            tunnel_listener,
            state,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn tunnel_port(&self) -> u16 {
        self.tunnel_port
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.state.registry
    }

    /// Cancel this token to stop both servers gracefully.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn router(&self) -> Router {
        let router = Router::new()
            .route("/api/v1/ping", get(api::ping))
            .route("/api/v1/echo", any(api::echo))
            .route("/api/v1/upload", post(api::upload))
            .route("/api/v1/fail/:code", any(api::fail))
            .route("/api/v1/relay/:service/*path", any(api::relay))
            .route("/health", get(health::health_check))
            .route("/ready", get(health::readiness_check))
            .route("/metrics", get(health::metrics_handler))
            .with_state(self.state.clone());

        apply_standard_layers(router, self.state.registry.identity().clone())
    }

    /// Serve HTTP and the tunnel until the shutdown token is cancelled or
    /// either server fails, then close every outbound client.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = self.router();
        let health = create_health_service(DISPATCH_SERVICE_NAME).await;

        let tunnel = TunnelServer::new(self.config.service_name())
            .with_concurrency_limit(self.config.dispatch.concurrency_limit)
            .with_max_message_size(self.config.dispatch.max_message_bytes)
            .serve(
                router.clone(),
                health,
                self.tunnel_listener,
                self.shutdown.clone().cancelled_owned(),
            );

        let http = axum::serve(
            self.http_listener,
            router
                .layer(TraceLayer::new_for_http())
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(self.shutdown.clone().cancelled_owned())
        .into_future();

        tracing::info!(
            service = %self.state.service_name,
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            tunnel_port = self.tunnel_port,
            "Service ready to accept connections"
        );

        let result = tokio::select! {
            result = http => result.map_err(|e| {
                tracing::error!(error = %e, "HTTP server error");
                std::io::Error::other(format!("HTTP server error: {}", e))
            }),
            result = tunnel => result.map_err(|e| {
                tracing::error!(error = %e, "Tunnel server error");
                std::io::Error::other(format!("Tunnel server error: {}", e))
            }),
        };

        self.shutdown.cancel();
        self.state.registry.shutdown().await;
        result
    }
}
