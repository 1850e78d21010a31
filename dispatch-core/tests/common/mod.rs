//! Test helpers for dispatch-core integration tests.
//!
//! Upstreams are real axum routers served on random local ports, over plain
//! HTTP and through the tunnel server.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use dispatch_core::client::{HealthProbe, ProbeFactory, ServiceIdentity, ServiceRegistry};
use dispatch_core::config::{DispatchSettings, ServiceOverride};
use dispatch_core::grpc::{DISPATCH_SERVICE_NAME, HealthStatus, TunnelServer, create_health_service};
use dispatch_core::middleware::apply_standard_layers;
use secrecy::Secret;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const TEST_SECRET: &str = "integration-test-secret";
pub const CALLER: &str = "caller";

pub fn secret() -> Secret<String> {
    Secret::new(TEST_SECRET.to_string())
}

/// A running upstream service. Stops when dropped.
pub struct Upstream {
    pub name: String,
    pub http_port: u16,
    pub tunnel_port: u16,
    shutdown: CancellationToken,
}

impl Upstream {
    /// Serve `router` over HTTP and through the tunnel.
    pub async fn spawn(name: &str, router: Router) -> Self {
        Self::spawn_inner(name, router, Some(std::convert::identity)).await
    }

    /// Like `spawn`, with the tunnel server adjusted by `configure`.
    pub async fn spawn_with_tunnel(
        name: &str,
        router: Router,
        configure: fn(TunnelServer) -> TunnelServer,
    ) -> Self {
        Self::spawn_inner(name, router, Some(configure)).await
    }

    /// Serve `router` over HTTP only; the tunnel port refuses connections.
    pub async fn spawn_http_only(name: &str, router: Router) -> Self {
        Self::spawn_inner(name, router, None).await
    }

    async fn spawn_inner(
        name: &str,
        router: Router,
        tunnel: Option<fn(TunnelServer) -> TunnelServer>,
    ) -> Self {
        let identity = Arc::new(ServiceIdentity::new(name, &secret()));
        let router = apply_standard_layers(router, identity);
        let shutdown = CancellationToken::new();

        let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_port = http_listener.local_addr().unwrap().port();
        let tunnel_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tunnel_port = tunnel_listener.local_addr().unwrap().port();

        let http_router = router.clone();
        let http_shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(
                http_listener,
                http_router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(http_shutdown.cancelled_owned())
            .await
            .ok();
        });

        if let Some(configure) = tunnel {
            let health = create_health_service(DISPATCH_SERVICE_NAME).await;
            let tunnel_shutdown = shutdown.clone();
            let server = configure(TunnelServer::new(name).with_reflection(false));
            tokio::spawn(async move {
                server
                    .serve(router, health, tunnel_listener, tunnel_shutdown.cancelled_owned())
                    .await
                    .ok();
            });
        } else {
            drop(tunnel_listener);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            name: name.to_string(),
            http_port,
            tunnel_port,
            shutdown,
        }
    }

    fn service_override(&self) -> ServiceOverride {
        ServiceOverride {
            host: Some("127.0.0.1".to_string()),
            port: Some(self.http_port),
            scheme: None,
            tunnel_port_offset: Some(i32::from(self.tunnel_port) - i32::from(self.http_port)),
        }
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Settings for the calling service, pointing at `upstreams`.
pub fn caller_settings(upstreams: &[&Upstream]) -> DispatchSettings {
    let services: HashMap<String, ServiceOverride> = upstreams
        .iter()
        .map(|u| (u.name.clone(), u.service_override()))
        .collect();

    DispatchSettings {
        service_name: CALLER.to_string(),
        token_secret: secret(),
        request_timeout_secs: 5,
        connect_timeout_secs: 1,
        health_probe_timeout_secs: 1,
        connections: upstreams.iter().map(|u| u.name.clone()).collect(),
        services,
        ..Default::default()
    }
}

pub fn registry(upstreams: &[&Upstream]) -> ServiceRegistry {
    ServiceRegistry::new(Arc::new(caller_settings(upstreams)))
}

/// Registry whose health probes always report `status` and count calls.
pub fn registry_with_probe(upstreams: &[&Upstream], probe: Arc<CountingProbe>) -> ServiceRegistry {
    with_probe(registry(upstreams), probe)
}

pub fn with_probe(registry: ServiceRegistry, probe: Arc<CountingProbe>) -> ServiceRegistry {
    let factory: ProbeFactory = Arc::new(move |_name: &str| probe.clone() as Arc<dyn HealthProbe>);
    registry.with_probe_factory(factory)
}

pub struct CountingProbe {
    status: HealthStatus,
    delay: Duration,
    calls: AtomicUsize,
}

impl CountingProbe {
    pub fn new(status: HealthStatus) -> Arc<Self> {
        Self::with_delay(status, Duration::ZERO)
    }

    pub fn with_delay(status: HealthStatus, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            status,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for CountingProbe {
    async fn probe(&self) -> HealthStatus {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.status
    }
}

/// Counts handler invocations.
#[derive(Clone, Default)]
pub struct Hits(Arc<AtomicUsize>);

impl Hits {
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
