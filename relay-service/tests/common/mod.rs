//! Test helper module for relay-service integration tests.

#![allow(dead_code)]

use dispatch_core::config::{DispatchSettings, ServiceOverride};
use relay_service::config::RelayConfig;
use relay_service::startup::Application;
use secrecy::Secret;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

pub const TEST_SECRET: &str = "relay-test-secret";

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub name: String,
    pub http_address: String,
    pub http_port: u16,
    pub tunnel_port: u16,
    shutdown: CancellationToken,
}

impl TestApp {
    /// Spawn a relay on random ports that may dispatch to `peers`.
    pub async fn spawn(name: &str, peers: &[&TestApp]) -> Self {
        Self::spawn_with(name, peers, |_| {}).await
    }

    pub async fn spawn_with(
        name: &str,
        peers: &[&TestApp],
        customize: impl FnOnce(&mut DispatchSettings),
    ) -> Self {
        let services: HashMap<String, ServiceOverride> = peers
            .iter()
            .map(|peer| {
                (
                    peer.name.clone(),
                    ServiceOverride {
                        host: Some("127.0.0.1".to_string()),
                        port: Some(peer.http_port),
                        scheme: None,
                        tunnel_port_offset: Some(
                            i32::from(peer.tunnel_port) - i32::from(peer.http_port),
                        ),
                    },
                )
            })
            .collect();

        let mut dispatch = DispatchSettings {
            service_name: name.to_string(),
            port: 0,
            token_secret: Secret::new(TEST_SECRET.to_string()),
            connect_timeout_secs: 1,
            health_probe_timeout_secs: 1,
            request_timeout_secs: 5,
            connections: peers.iter().map(|p| p.name.clone()).collect(),
            services,
            ..Default::default()
        };
        customize(&mut dispatch);

        let config = RelayConfig {
            dispatch,
            log_level: "warn".to_string(),
            otlp_endpoint: None,
        };

        let app = Application::build(config)
            .await
            .expect("Failed to build test application");

        let http_port = app.http_port();
        let tunnel_port = app.tunnel_port();
        let shutdown = app.shutdown_token();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for HTTP server to be ready by polling health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("http://127.0.0.1:{}/health", http_port);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        // Additional wait for the tunnel server
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        TestApp {
            name: name.to_string(),
            http_address: format!("http://127.0.0.1:{}", http_port),
            http_port,
            tunnel_port,
            shutdown,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.http_address, path)
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
