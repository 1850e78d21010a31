//! Service descriptors and endpoint resolution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::DispatchSettings;

/// Static description of a target service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub scheme: String,
    /// `{name}` is replaced by `name`.
    pub host_template: String,
    pub base_port: u16,
    pub tunnel_port_offset: i32,
    pub api_version: String,
}

impl ServiceDescriptor {
    /// Build the descriptor for `name` from the shared settings and any
    /// per-service override.
    pub fn from_settings(name: &str, settings: &DispatchSettings) -> Self {
        let overrides = settings.services.get(name).cloned().unwrap_or_default();

        Self {
            name: name.to_string(),
            scheme: overrides
                .scheme
                .unwrap_or_else(|| settings.default_scheme.clone()),
            host_template: overrides
                .host
                .unwrap_or_else(|| settings.host_template.clone()),
            base_port: overrides.port.unwrap_or(settings.port),
            tunnel_port_offset: overrides
                .tunnel_port_offset
                .unwrap_or(settings.tunnel_port_offset),
            api_version: settings.api_version.clone(),
        }
    }

    pub fn host(&self) -> String {
        self.host_template.replace("{name}", &self.name)
    }
}

/// Host and ports fixed for the duration of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub name: String,
    pub scheme: String,
    pub host: String,
    pub http_port: u16,
    pub tunnel_port: u16,
    pub api_version: String,
}

impl ResolvedEndpoint {
    pub fn http_base(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.http_port)
    }

    /// The tunnel always speaks cleartext HTTP/2.
    pub fn tunnel_uri(&self) -> String {
        format!("http://{}:{}", self.host, self.tunnel_port)
    }

    /// `/api/<version>/<endpoint>`, or the endpoint as-is when absolute.
    pub fn request_path(&self, endpoint: &str) -> String {
        if endpoint.starts_with('/') {
            endpoint.to_string()
        } else {
            format!("/api/{}/{}", self.api_version, endpoint)
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no address for {0}")]
    NoAddress(String),

    #[error("tunnel port for {service} is out of range ({port})")]
    PortOutOfRange { service: String, port: i64 },
}

/// Service discovery: turns a descriptor into a concrete endpoint.
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    async fn resolve(&self, descriptor: &ServiceDescriptor)
    -> Result<ResolvedEndpoint, ResolveError>;
}

/// Resolves purely from configuration: templated host, configured port.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigResolver;

#[async_trait]
impl ServiceResolver for ConfigResolver {
    async fn resolve(
        &self,
        descriptor: &ServiceDescriptor,
    ) -> Result<ResolvedEndpoint, ResolveError> {
        let host = descriptor.host();
        if host.trim().is_empty() {
            return Err(ResolveError::NoAddress(descriptor.name.clone()));
        }

        let tunnel_port = i64::from(descriptor.base_port) + i64::from(descriptor.tunnel_port_offset);
        let tunnel_port = u16::try_from(tunnel_port).map_err(|_| ResolveError::PortOutOfRange {
            service: descriptor.name.clone(),
            port: tunnel_port,
        })?;

        Ok(ResolvedEndpoint {
            name: descriptor.name.clone(),
            scheme: descriptor.scheme.clone(),
            host,
            http_port: descriptor.base_port,
            tunnel_port,
            api_version: descriptor.api_version.clone(),
        })
    }
}

struct CachedEndpoint {
    endpoint: ResolvedEndpoint,
    resolved_at: Instant,
}

/// TTL cache in front of another resolver.
///
/// Each name owns a lock, so concurrent lookups of a stale name wait for one
/// resolution instead of each issuing their own.
pub struct CachedResolver {
    inner: Arc<dyn ServiceResolver>,
    ttl: Duration,
    entries: Mutex<HashMap<String, Arc<Mutex<Option<CachedEndpoint>>>>>,
}

impl CachedResolver {
    pub fn new(inner: Arc<dyn ServiceResolver>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, name: &str) -> Arc<Mutex<Option<CachedEndpoint>>> {
        let mut entries = self.entries.lock().await;
        entries.entry(name.to_string()).or_default().clone()
    }

    pub async fn invalidate(&self, name: &str) {
        self.entries.lock().await.remove(name);
    }
}

#[async_trait]
impl ServiceResolver for CachedResolver {
    async fn resolve(
        &self,
        descriptor: &ServiceDescriptor,
    ) -> Result<ResolvedEndpoint, ResolveError> {
        let slot = self.slot(&descriptor.name).await;
        let mut cached = slot.lock().await;

        if let Some(entry) = cached.as_ref()
            && entry.resolved_at.elapsed() < self.ttl
        {
            return Ok(entry.endpoint.clone());
        }

        let endpoint = self.inner.resolve(descriptor).await?;
        tracing::debug!(
            service = %descriptor.name,
            host = %endpoint.host,
            http_port = endpoint.http_port,
            tunnel_port = endpoint.tunnel_port,
            "Resolved service endpoint"
        );
        *cached = Some(CachedEndpoint {
            endpoint: endpoint.clone(),
            resolved_at: Instant::now(),
        });
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceOverride;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver(AtomicUsize);

    #[async_trait]
    impl ServiceResolver for CountingResolver {
        async fn resolve(
            &self,
            descriptor: &ServiceDescriptor,
        ) -> Result<ResolvedEndpoint, ResolveError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            ConfigResolver.resolve(descriptor).await
        }
    }

    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::from_settings("ledger", &DispatchSettings::default())
    }

    #[test]
    fn test_descriptor_from_settings() {
        let mut settings = DispatchSettings {
            host_template: "{name}.internal".into(),
            ..Default::default()
        };
        settings.services.insert(
            "billing".into(),
            ServiceOverride {
                host: Some("127.0.0.1".into()),
                port: Some(9000),
                ..Default::default()
            },
        );

        let ledger = ServiceDescriptor::from_settings("ledger", &settings);
        assert_eq!(ledger.host(), "ledger.internal");
        assert_eq!(ledger.base_port, 8080);

        let billing = ServiceDescriptor::from_settings("billing", &settings);
        assert_eq!(billing.host(), "127.0.0.1");
        assert_eq!(billing.base_port, 9000);
        assert_eq!(billing.tunnel_port_offset, 1);
    }

    #[tokio::test]
    async fn test_config_resolver_ports() {
        let endpoint = ConfigResolver.resolve(&descriptor()).await.unwrap();
        assert_eq!(endpoint.http_base(), "http://ledger:8080");
        assert_eq!(endpoint.tunnel_uri(), "http://ledger:8081");
        assert_eq!(endpoint.request_path("ping"), "/api/v1/ping");
        assert_eq!(endpoint.request_path("/health"), "/health");
    }

    #[tokio::test]
    async fn test_tunnel_port_out_of_range() {
        let mut descriptor = descriptor();
        descriptor.base_port = u16::MAX;
        let err = ConfigResolver.resolve(&descriptor).await.unwrap_err();
        assert!(matches!(err, ResolveError::PortOutOfRange { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_resolver_once_per_window() {
        let counting = Arc::new(CountingResolver(AtomicUsize::new(0)));
        let cached = CachedResolver::new(counting.clone(), Duration::from_secs(60));
        let descriptor = descriptor();

        cached.resolve(&descriptor).await.unwrap();
        cached.resolve(&descriptor).await.unwrap();
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        cached.resolve(&descriptor).await.unwrap();
        assert_eq!(counting.0.load(Ordering::SeqCst), 2);
    }
}
