use crate::error::AppError;
use config::{Config as Cfg, Environment, File};
use secrecy::Secret;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Settings shared by every outbound `ServiceClient` and by the tunnel server.
///
/// Loaded from an optional `configuration` file, then from `APP__*`
/// environment variables (e.g. `APP__MAX_RETRY_COUNT=4`,
/// `APP__CONNECTIONS=billing,ledger`).
#[derive(Debug, Deserialize, Clone)]
pub struct DispatchSettings {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_token_secret")]
    pub token_secret: Secret<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_keepalive_connections")]
    pub max_keepalive_connections: usize,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_retry_count")]
    pub default_retry_count: u32,
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    /// Tunnel port relative to the HTTP port of the same service.
    #[serde(default = "default_tunnel_port_offset")]
    pub tunnel_port_offset: i32,
    #[serde(default = "default_ttl_secs")]
    pub health_ttl_secs: u64,
    #[serde(default = "default_health_probe_timeout_secs")]
    pub health_probe_timeout_secs: u64,
    #[serde(default = "default_ttl_secs")]
    pub resolve_ttl_secs: u64,
    /// Largest tunneled message either side encodes or decodes.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// `{name}` is replaced by the target service name.
    #[serde(default = "default_host_template")]
    pub host_template: String,
    #[serde(default = "default_scheme")]
    pub default_scheme: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub connections: Vec<String>,
    #[serde(default)]
    pub required_connections: Vec<String>,
    #[serde(default)]
    pub services: HashMap<String, ServiceOverride>,
}

/// Per-target overrides of the templated host/port.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ServiceOverride {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub scheme: Option<String>,
    pub tunnel_port_offset: Option<i32>,
}

fn default_service_name() -> String {
    "service".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_token_secret() -> Secret<String> {
    Secret::new("insecure-development-secret".to_string())
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_max_connections() -> usize {
    100
}

fn default_max_keepalive_connections() -> usize {
    20
}

fn default_concurrency_limit() -> usize {
    20
}

fn default_retry_count() -> u32 {
    2
}

fn default_max_retry_count() -> u32 {
    4
}

fn default_tunnel_port_offset() -> i32 {
    1
}

fn default_ttl_secs() -> u64 {
    60
}

fn default_health_probe_timeout_secs() -> u64 {
    10
}

fn default_max_message_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_host_template() -> String {
    "{name}".to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_api_version() -> String {
    "v1".to_string()
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            port: default_port(),
            token_secret: default_token_secret(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_connections: default_max_connections(),
            max_keepalive_connections: default_max_keepalive_connections(),
            concurrency_limit: default_concurrency_limit(),
            default_retry_count: default_retry_count(),
            max_retry_count: default_max_retry_count(),
            tunnel_port_offset: default_tunnel_port_offset(),
            health_ttl_secs: default_ttl_secs(),
            health_probe_timeout_secs: default_health_probe_timeout_secs(),
            resolve_ttl_secs: default_ttl_secs(),
            max_message_bytes: default_max_message_bytes(),
            host_template: default_host_template(),
            default_scheme: default_scheme(),
            api_version: default_api_version(),
            connections: Vec::new(),
            required_connections: Vec::new(),
            services: HashMap::new(),
        }
    }
}

impl DispatchSettings {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("connections")
                    .with_list_parse_key("required_connections"),
            )
            .build()?;

        let settings: Self = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.concurrency_limit == 0 || self.max_connections == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "concurrency_limit and max_connections must be positive"
            )));
        }
        if self.max_message_bytes == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "max_message_bytes must be positive"
            )));
        }
        if self.default_retry_count > self.max_retry_count {
            tracing::warn!(
                default_retry_count = self.default_retry_count,
                max_retry_count = self.max_retry_count,
                "default_retry_count exceeds max_retry_count and will be capped"
            );
        }
        Ok(())
    }

    /// The allow-list: declared plus required connections.
    pub fn allowed_services(&self) -> BTreeSet<String> {
        self.connections
            .iter()
            .chain(self.required_connections.iter())
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn health_ttl(&self) -> Duration {
        Duration::from_secs(self.health_ttl_secs)
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.health_probe_timeout_secs)
    }

    pub fn resolve_ttl(&self) -> Duration {
        Duration::from_secs(self.resolve_ttl_secs)
    }

    /// Width of the in-flight HTTP dispatch limiter.
    pub fn dispatch_permits(&self) -> usize {
        self.concurrency_limit.min(self.max_connections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = DispatchSettings::default();
        assert_eq!(settings.tunnel_port_offset, 1);
        assert_eq!(settings.health_ttl(), Duration::from_secs(60));
        assert_eq!(settings.resolve_ttl(), Duration::from_secs(60));
        assert_eq!(settings.dispatch_permits(), 20);
        assert_eq!(settings.max_message_bytes, 64 * 1024 * 1024);
        assert!(settings.allowed_services().is_empty());
    }

    #[test]
    fn test_allowed_services_is_union() {
        let settings = DispatchSettings {
            connections: vec!["billing".into(), "ledger".into()],
            required_connections: vec!["ledger".into(), " auth ".into(), "".into()],
            ..Default::default()
        };
        let allowed: Vec<_> = settings.allowed_services().into_iter().collect();
        assert_eq!(allowed, vec!["auth", "billing", "ledger"]);
    }

    #[test]
    fn test_permits_bounded_by_max_connections() {
        let settings = DispatchSettings {
            concurrency_limit: 50,
            max_connections: 8,
            ..Default::default()
        };
        assert_eq!(settings.dispatch_permits(), 8);
    }
}
