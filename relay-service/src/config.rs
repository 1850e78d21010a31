use dispatch_core::config::DispatchSettings;
use dispatch_core::error::AppError;
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(flatten)]
    pub dispatch: DispatchSettings,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
}

impl RelayConfig {
    pub fn load() -> Result<Self, AppError> {
        let dispatch = DispatchSettings::load()?;

        Ok(RelayConfig {
            dispatch,
            log_level: get_env("LOG_LEVEL", Some("info"))?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|v| !v.is_empty()),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.dispatch.service_name
    }

    /// Tunnel port for an HTTP port. An ephemeral HTTP port gets an
    /// ephemeral tunnel port.
    pub fn tunnel_port(&self, http_port: u16) -> Result<u16, AppError> {
        if self.dispatch.port == 0 {
            return Ok(0);
        }
        let port = i64::from(http_port) + i64::from(self.dispatch.tunnel_port_offset);
        u16::try_from(port).map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("tunnel port {port} is out of range"))
        })
    }
}

fn get_env(key: &str, default: Option<&str>) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => default.map(str::to_string).ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!(
                "Missing required environment variable: {}",
                key
            ))
        }),
    }
}
