//! Allow-listed, memoized `ServiceClient`s owned by the composition root.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;

use super::descriptor::{CachedResolver, ConfigResolver, ServiceResolver};
use super::error::RegistryError;
use super::health::HealthProbe;
use super::identity::ServiceIdentity;
use super::service_client::ServiceClient;
use crate::config::DispatchSettings;

/// Builds the health probe for a named target. Replaces the standard gRPC
/// health check, mostly in tests.
pub type ProbeFactory = Arc<dyn Fn(&str) -> Arc<dyn HealthProbe> + Send + Sync>;

/// One `ServiceClient` per allowed target, built on first `get`.
pub struct ServiceRegistry {
    settings: Arc<DispatchSettings>,
    identity: Arc<ServiceIdentity>,
    resolver: Arc<dyn ServiceResolver>,
    probe_factory: Option<ProbeFactory>,
    allowed: BTreeSet<String>,
    clients: DashMap<String, Arc<ServiceClient>>,
}

impl ServiceRegistry {
    pub fn new(settings: Arc<DispatchSettings>) -> Self {
        let resolver = Arc::new(CachedResolver::new(
            Arc::new(ConfigResolver),
            settings.resolve_ttl(),
        ));
        Self::with_resolver(settings, resolver)
    }

    /// Registry whose clients all share `resolver`.
    pub fn with_resolver(
        settings: Arc<DispatchSettings>,
        resolver: Arc<dyn ServiceResolver>,
    ) -> Self {
        let identity = Arc::new(ServiceIdentity::new(
            settings.service_name.clone(),
            &settings.token_secret,
        ));
        let allowed = settings.allowed_services();
        tracing::info!(services = ?allowed, "Service registry configured");

        Self {
            settings,
            identity,
            resolver,
            probe_factory: None,
            allowed,
            clients: DashMap::new(),
        }
    }

    pub fn with_probe_factory(mut self, factory: ProbeFactory) -> Self {
        self.probe_factory = Some(factory);
        self
    }

    pub fn identity(&self) -> &Arc<ServiceIdentity> {
        &self.identity
    }

    pub fn settings(&self) -> &Arc<DispatchSettings> {
        &self.settings
    }

    pub fn allowed(&self) -> &BTreeSet<String> {
        &self.allowed
    }

    /// Number of clients built so far.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// The client for `name`, built on the first call and shared afterwards.
    pub fn get(&self, name: &str) -> Result<Arc<ServiceClient>, RegistryError> {
        if !self.allowed.contains(name) {
            return Err(RegistryError::UnknownService(name.to_string()));
        }

        if let Some(client) = self.clients.get(name) {
            return Ok(client.clone());
        }

        // The entry lock makes construction happen once per name.
        let client = self
            .clients
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(service = %name, "Creating service client");
                Arc::new(self.build_client(name))
            })
            .clone();
        Ok(client)
    }

    fn build_client(&self, name: &str) -> ServiceClient {
        let mut builder = ServiceClient::builder(name, self.settings.clone(), self.identity.clone())
            .resolver(self.resolver.clone());
        if let Some(factory) = &self.probe_factory {
            builder = builder.health_probe(factory(name));
        }
        builder.build()
    }

    /// Clients come from configuration only.
    pub fn insert(&self, name: &str, _client: ServiceClient) -> Result<(), RegistryError> {
        Err(RegistryError::ImmutableRegistry(name.to_string()))
    }

    /// Close every live client and forget it; the next `get` builds anew.
    pub async fn reset(&self) {
        let names: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, client)) = self.clients.remove(&name) {
                client.close().await;
            }
        }
    }

    /// Close every client before the process exits. Safe to call twice.
    pub async fn shutdown(&self) {
        let count = self.clients.len();
        self.reset().await;
        if count > 0 {
            tracing::info!(clients = count, "Service registry shut down");
        }
    }
}
