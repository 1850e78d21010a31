pub mod api;
pub mod health;

use std::sync::Arc;

use dispatch_core::client::ServiceRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub service_name: String,
    pub registry: Arc<ServiceRegistry>,
}
