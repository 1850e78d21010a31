//! Outbound side: one `ServiceClient` per target, handed out by the
//! `ServiceRegistry`.

pub mod descriptor;
pub mod error;
pub mod headers;
pub mod health;
pub mod http;
pub mod identity;
pub mod registry;
pub mod request;
pub mod retry;
pub mod service_client;
pub mod transport;
pub mod tunnel;

pub use descriptor::{
    CachedResolver, ConfigResolver, ResolveError, ResolvedEndpoint, ServiceDescriptor,
    ServiceResolver,
};
pub use error::{DispatchError, RegistryError, Unavailability, UpstreamBody};
pub use health::{GrpcHealthProbe, HealthProbe, HealthStatusCache};
pub use http::HttpTransport;
pub use identity::{ServiceClaims, ServiceIdentity};
pub use registry::{ProbeFactory, ServiceRegistry};
pub use request::{DispatchRequest, DispatchResponse, FileBlob};
pub use retry::RetryPolicy;
pub use service_client::{ServiceClient, ServiceClientBuilder};
pub use transport::{Transport, TransportKind};
pub use tunnel::TunneledTransport;
