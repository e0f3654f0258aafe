//! Everything the gateway talks to over the wire: remote tool endpoints
//! behind per-endpoint breakers and rate windows, and the reasoning backend
//! whose tool-calling support is negotiated at startup.

pub mod backend;
pub mod breaker;
pub mod capability;
pub mod chat;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod rate_limit;
pub mod retry;
pub mod transport;

pub use backend::{BackendConfig, WireProtocol};
pub use breaker::{Breaker, BreakerConfig, EndpointState};
pub use capability::{
    BackendProbe, CapabilityMap, CapabilityMode, CapabilityNegotiator, CapabilitySource,
    HttpBackendProbe, NegotiatorSettings, ProbeVerdict,
};
pub use chat::{ChatCompletion, ChatFunction, ChatMessage, ChatToolCall, ChatUsage};
pub use endpoint::{EndpointConfig, EndpointHealth, TransportKind};
pub use error::{ProviderError, RemoteError, Result, TransportError};
pub use manager::{
    ManagerSettings, RemoteEndpointManager, RemoteOutput, SecretResolver, TransportFactory,
};
pub use rate_limit::RateWindow;
pub use retry::{ErrorClass, RetryPolicy};
pub use transport::{EndpointTransport, build_transport};
