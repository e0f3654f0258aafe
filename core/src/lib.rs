//! Policy-enforced tool invocation gateway.
//!
//! [`Gateway`] is what the reasoning loop calls. Everything underneath lives
//! in the component crates: guardrails and audit in `toolgate-security`,
//! local execution in `toolgate-runtime`, remote endpoints and backend
//! negotiation in `toolgate-provider`, checkpoints in `toolgate-persist`.

pub mod config;
pub mod error;
pub mod gateway;
pub mod reload;

pub use config::{ConfigError, GatewayConfig, Secrets, mask_secret};
pub use error::GatewayError;
pub use gateway::{BackendTurn, ExecutionOutput, Gateway, GatewayBuilder, HealthReport};
pub use reload::{PidFile, SignalError, send_reload_signal, spawn_reload_listener};
