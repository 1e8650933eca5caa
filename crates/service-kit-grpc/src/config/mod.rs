//! Configuration types for gRPC servers and clients.

mod client;
pub mod keepalive;
mod server;

pub use client::{ClientConfig, ClientConfigBuilder};
pub use keepalive::{
    ClientKeepAlive, ClientParameters, EnforcementPolicy, ServerKeepAlive, ServerParameters,
};
pub use server::{ServerConfig, ShutdownHandler};

// Re-export from core
pub use service_kit::{ConfigBuilder, ConfigError, Environment};
