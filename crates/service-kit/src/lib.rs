//! # service-kit
//!
//! Shared utilities for service-kit crates: configuration loading, the
//! application environment, logging setup, the OpenTelemetry tracer provider
//! and a cancellable task fan-out.
//!
//! ## Features
//!
//! - `tracing` - Enable logging initialization with tracing-subscriber
//! - `otlp` - Export spans over OTLP/gRPC

mod config;
mod environment;
mod fanout;
mod logging;
pub mod telemetry;

pub use config::{load_environment_dotenv, ConfigBuilder, ConfigError, ConfigFormat};
pub use environment::Environment;
pub use fanout::{try_fan_out, FanOutError};
pub use logging::LogFormat;
pub use telemetry::{init_tracer_provider, shutdown_tracer_provider, TelemetryError};

#[cfg(feature = "tracing")]
pub use logging::{init_logging, init_logging_from_env};
