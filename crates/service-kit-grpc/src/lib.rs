//! # service-kit-grpc
//!
//! Bootstrap and lifecycle for tonic gRPC servers and clients.
//!
//! A [`Server`] is built from a [`ServerConfig`]: keepalive defaults are
//! applied, a fixed interceptor chain (panic recovery, tracing, access
//! logging, payload logging, then your own interceptors) wraps every call,
//! and the standard health service is registered with the whole process
//! reported as serving. A [`Client`] dials with the same chain minus
//! recovery and client-side keepalive.
//!
//! ## Quick Start - Server
//!
//! ```ignore
//! use service_kit_grpc::{run_until, shutdown_signal, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     service_kit_grpc::init_logging_from_env();
//!
//!     let config: ServerConfig = ServerConfig::builder()
//!         .with_dotenv()
//!         .build()?;
//!
//!     let mut server = Server::new(config)?;
//!     server.add_service(GreeterServer::new(MyGreeter));
//!
//!     run_until(&server, shutdown_signal()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Quick Start - Client
//!
//! ```ignore
//! use service_kit_grpc::{Client, ClientConfig};
//!
//! let config = ClientConfig::builder().address("localhost:50051").build()?;
//! let client = Client::connect(config, None).await?;
//! let mut greeter = GreeterClient::new(client);
//! ```
//!
//! ## Features
//!
//! - `tracing` - Enable logging initialization (default)
//! - `reflection` - Enable gRPC server reflection (default)
//! - `otlp` - Export spans over OTLP/gRPC
//! - `full` - Enable all features

mod client;
pub mod config;
mod error;
pub mod health;
pub mod interceptor;
mod request_ext;
mod server;
mod shutdown;
mod transport;

#[cfg(feature = "reflection")]
mod reflection;

pub use client::{Client, ClientBuilder};
pub use config::{
    ClientConfig, ClientConfigBuilder, ClientKeepAlive, ConfigBuilder, ConfigError, Environment,
    ServerConfig, ServerKeepAlive, ShutdownHandler,
};
pub use error::{BoxError, Error, GrpcError, ServerError, ShutdownError, ShutdownStep};
pub use health::{HealthRegistry, HealthStatus};
pub use interceptor::{CallInfo, CallSide, Interceptor, InterceptorChain, MetadataInterceptor};
pub use request_ext::{
    get_header, get_headers, headers, HeaderError, HeaderErrorKind, HeaderKey, RequestExt,
};
pub use server::{PreStart, Server, ServerBuilder};
pub use shutdown::{graceful_shutdown, run_until, shutdown_signal};

pub use service_kit::{try_fan_out, FanOutError, LogFormat};
pub use tonic::{Code, Request, Response, Status};

#[cfg(feature = "tracing")]
pub use service_kit::{init_logging, init_logging_from_env};
