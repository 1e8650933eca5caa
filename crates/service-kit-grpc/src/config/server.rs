//! gRPC server configuration.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use opentelemetry_sdk::trace::SdkTracerProvider;
use serde::{Deserialize, Serialize};

pub use service_kit::{ConfigBuilder, Environment};

use super::keepalive::ServerKeepAlive;
use crate::error::{BoxError, ServerError};

type HandlerFn = dyn Fn() -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync;

/// Async cleanup callback run by the shutdown sequence.
#[derive(Clone)]
pub struct ShutdownHandler(Arc<HandlerFn>);

impl ShutdownHandler {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self(Arc::new(move || handler().boxed()))
    }

    pub async fn run(&self) -> Result<(), BoxError> {
        (self.0)().await
    }
}

impl std::fmt::Debug for ShutdownHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ShutdownHandler")
    }
}

/// gRPC server configuration.
///
/// The serializable part is loaded with [`ServerConfig::builder`]; hooks and
/// the tracer provider are attached in code.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub environment: Environment,
    /// `host:port` to listen on.
    pub address: String,
    pub keep_alive: ServerKeepAlive,
    /// Advertise registered services through server reflection.
    pub reflection_service: bool,
    /// Maximum concurrent streams per connection.
    pub max_concurrent_streams: Option<u32>,
    pub tcp_nodelay: bool,
    /// Cleanup run after the server has drained, e.g. closing a database pool.
    #[serde(skip)]
    pub graceful_shutdown_handler: Option<ShutdownHandler>,
    #[serde(skip)]
    pub tracer_provider: Option<SdkTracerProvider>,
    /// Overrides the default flush-and-shutdown of `tracer_provider`.
    #[serde(skip)]
    pub tracer_provider_shutdown_handler: Option<ShutdownHandler>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            address: "[::1]:50051".to_string(),
            keep_alive: ServerKeepAlive::default(),
            reflection_service: false,
            max_concurrent_streams: None,
            tcp_nodelay: true,
            graceful_shutdown_handler: None,
            tracer_provider: None,
            tracer_provider_shutdown_handler: None,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("environment", &self.environment)
            .field("address", &self.address)
            .field("keep_alive", &self.keep_alive)
            .field("reflection_service", &self.reflection_service)
            .field("max_concurrent_streams", &self.max_concurrent_streams)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field(
                "graceful_shutdown_handler",
                &self.graceful_shutdown_handler.is_some(),
            )
            .field("tracer_provider", &self.tracer_provider.is_some())
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    /// Create a new configuration builder.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let config: ServerConfig = ServerConfig::builder()
    ///     .with_dotenv()
    ///     .with_config_file("server.toml")
    ///     .build()?;
    /// ```
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: ServerKeepAlive) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_reflection(mut self, enabled: bool) -> Self {
        self.reflection_service = enabled;
        self
    }

    pub fn with_graceful_shutdown_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.graceful_shutdown_handler = Some(ShutdownHandler::new(handler));
        self
    }

    pub fn with_tracer_provider(mut self, provider: SdkTracerProvider) -> Self {
        self.tracer_provider = Some(provider);
        self
    }

    pub fn with_tracer_provider_shutdown_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.tracer_provider_shutdown_handler = Some(ShutdownHandler::new(handler));
        self
    }

    /// The handler that flushes traces on shutdown.
    ///
    /// Falls back to flushing `tracer_provider` when no explicit handler is set.
    pub fn tracer_shutdown_handler(&self) -> Option<ShutdownHandler> {
        if let Some(handler) = &self.tracer_provider_shutdown_handler {
            return Some(handler.clone());
        }

        let provider = self.tracer_provider.clone()?;
        Some(ShutdownHandler::new(move || {
            let provider = provider.clone();
            async move {
                service_kit::shutdown_tracer_provider(provider)
                    .await
                    .map_err(BoxError::from)
            }
        }))
    }

    pub(crate) fn validate(&self) -> Result<(), ServerError> {
        if self.address.trim().is_empty() {
            return Err(ServerError::InvalidAddress(
                "address must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.address, "[::1]:50051");
        assert!(!config.reflection_service);
        assert!(config.tcp_nodelay);
        assert!(config.graceful_shutdown_handler.is_none());
        assert!(config.tracer_shutdown_handler().is_none());
    }

    #[test]
    fn server_config_rejects_empty_address() {
        let config = ServerConfig::default().with_address("  ");
        assert!(matches!(
            config.validate(),
            Err(ServerError::InvalidAddress(_))
        ));
    }

    #[test]
    fn server_config_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(
            &path,
            r#"
            address = "0.0.0.0:50052"
            reflection_service = true

            [keep_alive.enforcement_policy]
            min_time_ms = 2000
            permit_without_stream = true

            [keep_alive.server_parameters]
            max_connection_idle_ms = 60000
            "#,
        )
        .unwrap();

        let config: ServerConfig = ServerConfig::builder()
            .with_config_file(&path)
            .build()
            .unwrap();

        assert_eq!(config.address, "0.0.0.0:50052");
        assert!(config.reflection_service);
        let keep_alive = config.keep_alive;
        assert_eq!(keep_alive.enforcement_policy.min_time, Duration::from_secs(2));
        assert!(keep_alive.enforcement_policy.permit_without_stream);
        assert_eq!(
            keep_alive.server_parameters.max_connection_idle,
            Duration::from_secs(60)
        );
        assert!(keep_alive.server_parameters.max_connection_age.is_zero());
    }

    #[tokio::test]
    async fn explicit_tracer_shutdown_handler_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let config = ServerConfig::default()
            .with_tracer_provider(SdkTracerProvider::builder().build())
            .with_tracer_provider_shutdown_handler(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });

        config.tracer_shutdown_handler().unwrap().run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn default_tracer_shutdown_flushes_provider() {
        let config =
            ServerConfig::default().with_tracer_provider(SdkTracerProvider::builder().build());

        let handler = config.tracer_shutdown_handler().unwrap();
        handler.run().await.unwrap();
    }
}
