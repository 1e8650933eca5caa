//! gRPC server bootstrap.
//!
//! [`Server`] owns the listener, the accept loop and one task per
//! connection. Everything it serves goes through the server interceptor
//! chain; the health service is always registered and reports the whole
//! process as serving.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::body::BoxBody;
use tonic::server::NamedService;
use tonic::service::RoutesBuilder;

use crate::config::ServerConfig;
use crate::error::{BoxError, ServerError};
use crate::health::{HealthRegistry, HealthStatus, PROCESS};
use crate::interceptor::{
    always_log, tracer_for, CallInfo, Handler, Interceptor, InterceptorChain, PayloadPredicate,
};
use crate::transport::{serve_connection, ConnectionSettings};

/// Callback run right before the server starts accepting connections.
pub type PreStart = Arc<dyn Fn() -> Result<(), BoxError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Serving,
    Stopped,
}

struct Lifecycle {
    state: Mutex<State>,
    /// Stop accepting and drain every connection.
    stopping: CancellationToken,
    /// Close every connection now.
    force: CancellationToken,
    connections: TaskTracker,
    /// Set once the accept loop has exited and all connections are closed.
    finished: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: Mutex::new(State::Idle),
            stopping: CancellationToken::new(),
            force: CancellationToken::new(),
            connections: TaskTracker::new(),
            finished: watch::Sender::new(false),
            local_addr: Mutex::new(None),
        }
    }

    fn begin(&self) -> Result<(), ServerError> {
        let mut state = self.state.lock();
        match *state {
            State::Idle => {
                *state = State::Serving;
                Ok(())
            }
            State::Serving => Err(ServerError::AlreadyServing),
            State::Stopped => Err(ServerError::Stopped),
        }
    }

    fn finish(&self) {
        *self.state.lock() = State::Stopped;
        self.finished.send_replace(true);
    }

    /// Cancel `token` and wait for the accept loop to finish, if one runs.
    async fn stop_with(&self, token: &CancellationToken) {
        let was = {
            let mut state = self.state.lock();
            let was = *state;
            *state = State::Stopped;
            was
        };
        token.cancel();

        if was == State::Idle {
            self.finished.send_replace(true);
            return;
        }

        let mut finished = self.finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
    }
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    pre_start: Option<PreStart>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    payload_predicate: PayloadPredicate,
}

impl ServerBuilder {
    /// Run `callback` after the listener is bound and before the first
    /// connection is accepted. An error aborts [`Server::serve`].
    pub fn pre_start<F>(mut self, callback: F) -> Self
    where
        F: Fn() -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.pre_start = Some(Arc::new(callback));
        self
    }

    /// Append an interceptor after the built-in ones.
    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Decide per call whether request and response messages are logged.
    /// Every call is logged by default.
    pub fn payload_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CallInfo) -> bool + Send + Sync + 'static,
    {
        self.payload_predicate = Arc::new(predicate);
        self
    }

    /// Apply keepalive defaults, build the interceptor chain and register the
    /// health service. No network resource is acquired.
    pub fn build(self) -> Result<Server, ServerError> {
        let mut config = self.config;
        config.validate()?;
        config.keep_alive.apply_defaults();

        let tracer = tracer_for(config.tracer_provider.as_ref());
        let chain = InterceptorChain::server(tracer, self.payload_predicate, self.interceptors);

        let health = HealthRegistry::new();
        health.set_serving_status(PROCESS, HealthStatus::Serving);

        let mut routes = RoutesBuilder::default();
        routes.add_service(health.service());

        tracing::debug!(
            address = %config.address,
            interceptors = ?chain,
            keep_alive = ?config.keep_alive,
            reflection = config.reflection_service,
            "gRPC server configured"
        );

        Ok(Server {
            config,
            chain,
            health,
            routes,
            descriptor_sets: Vec::new(),
            pre_start: self.pre_start,
            lifecycle: Lifecycle::new(),
        })
    }
}

/// A gRPC server.
///
/// Share it behind an `Arc` to stop it from another task while
/// [`serve`](Self::serve) runs.
///
/// ```ignore
/// let mut server = Server::new(config)?;
/// server.add_service(GreeterServer::new(MyGreeter));
/// service_kit_grpc::run_until(&server, shutdown_signal()).await?;
/// ```
pub struct Server {
    config: ServerConfig,
    chain: InterceptorChain,
    health: HealthRegistry,
    routes: RoutesBuilder,
    #[cfg_attr(not(feature = "reflection"), allow(dead_code))]
    descriptor_sets: Vec<&'static [u8]>,
    pre_start: Option<PreStart>,
    lifecycle: Lifecycle,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder {
            config,
            pre_start: None,
            interceptors: Vec::new(),
            payload_predicate: always_log(),
        }
    }

    /// Build with no pre-start callback and no extra interceptors.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        Self::builder(config).build()
    }

    /// Register an application service, typically a generated
    /// `*Server::new(...)`.
    pub fn add_service<S>(&mut self, service: S) -> &mut Self
    where
        S: tower::Service<
                http::Request<BoxBody>,
                Response = http::Response<BoxBody>,
                Error = Infallible,
            > + NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        tracing::debug!(service = S::NAME, "registered gRPC service");
        self.routes.add_service(service);
        self
    }

    /// Register an encoded `FileDescriptorSet` advertised by reflection.
    pub fn register_file_descriptor_set(&mut self, encoded: &'static [u8]) -> &mut Self {
        self.descriptor_sets.push(encoded);
        self
    }

    /// Health registry of this server.
    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Configured address.
    pub fn addr(&self) -> &str {
        &self.config.address
    }

    /// Address the listener is bound to, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.lifecycle.local_addr.lock()
    }

    /// Names of the interceptors, outermost first.
    pub fn interceptors(&self) -> Vec<&'static str> {
        self.chain.names()
    }

    /// Bind the configured address and serve until stopped.
    ///
    /// Returns `Ok(())` only after [`graceful_stop`](Self::graceful_stop) or
    /// [`stop`](Self::stop). A bind failure is returned immediately.
    pub async fn serve(&self) -> Result<(), ServerError> {
        self.lifecycle.begin()?;

        let listener = match TcpListener::bind(self.config.address.as_str()).await {
            Ok(listener) => listener,
            Err(err) => {
                self.lifecycle.finish();
                return Err(bind_error(&self.config.address, err));
            }
        };

        self.run(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_with_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.lifecycle.begin()?;
        self.run(listener).await
    }

    /// Stop accepting, let in-flight calls finish, then return.
    ///
    /// Shutdown hooks are not run; see [`graceful_shutdown`](crate::graceful_shutdown).
    pub async fn graceful_stop(&self) {
        tracing::info!("gRPC server stopping gracefully");
        self.lifecycle.stop_with(&self.lifecycle.stopping).await;
    }

    /// Close every connection immediately.
    pub async fn stop(&self) {
        tracing::info!("gRPC server stopping");
        self.lifecycle.stopping.cancel();
        self.lifecycle.stop_with(&self.lifecycle.force).await;
    }

    async fn run(&self, listener: TcpListener) -> Result<(), ServerError> {
        let result = self.accept_loop(listener).await;
        self.lifecycle.finish();
        result
    }

    fn handler(&self) -> Result<Handler, ServerError> {
        #[allow(unused_mut)]
        let mut routes = self.routes.clone();

        if self.config.reflection_service {
            #[cfg(feature = "reflection")]
            crate::reflection::add_reflection_services(&mut routes, &self.descriptor_sets)
                .map_err(|e| ServerError::Reflection(e.to_string()))?;

            #[cfg(not(feature = "reflection"))]
            tracing::warn!("reflection requested but the `reflection` feature is disabled");
        }

        Ok(self.chain.apply(routes.routes().prepare()))
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), ServerError> {
        let lifecycle = &self.lifecycle;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;
        *lifecycle.local_addr.lock() = Some(local_addr);

        if let Some(pre_start) = &self.pre_start {
            (pre_start.as_ref())().map_err(ServerError::PreStart)?;
        }

        let handler = self.handler()?;
        let settings = Arc::new(ConnectionSettings {
            keep_alive: self.config.keep_alive,
            max_concurrent_streams: self.config.max_concurrent_streams,
            tcp_nodelay: self.config.tcp_nodelay,
        });

        tracing::info!(address = %local_addr, "gRPC server listening");

        let result = loop {
            tokio::select! {
                _ = lifecycle.stopping.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        lifecycle.connections.spawn(serve_connection(
                            stream,
                            remote,
                            handler.clone(),
                            settings.clone(),
                            lifecycle.stopping.clone(),
                            lifecycle.force.clone(),
                        ));
                    }
                    Err(err) if is_connection_error(&err) => {
                        tracing::debug!(error = %err, "accepted connection failed");
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "gRPC server accept failed");
                        break Err(ServerError::Accept(err));
                    }
                },
            }
        };

        drop(listener);
        lifecycle.stopping.cancel();
        lifecycle.connections.close();
        lifecycle.connections.wait().await;

        tracing::info!(address = %local_addr, "gRPC server stopped");
        result
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("interceptors", &self.chain)
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

fn bind_error(address: &str, err: std::io::Error) -> ServerError {
    tracing::error!(address, error = %err, "gRPC server failed to bind");
    if err.kind() == std::io::ErrorKind::InvalidInput {
        ServerError::InvalidAddress(format!("{address}: {err}"))
    } else {
        ServerError::Bind(err)
    }
}

/// Errors that concern a single incoming connection, not the listener.
fn is_connection_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
    )
}
