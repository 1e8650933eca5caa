//! gRPC client bootstrap.

use std::sync::Arc;
use std::task::{Context, Poll};

use opentelemetry_sdk::trace::SdkTracerProvider;
use tonic::body::BoxBody;
use tonic::transport::{Channel, Endpoint};
use tower::Service;

use crate::config::ClientConfig;
use crate::error::{BoxError, Error};
use crate::interceptor::{
    always_log, tracer_for, CallInfo, CallResponse, Handler, Interceptor, InterceptorChain,
    PayloadPredicate,
};

/// A connection to a gRPC server with the client interceptor chain attached.
///
/// Pass it to any generated client:
///
/// ```ignore
/// let client = Client::connect(config, None).await?;
/// let mut greeter = GreeterClient::new(client);
/// ```
#[derive(Clone)]
pub struct Client {
    handler: Handler,
    chain: InterceptorChain,
}

impl Client {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            tracer_provider: None,
            interceptors: Vec::new(),
            payload_predicate: always_log(),
        }
    }

    /// Dial now. Fails if the server cannot be reached.
    pub async fn connect(
        config: ClientConfig,
        tracer_provider: Option<&SdkTracerProvider>,
    ) -> Result<Self, Error> {
        let mut builder = Self::builder(config);
        builder.tracer_provider = tracer_provider.cloned();
        builder.connect().await
    }

    /// Dial on first use.
    pub fn connect_lazy(
        config: ClientConfig,
        tracer_provider: Option<&SdkTracerProvider>,
    ) -> Result<Self, Error> {
        let mut builder = Self::builder(config);
        builder.tracer_provider = tracer_provider.cloned();
        builder.connect_lazy()
    }

    /// Names of the interceptors, outermost first.
    pub fn interceptors(&self) -> Vec<&'static str> {
        self.chain.names()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("interceptors", &self.chain)
            .finish_non_exhaustive()
    }
}

impl Service<http::Request<BoxBody>> for Client {
    type Response = CallResponse;
    type Error = BoxError;
    type Future = <Handler as Service<http::Request<BoxBody>>>::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.handler.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<BoxBody>) -> Self::Future {
        self.handler.call(request)
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    tracer_provider: Option<SdkTracerProvider>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    payload_predicate: PayloadPredicate,
}

impl ClientBuilder {
    pub fn tracer_provider(mut self, provider: SdkTracerProvider) -> Self {
        self.tracer_provider = Some(provider);
        self
    }

    /// Append an interceptor after the built-in ones.
    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Decide per call whether request and response messages are logged.
    pub fn payload_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CallInfo) -> bool + Send + Sync + 'static,
    {
        self.payload_predicate = Arc::new(predicate);
        self
    }

    pub async fn connect(self) -> Result<Client, Error> {
        let (endpoint, chain) = self.prepare()?;
        let uri = endpoint.uri().clone();

        let channel = endpoint.connect().await.map_err(|err| {
            tracing::error!(%uri, error = %err, "gRPC client failed to connect");
            Error::from(err)
        })?;

        tracing::info!(%uri, "gRPC client connected");
        Ok(Client::new(channel, chain))
    }

    pub fn connect_lazy(self) -> Result<Client, Error> {
        let (endpoint, chain) = self.prepare()?;
        Ok(Client::new(endpoint.connect_lazy(), chain))
    }

    fn prepare(self) -> Result<(Endpoint, InterceptorChain), Error> {
        let endpoint = build_endpoint(&self.config)?;
        let tracer = tracer_for(self.tracer_provider.as_ref());
        let chain = InterceptorChain::client(tracer, self.payload_predicate, self.interceptors);
        Ok((endpoint, chain))
    }
}

impl Client {
    fn new(channel: Channel, chain: InterceptorChain) -> Self {
        Self {
            handler: chain.apply(channel),
            chain,
        }
    }
}

/// Endpoint for `config` with client keepalive defaults and floor applied.
fn build_endpoint(config: &ClientConfig) -> Result<Endpoint, Error> {
    let uri = config.endpoint_uri()?;
    let keep_alive = config.keep_alive.with_defaults().client_parameters;

    let mut endpoint = Endpoint::from_shared(uri)
        .map_err(|e| Error::InvalidEndpoint(e.to_string()))?
        .connect_timeout(config.connect_timeout)
        .tcp_nodelay(config.tcp_nodelay)
        .http2_keep_alive_interval(keep_alive.ping_interval())
        .keep_alive_timeout(keep_alive.timeout)
        .keep_alive_while_idle(keep_alive.permit_without_stream);

    if let Some(timeout) = config.timeout {
        endpoint = endpoint.timeout(timeout);
    }

    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::MetadataInterceptor;
    use std::time::Duration;

    fn config(address: &str) -> ClientConfig {
        ClientConfig {
            address: address.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn endpoint_uses_http_scheme_for_bare_addresses() {
        let endpoint = build_endpoint(&config("127.0.0.1:50051")).unwrap();
        assert_eq!(endpoint.uri().to_string(), "http://127.0.0.1:50051/");
    }

    #[test]
    fn empty_address_is_rejected() {
        let err = build_endpoint(&config(" ")).unwrap_err();
        assert!(matches!(err, Error::InvalidEndpoint(_)));

        let err = Client::connect_lazy(config(""), None).unwrap_err();
        assert!(matches!(err, Error::InvalidEndpoint(_)));
    }

    #[tokio::test]
    async fn lazy_client_has_no_recovery() {
        let client = Client::builder(config("127.0.0.1:1"))
            .interceptor(MetadataInterceptor::new("tenant", Ok))
            .connect_lazy()
            .unwrap();

        assert_eq!(
            client.interceptors(),
            vec!["trace", "access_log", "payload_log", "tenant"]
        );
    }

    #[tokio::test]
    async fn eager_connect_reports_unreachable_server() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = ClientConfig {
            connect_timeout: Duration::from_millis(500),
            ..config(&address)
        };
        let err = Client::connect(config, None).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }
}
