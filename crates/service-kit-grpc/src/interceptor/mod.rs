//! Interceptors for gRPC calls.
//!
//! An [`Interceptor`] wraps the next [`Handler`] and returns a new one. An
//! [`InterceptorChain`] folds its interceptors at construction time so the
//! first one is outermost. Every interceptor works at the HTTP/2 stream level,
//! so unary and streaming calls go through the same composed handler;
//! per-message events are observed by wrapping request and response bodies.

mod access_log;
pub(crate) mod body;
mod metadata;
mod payload;
mod recovery;
mod trace;

use std::sync::Arc;

use opentelemetry_sdk::trace::SdkTracer;
use tower::util::BoxCloneService;
use tower::{Layer, Service, ServiceExt};

use crate::error::BoxError;

pub use access_log::{level_for, AccessLog};
pub use metadata::MetadataInterceptor;
pub use payload::{always_log, PayloadLog, PayloadPredicate};
pub use recovery::Recovery;
pub use trace::{CallTrace, Trace};
pub(crate) use trace::tracer_for;

/// A call as it enters the chain.
pub type CallRequest = http::Request<tonic::body::BoxBody>;
/// A call's response as it leaves the chain.
pub type CallResponse = http::Response<tonic::body::BoxBody>;
/// A composed call handler.
pub type Handler = BoxCloneService<CallRequest, CallResponse, BoxError>;

/// A middleware unit in an [`InterceptorChain`].
pub trait Interceptor: Send + Sync + 'static {
    /// Short name, used in logs.
    fn name(&self) -> &'static str;

    /// Wrap `next`. The returned handler must call through to `next`, or
    /// answer the call itself with an error status.
    fn wrap(&self, next: Handler) -> Handler;
}

/// Which end of the call an interceptor runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallSide {
    Server,
    Client,
}

impl CallSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
        }
    }
}

/// Service and method of a call, parsed from its `/package.Service/Method` path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub service: String,
    pub method: String,
    pub side: CallSide,
}

impl CallInfo {
    pub fn from_path(path: &str, side: CallSide) -> Self {
        let trimmed = path.trim_start_matches('/');
        let (service, method) = trimmed.split_once('/').unwrap_or((trimmed, ""));

        Self {
            service: service.to_string(),
            method: method.to_string(),
            side,
        }
    }

    pub fn of<B>(request: &http::Request<B>, side: CallSide) -> Self {
        Self::from_path(request.uri().path(), side)
    }

    /// `/package.Service/Method`
    pub fn full_method(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

/// An ordered, immutable list of interceptors.
#[derive(Clone)]
pub struct InterceptorChain {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    /// Recovery, tracing, access logging and payload logging, then `extra`.
    pub fn server(
        tracer: SdkTracer,
        predicate: PayloadPredicate,
        extra: impl IntoIterator<Item = Arc<dyn Interceptor>>,
    ) -> Self {
        let mut interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Recovery::new()),
            Arc::new(Trace::new(tracer, CallSide::Server)),
            Arc::new(AccessLog::new(CallSide::Server)),
            Arc::new(PayloadLog::new(CallSide::Server, predicate)),
        ];
        interceptors.extend(extra);
        Self::new(interceptors)
    }

    /// Same as [`server`](Self::server) without recovery: client faults are
    /// returned to the caller as call errors.
    pub fn client(
        tracer: SdkTracer,
        predicate: PayloadPredicate,
        extra: impl IntoIterator<Item = Arc<dyn Interceptor>>,
    ) -> Self {
        let mut interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Trace::new(tracer, CallSide::Client)),
            Arc::new(AccessLog::new(CallSide::Client)),
            Arc::new(PayloadLog::new(CallSide::Client, predicate)),
        ];
        interceptors.extend(extra);
        Self::new(interceptors)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Compose the chain around `inner`.
    pub fn apply<S>(&self, inner: S) -> Handler
    where
        S: Service<CallRequest, Response = CallResponse> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<BoxError>,
    {
        let mut handler: Handler = BoxCloneService::new(inner.map_err(Into::into));
        for interceptor in self.interceptors.iter().rev() {
            handler = interceptor.wrap(handler);
        }
        handler
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl<S> Layer<S> for InterceptorChain
where
    S: Service<CallRequest, Response = CallResponse> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
{
    type Service = Handler;

    fn layer(&self, inner: S) -> Self::Service {
        self.apply(inner)
    }
}

/// Build a trailers-only response carrying `status`.
pub(crate) fn status_response(status: &tonic::Status) -> CallResponse {
    let mut response = http::Response::new(tonic::body::empty_body());
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/grpc"),
    );
    if let Err(err) = status.add_header(response.headers_mut()) {
        tracing::warn!(error = %err, "failed to encode status headers");
    }
    response
}

/// Status of a trailers-only response, if `headers` carry one.
pub(crate) fn trailers_only_status(headers: &http::HeaderMap) -> Option<tonic::Status> {
    if headers.contains_key("grpc-status") {
        tonic::Status::from_header_map(headers)
    } else {
        None
    }
}

/// Code and message of an error returned by an inner handler.
pub(crate) fn error_status(err: &BoxError) -> (tonic::Code, String) {
    match err.downcast_ref::<tonic::Status>() {
        Some(status) => (status.code(), status.message().to_string()),
        None => (tonic::Code::Unavailable, err.to_string()),
    }
}
