//! Distributed tracing for gRPC calls.

use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue};
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{
    FutureExt as _, SpanId, SpanKind, Status as SpanStatus, TraceContextExt, TraceId,
    Tracer as _, TracerProvider as _,
};
use opentelemetry::KeyValue;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};
use tonic::Code;
use tower::util::BoxCloneService;
use tower::Service;
use tracing::Instrument;

use super::body::{BodyEnd, BodyObserver, ObservedBody};
use super::{
    error_status, trailers_only_status, CallInfo, CallRequest, CallResponse, CallSide, Handler,
    Interceptor,
};
use crate::error::BoxError;

const TRACER_NAME: &str = "service-kit-grpc";

/// Trace and span ids of a call, stored in the request extensions.
///
/// Handlers read it with `request.extensions().get::<CallTrace>()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTrace {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

impl CallTrace {
    pub fn is_valid(&self) -> bool {
        self.trace_id != TraceId::INVALID
    }
}

/// Tracer from `provider`, or from a private provider that exports nothing.
pub(crate) fn tracer_for(provider: Option<&SdkTracerProvider>) -> SdkTracer {
    match provider {
        Some(provider) => provider.tracer(TRACER_NAME),
        None => default_tracer(),
    }
}

pub(crate) fn default_tracer() -> SdkTracer {
    SdkTracerProvider::builder().build().tracer(TRACER_NAME)
}

/// Opens a span for every call and propagates W3C trace context.
///
/// On the server the parent comes from the incoming `traceparent` header; on
/// the client it comes from an [`opentelemetry::Context`] in the request
/// extensions, or the current context, and is injected into the outgoing
/// headers. The span ends when the response stream ends.
#[derive(Clone)]
pub struct Trace {
    tracer: SdkTracer,
    side: CallSide,
}

impl Trace {
    pub fn new(tracer: SdkTracer, side: CallSide) -> Self {
        Self { tracer, side }
    }
}

impl Interceptor for Trace {
    fn name(&self) -> &'static str {
        "trace"
    }

    fn wrap(&self, next: Handler) -> Handler {
        BoxCloneService::new(TraceService {
            inner: next,
            tracer: self.tracer.clone(),
            side: self.side,
        })
    }
}

#[derive(Clone)]
struct TraceService {
    inner: Handler,
    tracer: SdkTracer,
    side: CallSide,
}

impl Service<CallRequest> for TraceService {
    type Response = CallResponse;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<CallResponse, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: CallRequest) -> Self::Future {
        let info = CallInfo::of(&req, self.side);
        let propagator = TraceContextPropagator::new();

        let (parent, kind) = match self.side {
            CallSide::Server => (
                propagator.extract(&HeaderExtractor(req.headers())),
                SpanKind::Server,
            ),
            CallSide::Client => (
                req.extensions()
                    .get::<opentelemetry::Context>()
                    .cloned()
                    .unwrap_or_else(opentelemetry::Context::current),
                SpanKind::Client,
            ),
        };

        let span = self
            .tracer
            .span_builder(format!("{}/{}", info.service, info.method))
            .with_kind(kind)
            .with_attributes(vec![
                KeyValue::new("rpc.system", "grpc"),
                KeyValue::new("rpc.service", info.service.clone()),
                KeyValue::new("rpc.method", info.method.clone()),
            ])
            .start_with_context(&self.tracer, &parent);
        let otel_cx = parent.with_span(span);

        let span_context = otel_cx.span().span_context().clone();
        let trace = CallTrace {
            trace_id: span_context.trace_id(),
            span_id: span_context.span_id(),
        };

        if self.side == CallSide::Client {
            propagator.inject_context(&otel_cx, &mut HeaderInjector(req.headers_mut()));
        }
        req.extensions_mut().insert(trace);
        req.extensions_mut().insert(otel_cx.clone());

        let log_span = tracing::info_span!(
            "grpc",
            side = info.side.as_str(),
            rpc.service = %info.service,
            rpc.method = %info.method,
            trace_id = %trace.trace_id,
        );

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let span_cx = otel_cx.clone();
        let future = async move {
            match inner.call(req).await {
                Ok(response) => match trailers_only_status(response.headers()) {
                    Some(status) => {
                        end_span(&span_cx, status.code(), status.message());
                        Ok(response)
                    }
                    None => Ok(response.map(|body| {
                        ObservedBody::boxed(
                            body,
                            SpanCloser {
                                cx: span_cx,
                                status: None,
                            },
                        )
                    })),
                },
                Err(err) => {
                    let (code, message) = error_status(&err);
                    end_span(&span_cx, code, &message);
                    Err(err)
                }
            }
        };

        Box::pin(future.with_context(otel_cx).instrument(log_span))
    }
}

/// Ends the call span once the response stream reports its status.
struct SpanCloser {
    cx: opentelemetry::Context,
    status: Option<(Code, String)>,
}

impl BodyObserver for SpanCloser {
    fn on_trailers(&mut self, trailers: &HeaderMap) {
        self.status =
            tonic::Status::from_header_map(trailers).map(|s| (s.code(), s.message().to_string()));
    }

    fn on_error(&mut self, error: &tonic::Status) {
        self.status = Some((error.code(), error.message().to_string()));
    }

    fn on_end(&mut self, end: BodyEnd) {
        let (code, message) = self.status.take().unwrap_or_else(|| match end {
            BodyEnd::Dropped => (Code::Cancelled, "stream dropped before completion".into()),
            _ => (Code::Unknown, "stream ended without status".into()),
        });
        end_span(&self.cx, code, &message);
    }
}

fn end_span(cx: &opentelemetry::Context, code: Code, message: &str) {
    let span = cx.span();
    span.set_attribute(KeyValue::new("rpc.grpc.status_code", code as i64));
    if code == Code::Ok {
        span.set_status(SpanStatus::Ok);
    } else {
        span.set_status(SpanStatus::error(message.to_string()));
    }
    span.end();
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

struct HeaderInjector<'a>(&'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                self.0.insert(name, value);
            }
            _ => tracing::debug!(key, "skipping trace header that is not valid metadata"),
        }
    }
}
