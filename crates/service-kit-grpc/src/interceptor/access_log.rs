//! Access logging.

use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use http::HeaderMap;
use tonic::Code;
use tower::util::BoxCloneService;
use tower::Service;
use tracing::Level;

use super::body::{BodyEnd, BodyObserver, ObservedBody};
use super::{
    error_status, trailers_only_status, CallInfo, CallRequest, CallResponse, CallSide, CallTrace,
    Handler, Interceptor,
};
use crate::error::BoxError;

/// Logs one line per finished call: method, status code, elapsed time, error
/// and trace id.
///
/// A call finishes when its trailers are seen, when it is answered with a
/// trailers-only response, when the inner handler fails, or when the
/// response stream is dropped early (logged as `CANCELLED`).
#[derive(Debug, Clone, Copy)]
pub struct AccessLog {
    side: CallSide,
}

impl AccessLog {
    pub fn new(side: CallSide) -> Self {
        Self { side }
    }
}

impl Interceptor for AccessLog {
    fn name(&self) -> &'static str {
        "access_log"
    }

    fn wrap(&self, next: Handler) -> Handler {
        BoxCloneService::new(AccessLogService {
            inner: next,
            side: self.side,
        })
    }
}

/// Log level for a finished call.
///
/// Server calls that fail because of the caller stay at `INFO`; client calls
/// are quieter and only surface transport-level failures as warnings.
pub fn level_for(side: CallSide, code: Code) -> Level {
    match side {
        CallSide::Server => match code {
            Code::Ok
            | Code::Cancelled
            | Code::InvalidArgument
            | Code::NotFound
            | Code::AlreadyExists
            | Code::Unauthenticated => Level::INFO,
            Code::DeadlineExceeded
            | Code::PermissionDenied
            | Code::ResourceExhausted
            | Code::FailedPrecondition
            | Code::Aborted
            | Code::OutOfRange
            | Code::Unavailable => Level::WARN,
            Code::Unknown | Code::Unimplemented | Code::Internal | Code::DataLoss => Level::ERROR,
        },
        CallSide::Client => match code {
            Code::Unknown
            | Code::DeadlineExceeded
            | Code::PermissionDenied
            | Code::Unauthenticated => Level::INFO,
            Code::Unimplemented | Code::Internal | Code::Unavailable | Code::DataLoss => {
                Level::WARN
            }
            _ => Level::DEBUG,
        },
    }
}

#[derive(Clone)]
struct AccessLogService {
    inner: Handler,
    side: CallSide,
}

impl Service<CallRequest> for AccessLogService {
    type Response = CallResponse;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<CallResponse, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: CallRequest) -> Self::Future {
        let started = Instant::now();
        let entry = Entry {
            info: CallInfo::of(&req, self.side),
            trace_id: req
                .extensions()
                .get::<CallTrace>()
                .filter(|t| t.is_valid())
                .map(|t| t.trace_id.to_string()),
            started,
        };

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match inner.call(req).await {
                Ok(response) => match trailers_only_status(response.headers()) {
                    Some(status) => {
                        entry.finish(status.code(), status.message());
                        Ok(response)
                    }
                    None => Ok(response.map(|body| {
                        ObservedBody::boxed(body, AccessObserver { entry, status: None })
                    })),
                },
                Err(err) => {
                    let (code, message) = error_status(&err);
                    entry.finish(code, &message);
                    Err(err)
                }
            }
        })
    }
}

struct Entry {
    info: CallInfo,
    trace_id: Option<String>,
    started: Instant,
}

impl Entry {
    fn finish(&self, code: Code, message: &str) {
        log_call(
            &self.info,
            code,
            message,
            self.started.elapsed(),
            self.trace_id.as_deref().unwrap_or("-"),
        );
    }
}

struct AccessObserver {
    entry: Entry,
    status: Option<(Code, String)>,
}

impl BodyObserver for AccessObserver {
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
        self.entry.finish(code, &message);
    }
}

fn log_call(info: &CallInfo, code: Code, message: &str, elapsed: Duration, trace_id: &str) {
    let level = level_for(info.side, code);
    let time_ms = elapsed.as_secs_f64() * 1000.0;
    let error = if code == Code::Ok { "" } else { message };

    macro_rules! emit {
        ($event:ident) => {
            tracing::$event!(
                side = info.side.as_str(),
                grpc.service = %info.service,
                grpc.method = %info.method,
                grpc.code = ?code,
                grpc.time_ms = time_ms,
                trace_id = %trace_id,
                error = %error,
                "finished call"
            )
        };
    }

    if level == Level::ERROR {
        emit!(error);
    } else if level == Level::WARN {
        emit!(warn);
    } else if level == Level::INFO {
        emit!(info);
    } else {
        emit!(debug);
    }
}
