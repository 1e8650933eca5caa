//! Payload logging.

use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use tower::util::BoxCloneService;
use tower::Service;

use super::body::{hex_preview, BodyEnd, BodyObserver, MessageSplitter, ObservedBody};
use super::{CallInfo, CallRequest, CallResponse, CallSide, Handler, Interceptor};
use crate::error::BoxError;

/// Leading payload bytes rendered in a log line.
const PREVIEW_BYTES: usize = 64;

/// Decides per call whether its messages are logged.
pub type PayloadPredicate = Arc<dyn Fn(&CallInfo) -> bool + Send + Sync>;

/// A predicate that logs every call.
pub fn always_log() -> PayloadPredicate {
    Arc::new(|_| true)
}

/// Logs every request and response message of calls accepted by the
/// predicate: index, length, compression flag and a hex preview.
#[derive(Clone)]
pub struct PayloadLog {
    side: CallSide,
    predicate: PayloadPredicate,
}

impl PayloadLog {
    pub fn new(side: CallSide, predicate: PayloadPredicate) -> Self {
        Self { side, predicate }
    }
}

impl Interceptor for PayloadLog {
    fn name(&self) -> &'static str {
        "payload_log"
    }

    fn wrap(&self, next: Handler) -> Handler {
        BoxCloneService::new(PayloadLogService {
            inner: next,
            side: self.side,
            predicate: self.predicate.clone(),
        })
    }
}

#[derive(Clone)]
struct PayloadLogService {
    inner: Handler,
    side: CallSide,
    predicate: PayloadPredicate,
}

impl Service<CallRequest> for PayloadLogService {
    type Response = CallResponse;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<CallResponse, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: CallRequest) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let info = Arc::new(CallInfo::of(&req, self.side));
        if !(self.predicate)(&info) {
            return Box::pin(inner.call(req));
        }

        let req = req.map(|body| {
            ObservedBody::boxed(body, MessageLogger::new(info.clone(), Direction::Request))
        });

        Box::pin(async move {
            let response = inner.call(req).await?;
            Ok(response.map(|body| {
                ObservedBody::boxed(body, MessageLogger::new(info, Direction::Response))
            }))
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Request,
    Response,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

struct MessageLogger {
    info: Arc<CallInfo>,
    direction: Direction,
    splitter: MessageSplitter,
    index: usize,
}

impl MessageLogger {
    fn new(info: Arc<CallInfo>, direction: Direction) -> Self {
        Self {
            info,
            direction,
            splitter: MessageSplitter::new(PREVIEW_BYTES),
            index: 0,
        }
    }
}

impl BodyObserver for MessageLogger {
    fn on_data(&mut self, data: &Bytes) {
        for message in self.splitter.push(data) {
            tracing::info!(
                side = self.info.side.as_str(),
                grpc.service = %self.info.service,
                grpc.method = %self.info.method,
                direction = self.direction.as_str(),
                index = self.index,
                length = message.length,
                compressed = message.compressed,
                payload = %hex_preview(&message.preview, message.length),
                "grpc message"
            );
            self.index += 1;
        }
    }

    fn on_end(&mut self, _end: BodyEnd) {
        let pending = self.splitter.pending();
        if pending > 0 {
            tracing::debug!(
                grpc.method = %self.info.method,
                direction = self.direction.as_str(),
                pending,
                "stream ended inside a message"
            );
        }
    }
}
