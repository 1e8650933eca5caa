//! Panic recovery.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use tonic::body::BoxBody;
use tonic::Status;
use tower::util::BoxCloneService;
use tower::Service;

use super::{status_response, CallRequest, CallResponse, Handler, Interceptor};
use crate::error::BoxError;

/// Turns panics in later interceptors, handlers and response streams into
/// `INTERNAL` statuses, and inner errors into status responses.
///
/// Must be the outermost interceptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Recovery;

impl Recovery {
    pub fn new() -> Self {
        Self
    }
}

impl Interceptor for Recovery {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn wrap(&self, next: Handler) -> Handler {
        BoxCloneService::new(RecoveryService { inner: next })
    }
}

#[derive(Clone)]
struct RecoveryService {
    inner: Handler,
}

impl Service<CallRequest> for RecoveryService {
    type Response = CallResponse;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<CallResponse, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: CallRequest) -> Self::Future {
        let method = req.uri().path().to_string();

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let future = match std::panic::catch_unwind(AssertUnwindSafe(|| inner.call(req))) {
                Ok(future) => future,
                Err(panic) => return Ok(recovered(&method, panic.as_ref())),
            };

            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(response)) => {
                    Ok(response.map(|body| BoxBody::new(RecoveredBody::new(body, method))))
                }
                Ok(Err(err)) => {
                    let status = Status::from_error(err);
                    Ok(status_response(&status))
                }
                Err(panic) => Ok(recovered(&method, panic.as_ref())),
            }
        })
    }
}

fn recovered(method: &str, panic: &(dyn Any + Send)) -> CallResponse {
    let message = panic_message(panic);
    tracing::error!(grpc.method = %method, panic = %message, "recovered from panic in call");
    status_response(&Status::internal(message))
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Response body that ends with `INTERNAL` trailers if polling it panics.
struct RecoveredBody {
    inner: BoxBody,
    method: String,
    done: bool,
}

impl RecoveredBody {
    fn new(inner: BoxBody, method: String) -> Self {
        Self {
            inner,
            method,
            done: false,
        }
    }
}

impl Body for RecoveredBody {
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        let inner = &mut this.inner;
        match std::panic::catch_unwind(AssertUnwindSafe(|| Pin::new(inner).poll_frame(cx))) {
            Ok(polled) => polled,
            Err(panic) => {
                this.done = true;
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    grpc.method = %this.method,
                    panic = %message,
                    "recovered from panic in response stream"
                );

                let mut trailers = HeaderMap::new();
                if let Err(err) = Status::internal(message).add_header(&mut trailers) {
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(Some(Ok(Frame::trailers(trailers))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::super::{trailers_only_status, InterceptorChain};
    use super::*;
    use futures::StreamExt;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn panicking_handler() -> Handler {
        BoxCloneService::new(tower::service_fn(|req: CallRequest| async move {
            if req.uri().path().ends_with("Panic") {
                panic!("handler exploded");
            }
            Ok::<_, BoxError>(grpc_response(b"fine", tonic::Code::Ok))
        }))
    }

    #[tokio::test]
    async fn panic_becomes_internal_status() {
        let handler = Recovery.wrap(panicking_handler());

        let response = handler
            .clone()
            .oneshot(request("/test.Svc/Panic"))
            .await
            .unwrap();
        let status = trailers_only_status(response.headers()).unwrap();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(status.message(), "handler exploded");

        // The same handler keeps serving.
        let response = handler.oneshot(request("/test.Svc/Fine")).await.unwrap();
        assert!(trailers_only_status(response.headers()).is_none());
        let trailers = response.into_body().collect().await.unwrap();
        assert_eq!(trailers.trailers().unwrap()["grpc-status"], "0");
    }

    #[tokio::test]
    async fn panic_in_later_interceptor_is_caught() {
        struct Exploding;

        impl Interceptor for Exploding {
            fn name(&self) -> &'static str {
                "exploding"
            }

            fn wrap(&self, _next: Handler) -> Handler {
                BoxCloneService::new(tower::service_fn(|req: CallRequest| {
                    if !req.uri().path().is_empty() {
                        panic!("interceptor exploded");
                    }
                    futures::future::ready(Ok::<CallResponse, BoxError>(status_response(
                        &Status::ok(""),
                    )))
                }))
            }
        }

        let interceptors: Vec<Arc<dyn Interceptor>> = vec![Arc::new(Recovery), Arc::new(Exploding)];
        let chain = InterceptorChain::new(interceptors);
        let response = chain
            .apply(echo_handler(b"never"))
            .oneshot(request("/test.Svc/Any"))
            .await
            .unwrap();

        let status = trailers_only_status(response.headers()).unwrap();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(status.message(), "interceptor exploded");
    }

    #[tokio::test]
    async fn inner_error_becomes_status_response() {
        let failing = BoxCloneService::new(tower::service_fn(|_req: CallRequest| async {
            Err::<CallResponse, BoxError>(Box::new(Status::unavailable("backend down")))
        }));

        let response = Recovery
            .wrap(failing)
            .oneshot(request("/test.Svc/Any"))
            .await
            .unwrap();
        let status = trailers_only_status(response.headers()).unwrap();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert_eq!(status.message(), "backend down");
    }

    #[tokio::test]
    async fn panic_while_streaming_ends_with_internal_trailers() {
        let stream = futures::stream::iter(vec![0u8, 1]).map(|i| {
            if i == 1 {
                panic!("stream exploded");
            }
            Ok::<_, Status>(Frame::data(grpc_frame(b"first")))
        });
        let body = BoxBody::new(http_body_util::StreamBody::new(stream));

        let mut recovered = RecoveredBody::new(body, "/test.Svc/Stream".to_string());
        let first = recovered.frame().await.unwrap().unwrap();
        assert!(first.is_data());

        let last = recovered.frame().await.unwrap().unwrap();
        let trailers = last.into_trailers().unwrap();
        assert_eq!(trailers["grpc-status"], "13");
        assert!(recovered.frame().await.is_none());
    }
}
