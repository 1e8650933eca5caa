//! Adapter for metadata-only interceptor functions.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tonic::metadata::MetadataMap;
use tonic::{Request, Status};
use tower::util::BoxCloneService;
use tower::Service;

use super::{status_response, CallRequest, CallResponse, Handler, Interceptor};
use crate::error::BoxError;

type MetadataFn = Arc<dyn Fn(Request<()>) -> Result<Request<()>, Status> + Send + Sync>;

/// Runs a `tonic`-style interceptor function against the call's metadata and
/// extensions.
///
/// Changes the function makes are written back to the call. A rejection
/// answers the call with the returned status without reaching the handler.
///
/// ```ignore
/// let require_tenant = MetadataInterceptor::new("tenant", |req| {
///     req.get_header("x-tenant-id")?;
///     Ok(req)
/// });
/// let server = Server::builder(config).interceptor(require_tenant).build()?;
/// ```
#[derive(Clone)]
pub struct MetadataInterceptor {
    name: &'static str,
    f: MetadataFn,
}

impl MetadataInterceptor {
    pub fn new<F>(name: &'static str, f: F) -> Self
    where
        F: Fn(Request<()>) -> Result<Request<()>, Status> + Send + Sync + 'static,
    {
        Self {
            name,
            f: Arc::new(f),
        }
    }
}

impl Interceptor for MetadataInterceptor {
    fn name(&self) -> &'static str {
        self.name
    }

    fn wrap(&self, next: Handler) -> Handler {
        BoxCloneService::new(MetadataService {
            inner: next,
            f: self.f.clone(),
        })
    }
}

#[derive(Clone)]
struct MetadataService {
    inner: Handler,
    f: MetadataFn,
}

impl Service<CallRequest> for MetadataService {
    type Response = CallResponse;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<CallResponse, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: CallRequest) -> Self::Future {
        let (mut parts, body) = req.into_parts();
        let request = Request::from_parts(
            MetadataMap::from_headers(std::mem::take(&mut parts.headers)),
            std::mem::take(&mut parts.extensions),
            (),
        );

        let request = match (self.f)(request) {
            Ok(request) => request,
            Err(status) => {
                tracing::debug!(
                    grpc.path = %parts.uri.path(),
                    code = ?status.code(),
                    "call rejected by interceptor"
                );
                return Box::pin(futures::future::ready(Ok(status_response(&status))));
            }
        };

        let (metadata, extensions, ()) = request.into_parts();
        parts.headers = metadata.into_headers();
        parts.extensions = extensions;

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(inner.call(http::Request::from_parts(parts, body)))
    }
}
