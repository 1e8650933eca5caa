#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http_body::Frame;
use http_body_util::StreamBody;
use prost::Message;
use service_kit_grpc::{Client, ClientConfig, Server, ServerConfig, ServerError};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tonic::body::BoxBody;
use tonic::codec::ProstCodec;
use tonic::server::NamedService;
use tonic::Status;
use tonic_health::pb::{HealthCheckRequest, HealthCheckResponse};

pub const SLOW_WAIT: &str = "/test.Slow/Wait";

/// Answers every call after `delay` with a `HealthCheckResponse` carrying
/// status 1.
#[derive(Clone)]
pub struct Slow {
    pub delay: Duration,
    pub started: Arc<AtomicUsize>,
    pub finished: Arc<AtomicUsize>,
}

impl Slow {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            started: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Calls whose handler has returned.
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl NamedService for Slow {
    const NAME: &'static str = "test.Slow";
}

impl tower::Service<http::Request<BoxBody>> for Slow {
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: http::Request<BoxBody>) -> Self::Future {
        self.started.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay;
        let finished = self.finished.clone();
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(ok_response(&HealthCheckResponse { status: 1 }))
        })
    }
}

fn ok_response(message: &HealthCheckResponse) -> http::Response<BoxBody> {
    let encoded = message.encode_to_vec();
    let mut frame = vec![0u8];
    frame.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
    frame.extend_from_slice(&encoded);

    let mut trailers = http::HeaderMap::new();
    trailers.insert("grpc-status", http::HeaderValue::from_static("0"));

    let frames = vec![
        Ok::<_, Status>(Frame::data(Bytes::from(frame))),
        Ok(Frame::trailers(trailers)),
    ];
    let body = StreamBody::new(futures::stream::iter(frames));

    let mut response = http::Response::new(BoxBody::new(body));
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/grpc"),
    );
    response
}

pub fn local_config() -> ServerConfig {
    ServerConfig::default().with_address("127.0.0.1:0")
}

/// Serve `server` on an ephemeral port.
pub async fn spawn(
    server: Server,
) -> (
    Arc<Server>,
    SocketAddr,
    JoinHandle<Result<(), ServerError>>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(server);

    let handle = tokio::spawn({
        let server = server.clone();
        async move { server.serve_with_listener(listener).await }
    });

    (server, addr, handle)
}

pub fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        address: addr.to_string(),
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub async fn connect(addr: SocketAddr) -> Client {
    Client::connect(client_config(addr), None).await.unwrap()
}

/// Call `path` with an empty `HealthCheckRequest`.
pub async fn unary(client: Client, path: &'static str) -> Result<HealthCheckResponse, Status> {
    let mut grpc = tonic::client::Grpc::new(client);
    grpc.ready()
        .await
        .map_err(|err| Status::unavailable(err.to_string()))?;

    let codec: ProstCodec<HealthCheckRequest, HealthCheckResponse> = ProstCodec::default();
    let request = tonic::Request::new(HealthCheckRequest {
        service: String::new(),
    });
    let response = grpc
        .unary(request, http::uri::PathAndQuery::from_static(path), codec)
        .await?;
    Ok(response.into_inner())
}

/// Poll `condition` every few milliseconds for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
