//! Driving a single accepted connection.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use super::io::PolicedIo;
use super::policy::{ActiveCall, ConnectionActivity, PingPolicy};
use crate::config::ServerKeepAlive;
use crate::interceptor::body::ObservedBody;
use crate::interceptor::{error_status, status_response, CallRequest, CallResponse, Handler};

/// Settings shared by every connection of a server.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    /// Keepalive with defaults applied.
    pub keep_alive: ServerKeepAlive,
    pub max_concurrent_streams: Option<u32>,
    pub tcp_nodelay: bool,
}

impl ConnectionSettings {
    /// `max_connection_age` scattered by up to 10% either way, so connections
    /// opened together are not all recycled at once.
    fn jittered_max_age(&self) -> Duration {
        let age = self.keep_alive.server_parameters.max_connection_age;
        age.mul_f64(rand::random_range(0.9..=1.1))
    }
}

/// Why a connection started draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainReason {
    MaxAge,
    Idle,
    TooManyPings,
    ServerStopping,
}

impl DrainReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::MaxAge => "max_connection_age",
            Self::Idle => "max_connection_idle",
            Self::TooManyPings => "too_many_pings",
            Self::ServerStopping => "server_stopping",
        }
    }
}

/// Serve HTTP/2 on `stream` until the peer leaves, the connection is
/// drained, or `force` is cancelled.
///
/// Draining sends GOAWAY and lets in-flight calls finish. It starts when the
/// connection reaches its maximum age, stays idle too long, breaks the ping
/// policy, or when `stopping` is cancelled.
pub(crate) async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    handler: Handler,
    settings: Arc<ConnectionSettings>,
    stopping: CancellationToken,
    force: CancellationToken,
) {
    if let Err(err) = stream.set_nodelay(settings.tcp_nodelay) {
        tracing::debug!(%remote, error = %err, "failed to set TCP_NODELAY");
    }

    let keep_alive = &settings.keep_alive;
    let activity = Arc::new(ConnectionActivity::new());
    let io = PolicedIo::new(
        stream,
        PingPolicy::new(&keep_alive.enforcement_policy),
        activity.clone(),
    );

    let service = hyper::service::service_fn({
        let activity = activity.clone();
        move |req: http::Request<Incoming>| {
            let call = ActiveCall::begin(&activity);
            let handler = handler.clone();
            async move {
                let response = respond(handler, req.map(tonic::body::boxed)).await;
                Ok::<CallResponse, Infallible>(
                    response.map(|body| ObservedBody::boxed(body, call)),
                )
            }
        }
    });

    let mut builder = http2::Builder::new(TokioExecutor::new());
    builder
        .timer(TokioTimer::new())
        .keep_alive_interval(keep_alive.server_parameters.ping_interval())
        .keep_alive_timeout(keep_alive.server_parameters.timeout)
        .max_concurrent_streams(settings.max_concurrent_streams);

    let conn = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    let max_age = tokio::time::sleep(settings.jittered_max_age());
    tokio::pin!(max_age);
    let idle = activity.idle_for(keep_alive.server_parameters.max_connection_idle);
    tokio::pin!(idle);

    tracing::debug!(%remote, "connection accepted");
    let mut draining: Option<DrainReason> = None;

    loop {
        let reason = tokio::select! {
            result = conn.as_mut() => {
                if let Err(err) = result {
                    tracing::debug!(%remote, error = %err, "connection error");
                }
                break;
            }
            _ = force.cancelled() => {
                tracing::debug!(%remote, "connection closed by server stop");
                break;
            }
            _ = &mut max_age, if draining.is_none() => DrainReason::MaxAge,
            _ = &mut idle, if draining.is_none() => DrainReason::Idle,
            _ = activity.ping_violation(), if draining.is_none() => DrainReason::TooManyPings,
            _ = stopping.cancelled(), if draining.is_none() => DrainReason::ServerStopping,
        };

        if reason == DrainReason::TooManyPings {
            tracing::warn!(%remote, reason = reason.as_str(), "closing connection: client sent too many pings");
        } else {
            tracing::debug!(%remote, reason = reason.as_str(), "draining connection");
        }
        conn.as_mut().graceful_shutdown();
        draining = Some(reason);
    }

    tracing::debug!(%remote, "connection closed");
}

/// Run one call through `handler`. Handler errors become a trailers-only
/// status response, so hyper only ever sees a response.
async fn respond(handler: Handler, request: CallRequest) -> CallResponse {
    match handler.oneshot(request).await {
        Ok(response) => response,
        Err(err) => {
            let (code, message) = error_status(&err);
            status_response(&tonic::Status::new(code, message))
        }
    }
}
