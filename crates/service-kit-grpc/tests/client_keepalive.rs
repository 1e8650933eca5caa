use std::convert::Infallible;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http2;
use hyper_util::rt::{TokioExecutor, TokioIo};
use service_kit_grpc::config::ClientParameters;
use service_kit_grpc::{Client, ClientConfig, ClientKeepAlive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;

const PREFACE_LEN: usize = 24;
const PING: u8 = 0x6;
const ACK: u8 = 0x1;

/// Counts PING frames the peer sends that are not acknowledgements.
struct PingCounter<T> {
    inner: T,
    pending: Vec<u8>,
    preface_seen: bool,
    pings: Arc<AtomicUsize>,
}

impl<T> PingCounter<T> {
    fn scan(&mut self) {
        if !self.preface_seen {
            if self.pending.len() < PREFACE_LEN {
                return;
            }
            self.pending.drain(..PREFACE_LEN);
            self.preface_seen = true;
        }

        while self.pending.len() >= 9 {
            let header = &self.pending[..9];
            let length = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
            if self.pending.len() < 9 + length {
                return;
            }
            if header[3] == PING && header[4] & ACK == 0 {
                self.pings.fetch_add(1, Ordering::SeqCst);
            }
            self.pending.drain(..9 + length);
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for PingCounter<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = polled {
            this.pending.extend_from_slice(&buf.filled()[before..]);
            this.scan();
        }
        polled
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for PingCounter<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Connect an idle client to a bare HTTP/2 server and count its pings.
///
/// The client asks for a 100ms interval, which is raised to the 10s floor, so
/// a permitted client pings once in the 12s window.
async fn idle_client_pings(permit_without_stream: bool) -> usize {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let pings = Arc::new(AtomicUsize::new(0));

    tokio::spawn({
        let pings = pings.clone();
        async move {
            let (stream, _) = listener.accept().await.unwrap();
            let io = PingCounter {
                inner: stream,
                pending: Vec::new(),
                preface_seen: false,
                pings,
            };
            let service = hyper::service::service_fn(|_req| async {
                Ok::<_, Infallible>(http::Response::new(Full::new(Bytes::new())))
            });
            let _ = http2::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(io), service)
                .await;
        }
    });

    let config = ClientConfig {
        address: addr.to_string(),
        keep_alive: ClientKeepAlive {
            client_parameters: ClientParameters {
                permit_without_stream,
                time: Duration::from_millis(100),
                timeout: Duration::from_secs(1),
            },
        },
        ..Default::default()
    };
    let client = Client::connect(config, None).await.unwrap();

    tokio::time::sleep(Duration::from_secs(12)).await;
    drop(client);
    pings.load(Ordering::SeqCst)
}

#[tokio::test]
async fn idle_client_does_not_ping_by_default() {
    assert_eq!(idle_client_pings(false).await, 0);
}

#[tokio::test]
async fn idle_client_pings_when_permitted_at_the_floor_interval() {
    let pings = idle_client_pings(true).await;
    assert!((1..=2).contains(&pings), "{pings} pings");
}
