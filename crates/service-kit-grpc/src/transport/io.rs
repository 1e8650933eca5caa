//! Socket wrapper that watches HTTP/2 frames going in and out.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

use super::frame::{FrameScanner, DATA, HEADERS};
use super::policy::{ConnectionActivity, PingPolicy, PingVerdict};

/// Applies the ping enforcement policy to the bytes of one connection.
///
/// Inbound PINGs are checked against the policy; outbound HEADERS and DATA
/// reset it. A violation is reported to the connection's
/// [`ConnectionActivity`], which closes the connection.
pub(crate) struct PolicedIo<T> {
    inner: T,
    inbound: FrameScanner,
    outbound: FrameScanner,
    policy: PingPolicy,
    activity: Arc<ConnectionActivity>,
}

impl<T> PolicedIo<T> {
    pub(crate) fn new(inner: T, policy: PingPolicy, activity: Arc<ConnectionActivity>) -> Self {
        Self {
            inner,
            inbound: FrameScanner::inbound(),
            outbound: FrameScanner::outbound(),
            policy,
            activity,
        }
    }

    fn observe_inbound(&mut self, data: &[u8]) {
        let Self {
            inbound,
            policy,
            activity,
            ..
        } = self;

        inbound.feed(data, |frame| {
            if !frame.is_ping_request() {
                return;
            }
            match policy.on_ping(Instant::now(), activity.active_calls()) {
                PingVerdict::Allowed => {}
                PingVerdict::Strike(strikes) => {
                    tracing::debug!(strikes, "client ping arrived too early");
                }
                PingVerdict::TooManyPings => activity.report_ping_violation(),
            }
        });
    }

    fn observe_outbound(&mut self, data: &[u8]) {
        let Self {
            outbound, policy, ..
        } = self;

        outbound.feed(data, |frame| {
            if frame.kind == HEADERS || frame.kind == DATA {
                policy.reset();
            }
        });
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for PolicedIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = polled {
            this.observe_inbound(&buf.filled()[before..]);
        }
        polled
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for PolicedIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = polled {
            this.observe_outbound(&buf[..written]);
        }
        polled
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
