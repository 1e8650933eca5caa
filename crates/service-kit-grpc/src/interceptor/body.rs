//! Body wrappers used by interceptors to observe streams.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use tonic::body::BoxBody;
use tonic::Status;

/// How an observed body finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyEnd {
    /// The body reported end of stream.
    Complete,
    /// The body yielded an error.
    Failed,
    /// The body was dropped before it finished.
    Dropped,
}

/// Callbacks for frames flowing through an [`ObservedBody`].
///
/// `on_end` is called exactly once.
pub(crate) trait BodyObserver: Send + Unpin + 'static {
    fn on_data(&mut self, _data: &Bytes) {}
    fn on_trailers(&mut self, _trailers: &HeaderMap) {}
    fn on_error(&mut self, _error: &Status) {}
    fn on_end(&mut self, _end: BodyEnd) {}
}

pub(crate) struct ObservedBody<O: BodyObserver> {
    inner: BoxBody,
    observer: Option<O>,
}

impl<O: BodyObserver> ObservedBody<O> {
    pub(crate) fn new(inner: BoxBody, observer: O) -> Self {
        Self {
            inner,
            observer: Some(observer),
        }
    }

    /// Wrap and re-box, so the body type stays [`BoxBody`].
    pub(crate) fn boxed(inner: BoxBody, observer: O) -> BoxBody {
        BoxBody::new(Self::new(inner, observer))
    }

    fn finish(&mut self, end: BodyEnd) {
        if let Some(mut observer) = self.observer.take() {
            observer.on_end(end);
        }
    }
}

impl<O: BodyObserver> Body for ObservedBody<O> {
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = ready!(Pin::new(&mut this.inner).poll_frame(cx));

        match &polled {
            Some(Ok(frame)) => {
                if let Some(observer) = this.observer.as_mut() {
                    if let Some(data) = frame.data_ref() {
                        observer.on_data(data);
                    } else if let Some(trailers) = frame.trailers_ref() {
                        observer.on_trailers(trailers);
                    }
                }
            }
            Some(Err(status)) => {
                if let Some(observer) = this.observer.as_mut() {
                    observer.on_error(status);
                }
                this.finish(BodyEnd::Failed);
            }
            None => this.finish(BodyEnd::Complete),
        }

        Poll::Ready(polled)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<O: BodyObserver> Drop for ObservedBody<O> {
    fn drop(&mut self) {
        self.finish(BodyEnd::Dropped);
    }
}

/// Length of the gRPC message prefix: compression flag plus big-endian length.
const PREFIX_LEN: usize = 5;

/// One length-prefixed gRPC message, reduced to its leading bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GrpcMessage {
    pub compressed: bool,
    /// Full payload length from the prefix.
    pub length: usize,
    /// At most the splitter's preview limit of leading payload bytes.
    pub preview: Bytes,
}

/// Finds gRPC message boundaries in arbitrarily split data frames.
///
/// Only the prefix and the first `preview_limit` payload bytes of each
/// message are kept; the rest is counted and skipped.
#[derive(Debug)]
pub(crate) struct MessageSplitter {
    preview_limit: usize,
    prefix: [u8; PREFIX_LEN],
    prefix_filled: usize,
    current: Option<PartialMessage>,
}

#[derive(Debug)]
struct PartialMessage {
    compressed: bool,
    length: usize,
    received: usize,
    preview: BytesMut,
}

impl MessageSplitter {
    pub(crate) fn new(preview_limit: usize) -> Self {
        Self {
            preview_limit,
            prefix: [0; PREFIX_LEN],
            prefix_filled: 0,
            current: None,
        }
    }

    pub(crate) fn push(&mut self, data: &Bytes) -> Vec<GrpcMessage> {
        let mut data: &[u8] = data;
        let mut messages = Vec::new();

        loop {
            if self.current.is_none() {
                let take = (PREFIX_LEN - self.prefix_filled).min(data.len());
                self.prefix[self.prefix_filled..self.prefix_filled + take]
                    .copy_from_slice(&data[..take]);
                self.prefix_filled += take;
                data = &data[take..];
                if self.prefix_filled < PREFIX_LEN {
                    break;
                }

                self.prefix_filled = 0;
                let [flag, a, b, c, d] = self.prefix;
                let length = u32::from_be_bytes([a, b, c, d]) as usize;
                self.current = Some(PartialMessage {
                    compressed: flag == 1,
                    length,
                    received: 0,
                    preview: BytesMut::with_capacity(length.min(self.preview_limit)),
                });
            }
            let Some(partial) = self.current.as_mut() else {
                break;
            };

            let take = (partial.length - partial.received).min(data.len());
            let keep = self
                .preview_limit
                .saturating_sub(partial.preview.len())
                .min(take);
            partial.preview.extend_from_slice(&data[..keep]);
            partial.received += take;
            data = &data[take..];
            if partial.received < partial.length {
                break;
            }

            if let Some(done) = self.current.take() {
                messages.push(GrpcMessage {
                    compressed: done.compressed,
                    length: done.length,
                    preview: done.preview.freeze(),
                });
            }
        }
        messages
    }

    /// Bytes of an incomplete message seen so far.
    pub(crate) fn pending(&self) -> usize {
        self.prefix_filled + self.current.as_ref().map_or(0, |partial| partial.received)
    }
}

/// Hex rendering of `preview`, marked as truncated when the payload was
/// `length` bytes long.
pub(crate) fn hex_preview(preview: &[u8], length: usize) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(preview.len() * 2 + 3);
    for byte in preview {
        let _ = write!(out, "{byte:02x}");
    }
    if length > preview.len() {
        out.push_str("...");
    }
    out
}
