//! Pull based byte sources with consumed / examined bookkeeping.
//!
//! A read returns everything buffered but not yet consumed. The reader then
//! reports how far it consumed (those bytes are released) and how far it
//! examined. When everything was examined the next read waits for more
//! data, otherwise it returns the remaining buffer right away.

use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use bytes::{Buf, Bytes, BytesMut};
use http::HeaderMap;
use http_body::Body;
use tracing::trace;

use crate::{BoxError, Status};

/// The outcome of a read on a [`ReadSource`].
#[derive(Debug)]
pub struct ReadResult<'a> {
    /// All buffered bytes not yet consumed.
    pub buffer: &'a [u8],
    /// No more bytes will follow the buffer.
    pub is_completed: bool,
    /// The read was cancelled by [`ReadSource::cancel_pending_read`].
    pub is_canceled: bool,
}

/// Outcome of a read that may not suspend.
#[derive(Debug)]
pub enum TryRead<'a> {
    /// Data (or completion) was available immediately.
    Ready(ReadResult<'a>),
    /// Nothing new is available without waiting.
    Pending,
    /// The source cannot answer without suspending.
    Unsupported,
}

/// An asynchronous byte source.
pub trait ReadSource: Send {
    /// Poll for buffered bytes.
    fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<Result<ReadResult<'_>, Status>>;

    /// Release `consumed` bytes and mark `examined` bytes as seen, both
    /// relative to the start of the buffer of the last read.
    fn advance_to(&mut self, consumed: usize, examined: usize);

    /// Read without suspending.
    fn try_read(&mut self) -> TryRead<'_> {
        TryRead::Unsupported
    }

    /// Make the pending (or next) read return with `is_canceled` set.
    fn cancel_pending_read(&mut self);

    /// Take the trailers received after the last byte, if any.
    fn take_trailers(&mut self) -> Option<HeaderMap> {
        None
    }
}

impl<S: ReadSource + ?Sized> ReadSource for Box<S> {
    fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<Result<ReadResult<'_>, Status>> {
        (**self).poll_read(cx)
    }

    fn advance_to(&mut self, consumed: usize, examined: usize) {
        (**self).advance_to(consumed, examined);
    }

    fn try_read(&mut self) -> TryRead<'_> {
        (**self).try_read()
    }

    fn cancel_pending_read(&mut self) {
        (**self).cancel_pending_read();
    }

    fn take_trailers(&mut self) -> Option<HeaderMap> {
        (**self).take_trailers()
    }
}

/// A [`ReadSource`] over an HTTP body, capturing its trailers.
pub struct BodySource<B> {
    body: Pin<Box<B>>,
    buf: BytesMut,
    examined: usize,
    completed: bool,
    canceled: bool,
    waker: Option<Waker>,
    trailers: Option<HeaderMap>,
}

impl<B> std::fmt::Debug for BodySource<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodySource")
            .field("buffered", &self.buf.len())
            .field("examined", &self.examined)
            .field("completed", &self.completed)
            .field("canceled", &self.canceled)
            .finish()
    }
}

impl<B> BodySource<B>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    /// Create a source reading `body`.
    pub fn new(body: B) -> Self {
        Self {
            body: Box::pin(body),
            buf: BytesMut::new(),
            examined: 0,
            completed: false,
            canceled: false,
            waker: None,
            trailers: None,
        }
    }

    fn result(&self, is_canceled: bool) -> ReadResult<'_> {
        ReadResult {
            buffer: &self.buf,
            is_completed: self.completed,
            is_canceled,
        }
    }
}

impl<B> ReadSource for BodySource<B>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<Result<ReadResult<'_>, Status>> {
        if self.canceled {
            self.canceled = false;
            return Poll::Ready(Ok(self.result(true)));
        }

        while !self.completed && self.examined >= self.buf.len() {
            match self.body.as_mut().poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                    Ok(data) => {
                        trace!(len = data.len(), "body source received data");
                        self.buf.extend_from_slice(&data);
                    }
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            match self.trailers.as_mut() {
                                Some(existing) => existing.extend(trailers),
                                None => self.trailers = Some(trailers),
                            }
                        }
                    }
                },
                Poll::Ready(Some(Err(err))) => {
                    return Poll::Ready(Err(Status::from_error_generic(err)));
                }
                Poll::Ready(None) => self.completed = true,
                Poll::Pending => {
                    self.waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
            }
        }

        Poll::Ready(Ok(self.result(false)))
    }

    fn advance_to(&mut self, consumed: usize, examined: usize) {
        let consumed = consumed.min(self.buf.len());
        self.buf.advance(consumed);
        self.examined = examined.saturating_sub(consumed);
    }

    fn try_read(&mut self) -> TryRead<'_> {
        if self.examined < self.buf.len() || self.completed {
            TryRead::Ready(self.result(false))
        } else {
            TryRead::Pending
        }
    }

    fn cancel_pending_read(&mut self) {
        self.canceled = true;
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }
}

#[cfg(test)]
pub(crate) use test_source::SliceSource;

#[cfg(test)]
mod test_source {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory source handing out one chunk per wait.
    pub(crate) struct SliceSource {
        chunks: VecDeque<Vec<u8>>,
        buf: Vec<u8>,
        examined: usize,
        canceled: bool,
    }

    impl SliceSource {
        pub(crate) fn new(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks: chunks.into(),
                buf: Vec::new(),
                examined: 0,
                canceled: false,
            }
        }
    }

    impl ReadSource for SliceSource {
        fn poll_read(&mut self, _cx: &mut Context<'_>) -> Poll<Result<ReadResult<'_>, Status>> {
            let canceled = std::mem::take(&mut self.canceled);
            if !canceled && self.examined >= self.buf.len() {
                if let Some(chunk) = self.chunks.pop_front() {
                    self.buf.extend_from_slice(&chunk);
                }
            }
            Poll::Ready(Ok(ReadResult {
                buffer: &self.buf,
                is_completed: self.chunks.is_empty(),
                is_canceled: canceled,
            }))
        }

        fn advance_to(&mut self, consumed: usize, examined: usize) {
            self.buf.drain(..consumed);
            self.examined = examined - consumed;
        }

        fn cancel_pending_read(&mut self) {
            self.canceled = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use http_body::Frame;
    use http_body_util::StreamBody;
    use std::future::poll_fn;

    fn body(
        frames: Vec<Frame<Bytes>>,
    ) -> StreamBody<impl futures::Stream<Item = Result<Frame<Bytes>, Status>> + Send + 'static>
    {
        StreamBody::new(stream::iter(frames.into_iter().map(Ok)))
    }

    #[tokio::test]
    async fn examined_bytes_wait_for_more() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", http::HeaderValue::from_static("0"));
        let mut source = BodySource::new(body(vec![
            Frame::data(Bytes::from_static(b"ab")),
            Frame::data(Bytes::from_static(b"cd")),
            Frame::trailers(trailers),
        ]));

        let len = poll_fn(|cx| source.poll_read(cx).map_ok(|r| r.buffer.len()))
            .await
            .unwrap();
        assert_eq!(len, 2);
        source.advance_to(0, 2);

        let (buffer, completed) = poll_fn(|cx| {
            source
                .poll_read(cx)
                .map_ok(|r| (r.buffer.to_vec(), r.is_completed))
        })
        .await
        .unwrap();
        assert_eq!(buffer, b"abcd");
        assert!(!completed);
        source.advance_to(4, 4);

        let completed = poll_fn(|cx| source.poll_read(cx).map_ok(|r| r.is_completed))
            .await
            .unwrap();
        assert!(completed);
        assert!(source.take_trailers().is_some());
        assert!(source.take_trailers().is_none());
    }

    #[tokio::test]
    async fn cancel_pending_read() {
        let mut source = BodySource::new(body(vec![Frame::data(Bytes::from_static(b"ab"))]));
        source.cancel_pending_read();
        let canceled = poll_fn(|cx| source.poll_read(cx).map_ok(|r| r.is_canceled))
            .await
            .unwrap();
        assert!(canceled);
    }
}
