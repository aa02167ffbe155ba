use std::pin::Pin;
use std::task::{Context, Poll};

use base64::Engine as _;
use bytes::Bytes;
use http::HeaderMap;
use http_body::{Body, Frame};
use pin_project_lite::pin_project;

use crate::util::base64::PADDED;

/// Incremental base64 encoder.
///
/// Whole 3 byte groups are encoded as soon as they are available, a
/// partial group is held back until [`Base64Encoder::flush`].
#[derive(Debug, Default, Clone)]
pub struct Base64Encoder {
    pending: Vec<u8>,
}

impl Base64Encoder {
    /// Create a new encoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode as much of the buffered input plus `src` as forms whole groups.
    pub fn encode(&mut self, src: &[u8]) -> Bytes {
        let encoded = if self.pending.is_empty() {
            let whole = src.len() - src.len() % 3;
            self.pending.extend_from_slice(&src[whole..]);
            PADDED.encode(&src[..whole])
        } else {
            self.pending.extend_from_slice(src);
            let whole = self.pending.len() - self.pending.len() % 3;
            let encoded = PADDED.encode(&self.pending[..whole]);
            self.pending.drain(..whole);
            encoded
        };
        Bytes::from(encoded)
    }

    /// Encode the held back partial group, padded.
    pub fn flush(&mut self) -> Bytes {
        if self.pending.is_empty() {
            return Bytes::new();
        }
        let encoded = PADDED.encode(&self.pending);
        self.pending.clear();
        Bytes::from(encoded)
    }

    /// Whether a partial group is held back.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

pin_project! {
    /// A body base64 encoding the data of an inner body.
    ///
    /// A held back partial group is flushed whenever the inner body has
    /// nothing ready, so a stalled stream never withholds message bytes.
    /// Trailers of the inner body are passed on after the final flush.
    pub struct Base64EncodeBody<B> {
        #[pin]
        inner: B,
        encoder: Base64Encoder,
        done: bool,
        trailers: Option<HeaderMap>,
    }
}

impl<B> Base64EncodeBody<B> {
    /// Wrap a binary body.
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            encoder: Base64Encoder::new(),
            done: false,
            trailers: None,
        }
    }
}

impl<B> std::fmt::Debug for Base64EncodeBody<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Base64EncodeBody")
            .field("encoder", &self.encoder)
            .field("done", &self.done)
            .finish()
    }
}

impl<B> Body for Base64EncodeBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        loop {
            if *this.done {
                return Poll::Ready(this.trailers.take().map(|t| Ok(Frame::trailers(t))));
            }

            match this.inner.as_mut().poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                    Ok(data) => {
                        let encoded = this.encoder.encode(&data);
                        if !encoded.is_empty() {
                            return Poll::Ready(Some(Ok(Frame::data(encoded))));
                        }
                    }
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            *this.done = true;
                            *this.trailers = Some(trailers);
                            let rest = this.encoder.flush();
                            if !rest.is_empty() {
                                return Poll::Ready(Some(Ok(Frame::data(rest))));
                            }
                        }
                    }
                },
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Some(Err(err))),
                Poll::Ready(None) => {
                    *this.done = true;
                    let rest = this.encoder.flush();
                    if !rest.is_empty() {
                        return Poll::Ready(Some(Ok(Frame::data(rest))));
                    }
                }
                Poll::Pending => {
                    if this.encoder.has_pending() {
                        return Poll::Ready(Some(Ok(Frame::data(this.encoder.flush()))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use http_body_util::{BodyExt, StreamBody};
    use std::convert::Infallible;

    #[test]
    fn encoder_holds_partial_groups() {
        let mut encoder = Base64Encoder::new();
        assert_eq!(encoder.encode(b"He"), "");
        assert_eq!(encoder.encode(b"llo"), "SGVs");
        assert!(encoder.has_pending());
        assert_eq!(encoder.flush(), "bG8=");
        assert_eq!(encoder.flush(), "");
    }

    #[tokio::test]
    async fn body_flushes_at_end() {
        let frames: Vec<Result<Frame<Bytes>, Infallible>> = vec![
            Ok(Frame::data(Bytes::from_static(b"He"))),
            Ok(Frame::data(Bytes::from_static(b"llo"))),
        ];
        let body = Base64EncodeBody::new(StreamBody::new(stream::iter(frames)));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, "SGVsbG8=");
    }
}
