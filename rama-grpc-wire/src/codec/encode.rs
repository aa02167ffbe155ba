use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use http::{HeaderMap, HeaderValue};
use http_body::{Body, Frame};
use tokio::sync::mpsc;
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::{trace, warn};

use super::compression::{self, CompressionProvider};
use super::{Encoder, encode_frame};
use crate::call::{Call, CallState};
use crate::metrics::CallMetric;
use crate::web::{Protocol, encode_trailers};
use crate::{Code, Status};

/// Serializes and frames outgoing messages.
pub struct MessageEncoder<E> {
    encoder: E,
    buf: BytesMut,
    max_message_size: usize,
}

impl<E> fmt::Debug for MessageEncoder<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEncoder")
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}

impl<E: Encoder> MessageEncoder<E> {
    /// Create an encoder rejecting payloads above `max_message_size`.
    pub fn new(encoder: E, max_message_size: usize) -> Self {
        Self {
            encoder,
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    /// Serialize `item` into one complete frame, compressed with
    /// `compression` when given.
    pub fn encode(
        &mut self,
        item: E::Item,
        compression: Option<&dyn CompressionProvider>,
    ) -> Result<Bytes, Status> {
        self.buf.clear();
        self.encoder.encode(item, &mut self.buf)?;

        match compression {
            Some(provider) => {
                let compressed = compression::compress(provider, &self.buf)?;
                self.check_size(compressed.len())?;
                encode_frame(&compressed, true)
            }
            None => {
                self.check_size(self.buf.len())?;
                encode_frame(&self.buf, false)
            }
        }
    }

    fn check_size(&self, len: usize) -> Result<(), Status> {
        if len > self.max_message_size {
            return Err(Status::resource_exhausted(format!(
                "Message too large: found {len} bytes, the limit is: {} bytes",
                self.max_message_size
            )));
        }
        Ok(())
    }
}

/// The response body of a server call.
///
/// Streams the encoded frames of the handler and ends with the status of
/// the call, as HTTP trailers or, for grpc-web, as a trailer frame. If the
/// call terminates first (deadline, cancellation) the body ends with that
/// status instead.
pub struct EncodeBody {
    frames: BoxStream<'static, Result<Bytes, Status>>,
    protocol: Protocol,
    call: Option<Call>,
    terminated: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    done: bool,
}

impl fmt::Debug for EncodeBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodeBody")
            .field("protocol", &self.protocol)
            .field("call", &self.call)
            .field("done", &self.done)
            .finish()
    }
}

impl EncodeBody {
    pub(crate) fn new(
        frames: BoxStream<'static, Result<Bytes, Status>>,
        protocol: Protocol,
        call: Option<Call>,
    ) -> Self {
        let terminated = call.as_ref().map(|call| Box::pin(call.terminated()));
        Self {
            frames,
            protocol,
            call,
            terminated,
            done: false,
        }
    }

    fn finish(&mut self, status: Status) -> Frame<Bytes> {
        self.done = true;
        let status = match self.call.as_ref() {
            Some(call) => call.finish(status),
            None => status,
        };
        trace!(code = ?status.code(), "response complete");

        let trailers = status.to_header_map().unwrap_or_else(|err| {
            warn!("failed to encode status trailers: {err}");
            let mut trailers = HeaderMap::new();
            trailers.insert(Status::GRPC_STATUS, HeaderValue::from(Code::Internal as i32));
            trailers
        });
        if self.protocol.is_web() {
            Frame::data(encode_trailers(&trailers))
        } else {
            Frame::trailers(trailers)
        }
    }
}

impl Body for EncodeBody {
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

        if let Some(terminated) = this.terminated.as_mut() {
            if terminated.as_mut().poll(cx).is_ready() {
                this.terminated = None;
                if let Some(status) = this.call.as_ref().and_then(Call::failure) {
                    return Poll::Ready(Some(Ok(this.finish(status))));
                }
            }
        }

        let frame = match ready!(this.frames.poll_next_unpin(cx)) {
            Some(Ok(frame)) => {
                if let Some(call) = this.call.as_ref() {
                    call.advance(CallState::Streaming);
                    call.metrics().increment(CallMetric::MessagesSent);
                    call.metrics()
                        .observe(CallMetric::MessagesSent, frame.len() as u64);
                }
                Frame::data(frame)
            }
            Some(Err(status)) => this.finish(status),
            None => this.finish(Status::ok("")),
        };
        Poll::Ready(Some(Ok(frame)))
    }

    fn is_end_stream(&self) -> bool {
        self.done
    }
}

/// A request body fed frame by frame from the sending half of a call.
#[derive(Debug)]
pub(crate) struct ChannelBody {
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelBody {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.rx
            .poll_recv(cx)
            .map(|frame| frame.map(|frame| Ok(Frame::data(frame))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BytesCodec;
    use crate::web::decode_trailers;
    use futures::stream;
    use http_body_util::BodyExt;

    #[test]
    fn encode_plain_frame() {
        let mut encoder = MessageEncoder::new(BytesCodec, usize::MAX);
        let frame = encoder.encode(Bytes::from_static(b"abc"), None).unwrap();
        assert_eq!(&frame[..], &[0, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let mut encoder = MessageEncoder::new(BytesCodec, 2);
        let err = encoder
            .encode(Bytes::from_static(b"abc"), None)
            .unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
    }

    #[cfg(feature = "compression")]
    #[test]
    fn encode_sets_compressed_flag() {
        let registry = crate::codec::CompressionRegistry::default();
        let gzip = registry.get("gzip").unwrap();
        let mut encoder = MessageEncoder::new(BytesCodec, usize::MAX);
        let frame = encoder
            .encode(Bytes::from(vec![7u8; 1024]), Some(gzip.as_ref()))
            .unwrap();
        assert_eq!(frame[0], 1);
        assert!(frame.len() < 1024);
    }

    #[tokio::test]
    async fn body_ends_with_status_trailers() {
        let frames = stream::iter(vec![Ok(Bytes::from_static(b"frame"))]);
        let collected = EncodeBody::new(frames.boxed(), Protocol::Grpc, None)
            .collect()
            .await
            .unwrap();
        let trailers = collected.trailers().cloned().unwrap();
        assert_eq!(trailers.get("grpc-status").unwrap(), "0");
        assert_eq!(&collected.to_bytes()[..], b"frame");
    }

    #[tokio::test]
    async fn web_body_ends_with_trailer_frame() {
        let frames = stream::iter(vec![Err(Status::not_found("missing"))]);
        let collected = EncodeBody::new(frames.boxed(), Protocol::GrpcWeb, None)
            .collect()
            .await
            .unwrap();
        assert!(collected.trailers().is_none());
        let bytes = collected.to_bytes();
        assert_eq!(bytes[0], 0x80);
        let trailers = decode_trailers(&bytes[5..]).unwrap();
        assert_eq!(trailers.get("grpc-status").unwrap(), "5");
        assert_eq!(trailers.get("grpc-message").unwrap(), "missing");
    }
}
