//! The length-prefixed frame format shared by gRPC and grpc-web.
//!
//! ```text
//! +------+----------------+-----------------+
//! | flag | length (u32 BE)| payload         |
//! +------+----------------+-----------------+
//! ```
//!
//! Flag `0x00` is an uncompressed message, `0x01` a compressed one.
//! grpc-web adds `0x80`: the payload is a trailer block.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use tracing::trace;

use super::DEFAULT_MAX_RECV_MESSAGE_SIZE;
use super::source::ReadSource;
use crate::Status;

/// Size of the frame header: one flag byte and a four byte length.
pub const HEADER_SIZE: usize = 5;

pub(crate) const COMPRESSED_FLAG: u8 = 0x01;
pub(crate) const TRAILER_FLAG: u8 = 0x80;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A message, its payload possibly compressed.
    Message {
        /// Whether the compressed flag was set.
        compressed: bool,
        /// The raw payload.
        payload: Bytes,
    },
    /// A grpc-web trailer block.
    Trailers(Bytes),
}

/// Encode `payload` into a single frame.
///
/// Fails with `ResourceExhausted` if the payload length does not fit the
/// four byte length field.
pub fn encode_frame(payload: &[u8], compressed: bool) -> Result<Bytes, Status> {
    let flag = if compressed { COMPRESSED_FLAG } else { 0 };
    let mut dst = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    put_frame(&mut dst, flag, payload)?;
    Ok(dst.freeze())
}

pub(crate) fn put_frame(dst: &mut BytesMut, flag: u8, payload: &[u8]) -> Result<(), Status> {
    let len = u32::try_from(payload.len()).map_err(|_err| {
        Status::resource_exhausted(format!(
            "Cannot frame a payload of {} bytes, the length field is 32 bits",
            payload.len()
        ))
    })?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u8(flag);
    dst.put_u32(len);
    dst.put_slice(payload);
    Ok(())
}

/// Decodes frames from the front of a byte buffer.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_message_size: usize,
    trailer_frames: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECV_MESSAGE_SIZE)
    }
}

impl FrameDecoder {
    /// Create a decoder rejecting frames longer than `max_message_size`.
    #[must_use]
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            trailer_frames: false,
        }
    }

    crate::macros::generate_set_and_with! {
        /// Accept grpc-web trailer frames.
        pub fn trailer_frames(mut self, accept: bool) -> Self {
            self.trailer_frames = accept;
            self
        }
    }

    /// Decode the frame at the front of `buf`.
    ///
    /// Returns the frame and the number of bytes it occupied, or `None` if
    /// `buf` does not yet hold a complete frame. The declared length is
    /// checked against the maximum as soon as the header is complete.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Frame, usize)>, Status> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let flag = buf[0];
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;

        let trailers = match flag {
            0 | COMPRESSED_FLAG => false,
            TRAILER_FLAG if self.trailer_frames => true,
            flag => {
                trace!("unexpected compression flag");
                return Err(Status::internal(format!(
                    "protocol error: received message with invalid compression flag: {flag} (valid flags are 0 and 1)"
                )));
            }
        };

        if len > self.max_message_size {
            return Err(Status::resource_exhausted(format!(
                "Error, decoded message length too large: found {len} bytes, the limit is: {} bytes",
                self.max_message_size
            )));
        }

        let end = HEADER_SIZE + len;
        if buf.len() < end {
            return Ok(None);
        }

        let payload = Bytes::copy_from_slice(&buf[HEADER_SIZE..end]);
        let frame = if trailers {
            Frame::Trailers(payload)
        } else {
            Frame::Message {
                compressed: flag == COMPRESSED_FLAG,
                payload,
            }
        };
        Ok(Some((frame, end)))
    }
}

/// A lazy, finite sequence of frames read from a [`ReadSource`].
///
/// Partial frames suspend until more bytes arrive. A source completing in
/// the middle of a frame is a framing error.
#[derive(Debug)]
pub struct FrameReader<S> {
    source: S,
    decoder: FrameDecoder,
    finished: bool,
}

impl<S: ReadSource> FrameReader<S> {
    /// Create a reader over `source`.
    pub fn new(source: S, decoder: FrameDecoder) -> Self {
        Self {
            source,
            decoder,
            finished: false,
        }
    }

    /// Reference to the underlying source.
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Poll for the next frame, `None` once the source completed on a
    /// frame boundary.
    pub fn poll_frame(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Frame>, Status>> {
        if self.finished {
            return Poll::Ready(Ok(None));
        }
        let result = ready!(self.poll_frame_inner(cx));
        if !matches!(result, Ok(Some(_))) {
            self.finished = true;
        }
        Poll::Ready(result)
    }

    fn poll_frame_inner(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Frame>, Status>> {
        loop {
            let read = ready!(self.source.poll_read(cx))?;
            if read.is_canceled {
                return Poll::Ready(Err(Status::cancelled("Read was cancelled.")));
            }

            let completed = read.is_completed;
            let buffered = read.buffer.len();
            if let Some((frame, consumed)) = self.decoder.decode(read.buffer)? {
                self.source.advance_to(consumed, consumed);
                return Poll::Ready(Ok(Some(frame)));
            }

            if completed {
                if buffered == 0 {
                    return Poll::Ready(Ok(None));
                }
                return Poll::Ready(Err(Status::internal(format!(
                    "protocol error: stream ended in the middle of a frame ({buffered} bytes left)"
                ))));
            }

            self.source.advance_to(0, buffered);
        }
    }

    /// Wait for the next frame.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, Status> {
        std::future::poll_fn(|cx| self.poll_frame(cx)).await
    }
}

impl<S: ReadSource + Unpin> Stream for FrameReader<S> {
    type Item = Result<Frame, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_frame(cx).map(Result::transpose)
    }
}
