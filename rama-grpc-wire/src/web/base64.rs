use std::error::Error;
use std::fmt;
use std::task::{Context, Poll, ready};

use base64::Engine as _;
use bytes::{Buf, BytesMut};
use http::HeaderMap;
use tracing::trace;

use crate::Status;
use crate::codec::source::{ReadResult, ReadSource, TryRead};
use crate::util::base64::PADDED;

/// A grpc-web-text body could not be decoded.
#[derive(Debug)]
pub enum TranscodeError {
    /// The body ended with an incomplete group of 1 to 3 symbols.
    Truncated {
        /// Number of dangling symbols.
        trailing: usize,
    },
    /// The body contains symbols or padding that are not valid base64.
    Malformed(base64::DecodeError),
}

impl fmt::Display for TranscodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { trailing } => write!(
                f,
                "grpc-web-text body ended within a base64 group ({trailing} trailing symbols)"
            ),
            Self::Malformed(err) => write!(f, "grpc-web-text body is not valid base64: {err}"),
        }
    }
}

impl Error for TranscodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Truncated { .. } => None,
            Self::Malformed(err) => Some(err),
        }
    }
}

impl From<TranscodeError> for Status {
    fn from(err: TranscodeError) -> Self {
        Self::internal(err.to_string())
    }
}

/// A [`ReadSource`] presenting the decoded form of a base64 encoded source.
///
/// Every read decodes all complete 4 symbol groups available from the inner
/// source. A group holding `=` padding ends a fragment, the next group
/// starts a new one, so independently padded chunks concatenate cleanly.
/// Only whole groups are consumed from the inner source, so decoded
/// positions always map to exact encoded positions.
#[derive(Debug)]
pub struct Base64Reader<R> {
    inner: R,
    decoded: BytesMut,
    examined: usize,
    inner_done: bool,
    canceled: bool,
}

impl<R: ReadSource> Base64Reader<R> {
    /// Wrap an encoded source.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoded: BytesMut::new(),
            examined: 0,
            inner_done: false,
            canceled: false,
        }
    }

    /// Consume the reader, returning the inner source.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Decode whole groups, one decode step per padded fragment.
fn decode_fragments(src: &[u8], dst: &mut BytesMut) -> Result<(), TranscodeError> {
    let mut start = 0;
    while start < src.len() {
        let end = src[start..]
            .chunks_exact(4)
            .position(|group| group.contains(&b'='))
            .map_or(src.len(), |index| start + (index + 1) * 4);
        let decoded = PADDED
            .decode(&src[start..end])
            .map_err(TranscodeError::Malformed)?;
        trace!(
            encoded = end - start,
            decoded = decoded.len(),
            "decoded base64 fragment"
        );
        dst.extend_from_slice(&decoded);
        start = end;
    }
    Ok(())
}

impl<R: ReadSource> ReadSource for Base64Reader<R> {
    fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<Result<ReadResult<'_>, Status>> {
        loop {
            if std::mem::take(&mut self.canceled) {
                return Poll::Ready(Ok(ReadResult {
                    buffer: &self.decoded,
                    is_completed: self.inner_done,
                    is_canceled: true,
                }));
            }

            if self.examined < self.decoded.len() || self.inner_done {
                return Poll::Ready(Ok(ReadResult {
                    buffer: &self.decoded,
                    is_completed: self.inner_done,
                    is_canceled: false,
                }));
            }

            let read = ready!(self.inner.poll_read(cx))?;
            let canceled = read.is_canceled;
            let completed = read.is_completed;
            let available = read.buffer.len();
            let usable = available - available % 4;
            let decoded = decode_fragments(&read.buffer[..usable], &mut self.decoded);

            if canceled {
                self.canceled = true;
            }
            decoded?;
            if completed && usable < available {
                return Poll::Ready(Err(TranscodeError::Truncated {
                    trailing: available - usable,
                }
                .into()));
            }

            self.inner.advance_to(usable, available);
            if completed {
                self.inner_done = true;
            }
        }
    }

    fn advance_to(&mut self, consumed: usize, examined: usize) {
        let consumed = consumed.min(self.decoded.len());
        self.decoded.advance(consumed);
        self.examined = examined.saturating_sub(consumed);
    }

    /// Decoding may need to pull from the inner source, which can suspend.
    fn try_read(&mut self) -> TryRead<'_> {
        TryRead::Unsupported
    }

    fn cancel_pending_read(&mut self) {
        if self.inner_done {
            self.canceled = true;
        } else {
            self.inner.cancel_pending_read();
        }
    }

    fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.inner.take_trailers()
    }
}
