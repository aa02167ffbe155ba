use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use http::{HeaderMap, StatusCode};
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::{debug, trace};

use super::compression::{self, CompressionRegistry, IDENTITY};
use super::frame::{Frame, FrameDecoder, FrameReader};
use super::source::ReadSource;
use super::{DEFAULT_MAX_RECV_MESSAGE_SIZE, Decoder};
use crate::call::{Call, CallState};
use crate::metadata::MetadataMap;
use crate::metrics::CallMetric;
use crate::web::{Protocol, decode_trailers};
use crate::{Code, Status};

/// Which side of the call a [`Streaming`] reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    /// Server reading client messages, ends with the body.
    Request,
    /// Client reading server messages, ends with trailers.
    Response,
}

/// How a [`Streaming`] decodes what it reads.
#[derive(Debug, Clone)]
pub(crate) struct DecodeConfig {
    pub(crate) protocol: Protocol,
    pub(crate) registry: CompressionRegistry,
    pub(crate) encoding: Option<String>,
    pub(crate) max_message_size: usize,
    pub(crate) call: Option<Call>,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Grpc,
            registry: CompressionRegistry::default(),
            encoding: None,
            max_message_size: DEFAULT_MAX_RECV_MESSAGE_SIZE,
            call: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Reading,
    Done,
}

/// A lazy sequence of received messages.
///
/// For responses the sequence only ends once the peer sent its trailers,
/// an `Ok` status ends it cleanly, any other status is yielded as the last
/// item. Termination of the call (cancellation, deadline) interrupts a
/// pending read with the terminal status.
pub struct Streaming<T> {
    decoder: Box<dyn Decoder<Item = T> + Send + 'static>,
    reader: Option<FrameReader<Box<dyn ReadSource>>>,
    direction: Direction,
    protocol: Protocol,
    registry: CompressionRegistry,
    encoding: Option<String>,
    max_message_size: usize,
    http_status: StatusCode,
    call: Option<Call>,
    terminated: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    trailers: Option<HeaderMap>,
    trailer_metadata: Option<MetadataMap>,
    single: bool,
    received: usize,
    state: State,
}

impl<T> fmt::Debug for Streaming<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Streaming")
            .field("direction", &self.direction)
            .field("protocol", &self.protocol)
            .field("encoding", &self.encoding)
            .field("call", &self.call)
            .field("state", &self.state)
            .finish()
    }
}

impl<T> Streaming<T> {
    fn build(
        decoder: impl Decoder<Item = T> + Send + 'static,
        reader: Option<FrameReader<Box<dyn ReadSource>>>,
        direction: Direction,
        http_status: StatusCode,
        config: DecodeConfig,
    ) -> Self {
        let terminated = config
            .call
            .as_ref()
            .map(|call| Box::pin(call.terminated()));
        Self {
            decoder: Box::new(decoder),
            reader,
            direction,
            protocol: config.protocol,
            registry: config.registry,
            encoding: config.encoding,
            max_message_size: config.max_message_size,
            http_status,
            call: config.call,
            terminated,
            trailers: None,
            trailer_metadata: None,
            single: false,
            received: 0,
            state: State::Reading,
        }
    }

    fn frame_reader(
        source: Box<dyn ReadSource>,
        config: &DecodeConfig,
    ) -> FrameReader<Box<dyn ReadSource>> {
        let decoder = FrameDecoder::new(config.max_message_size)
            .with_trailer_frames(config.protocol.is_web());
        FrameReader::new(source, decoder)
    }

    /// Messages sent by a client, ending with the request body.
    pub(crate) fn new_request(
        decoder: impl Decoder<Item = T> + Send + 'static,
        source: Box<dyn ReadSource>,
        config: DecodeConfig,
    ) -> Self {
        let reader = Self::frame_reader(source, &config);
        Self::build(
            decoder,
            Some(reader),
            Direction::Request,
            StatusCode::OK,
            config,
        )
    }

    /// Messages sent by a server, ending with its trailers.
    pub(crate) fn new_response(
        decoder: impl Decoder<Item = T> + Send + 'static,
        source: Box<dyn ReadSource>,
        http_status: StatusCode,
        config: DecodeConfig,
    ) -> Self {
        let reader = Self::frame_reader(source, &config);
        Self::build(
            decoder,
            Some(reader),
            Direction::Response,
            http_status,
            config,
        )
    }

    /// An empty response whose status arrived with the headers.
    pub(crate) fn new_empty(
        decoder: impl Decoder<Item = T> + Send + 'static,
        trailers: HeaderMap,
        config: DecodeConfig,
    ) -> Self {
        let mut streaming =
            Self::build(decoder, None, Direction::Response, StatusCode::OK, config);
        streaming.trailers = Some(trailers);
        streaming
    }

    /// Require the response to carry exactly one message.
    ///
    /// An `Ok` status without a message, or a second message, fails the
    /// call with `Internal`.
    pub(crate) fn expect_single(&mut self) {
        self.single = true;
    }

    /// Fetch the next message, `None` at the end of the stream.
    pub async fn message(&mut self) -> Result<Option<T>, Status> {
        self.next().await.transpose()
    }

    /// Drain the remaining messages and return the trailing metadata.
    ///
    /// Trailers are handed out once, later calls return `None`.
    pub async fn trailers(&mut self) -> Result<Option<MetadataMap>, Status> {
        while let Some(item) = self.next().await {
            item?;
        }
        Ok(self.trailer_metadata.take())
    }

    fn fail(&mut self, status: Status) -> Status {
        self.state = State::Done;
        if let Some(reader) = self.reader.as_mut() {
            reader.source_mut().cancel_pending_read();
        }
        match self.call.as_ref() {
            Some(call) => call.finish(status),
            None => status,
        }
    }

    fn decode_message(&mut self, compressed: bool, payload: Bytes) -> Result<T, Status> {
        let payload = if compressed {
            let name = match self.encoding.as_deref() {
                None | Some(IDENTITY) => {
                    return Err(Status::internal(
                        "protocol error: received message with compressed-flag but no grpc-encoding was specified",
                    ));
                }
                Some(name) => name,
            };
            let Some(provider) = self.registry.get(name) else {
                debug!(encoding = name, "received message with unsupported encoding");
                return Err(Status::unimplemented(format!(
                    "Content is compressed with `{name}` which isn't supported"
                )));
            };
            compression::decompress(provider.as_ref(), &payload, self.max_message_size)?
        } else {
            payload
        };

        let len = payload.len();
        let item = self.decoder.decode(payload)?;
        self.received += 1;
        if let Some(call) = self.call.as_ref() {
            call.advance(CallState::Streaming);
            call.metrics().increment(CallMetric::MessagesReceived);
            call.metrics().observe(CallMetric::MessagesReceived, len as u64);
        }
        trace!(len, compressed, "received message");
        Ok(item)
    }

    fn end_of_stream(&mut self) -> Option<Result<T, Status>> {
        self.state = State::Done;
        if self.direction == Direction::Request {
            return None;
        }

        let trailers = self.trailers.take().or_else(|| {
            self.reader
                .as_mut()
                .and_then(|reader| reader.source_mut().take_trailers())
        });
        let result = crate::status::infer_grpc_status(trailers.as_ref(), self.http_status);
        self.trailer_metadata = trailers.map(MetadataMap::from_headers);

        let status = match result {
            Ok(()) if self.single && self.received == 0 => {
                Status::internal("Missing response message.")
            }
            Ok(()) => Status::ok(""),
            Err(status) => status,
        };
        let status = match self.call.as_ref() {
            Some(call) => call.finish(status),
            None => status,
        };
        if status.code() == Code::Ok {
            None
        } else {
            Some(Err(status))
        }
    }
}

impl<T> Stream for Streaming<T> {
    type Item = Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.state == State::Done {
                return Poll::Ready(None);
            }

            if let Some(terminated) = this.terminated.as_mut() {
                if terminated.as_mut().poll(cx).is_ready() {
                    this.terminated = None;
                    if let Some(status) = this.call.as_ref().and_then(Call::failure) {
                        trace!("read interrupted by call termination");
                        this.fail(status.clone());
                        return Poll::Ready(Some(Err(status)));
                    }
                }
            }

            let Some(reader) = this.reader.as_mut() else {
                return Poll::Ready(this.end_of_stream());
            };

            match ready!(reader.poll_frame(cx)) {
                Ok(Some(Frame::Message {
                    compressed,
                    payload,
                })) => {
                    if this.single && this.received > 0 {
                        let status = this.fail(Status::internal(
                            "Expected one response message but received more.",
                        ));
                        return Poll::Ready(Some(Err(status)));
                    }
                    let item = this.decode_message(compressed, payload);
                    return Poll::Ready(Some(item.map_err(|status| this.fail(status))));
                }
                Ok(Some(Frame::Trailers(block))) => {
                    if this.direction == Direction::Request {
                        let status =
                            this.fail(Status::internal("protocol error: trailers in request"));
                        return Poll::Ready(Some(Err(status)));
                    }
                    match decode_trailers(&block) {
                        Ok(trailers) => {
                            this.trailers = Some(trailers);
                            return Poll::Ready(this.end_of_stream());
                        }
                        Err(status) => return Poll::Ready(Some(Err(this.fail(status)))),
                    }
                }
                Ok(None) => return Poll::Ready(this.end_of_stream()),
                Err(status) => return Poll::Ready(Some(Err(this.fail(status)))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::codec::BytesCodec;
    use crate::codec::frame::encode_frame;
    use crate::codec::source::SliceSource;
    use crate::metrics::NoopMetrics;
    use crate::web::encode_trailers;
    use http::HeaderValue;

    fn body(frames: &[Bytes]) -> Box<dyn ReadSource> {
        Box::new(SliceSource::new(vec![frames.concat()]))
    }

    #[tokio::test]
    async fn request_ends_with_body() {
        let frames = [
            encode_frame(b"one", false).unwrap(),
            encode_frame(b"", false).unwrap(),
        ];
        let mut streaming =
            Streaming::new_request(BytesCodec, body(&frames), DecodeConfig::default());
        assert_eq!(streaming.message().await.unwrap().unwrap(), "one");
        assert_eq!(streaming.message().await.unwrap().unwrap(), "");
        assert!(streaming.message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn response_without_trailers_is_an_error() {
        let frames = [encode_frame(b"one", false).unwrap()];
        let mut streaming = Streaming::new_response(
            BytesCodec,
            body(&frames),
            StatusCode::OK,
            DecodeConfig::default(),
        );
        assert_eq!(streaming.message().await.unwrap().unwrap(), "one");
        let err = streaming.message().await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn web_trailer_frame_ends_response() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("5"));
        trailers.insert("grpc-message", HeaderValue::from_static("not%20here"));
        trailers.insert("x-trailer", HeaderValue::from_static("yes"));
        let frames = [
            encode_frame(b"one", false).unwrap(),
            encode_trailers(&trailers),
        ];
        let config = DecodeConfig {
            protocol: Protocol::GrpcWeb,
            ..Default::default()
        };
        let mut streaming =
            Streaming::new_response(BytesCodec, body(&frames), StatusCode::OK, config);
        assert_eq!(streaming.message().await.unwrap().unwrap(), "one");
        let err = streaming.message().await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(err.message(), "not here");
        assert_eq!(
            err.metadata().get("x-trailer").unwrap().to_str(),
            Some("yes")
        );
        assert!(streaming.message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_encoding_is_unimplemented() {
        let frames = [encode_frame(b"whatever", true).unwrap()];
        let config = DecodeConfig {
            encoding: Some("unknown-algo".to_owned()),
            ..Default::default()
        };
        let mut streaming = Streaming::new_request(BytesCodec, body(&frames), config);
        let err = streaming.message().await.unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
        assert!(err.message().contains("unknown-algo"));
    }

    #[tokio::test]
    async fn unknown_encoding_without_flag_passes_through() {
        let frames = [encode_frame(b"plain", false).unwrap()];
        let config = DecodeConfig {
            encoding: Some("unknown-algo".to_owned()),
            ..Default::default()
        };
        let mut streaming = Streaming::new_request(BytesCodec, body(&frames), config);
        assert_eq!(streaming.message().await.unwrap().unwrap(), "plain");
    }

    #[tokio::test]
    async fn compressed_flag_without_encoding_is_internal() {
        let frames = [encode_frame(b"whatever", true).unwrap()];
        let mut streaming =
            Streaming::new_request(BytesCodec, body(&frames), DecodeConfig::default());
        let err = streaming.message().await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn trailers_only_response() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", HeaderValue::from_static("0"));
        headers.insert("x-trailer", HeaderValue::from_static("yes"));
        let mut streaming: Streaming<Bytes> =
            Streaming::new_empty(BytesCodec, headers, DecodeConfig::default());
        let trailers = streaming.trailers().await.unwrap().unwrap();
        assert_eq!(trailers.get("x-trailer").unwrap().to_str(), Some("yes"));
        assert!(streaming.trailers().await.unwrap().is_none());
    }

    fn single_config(protocol: Protocol) -> (Call, DecodeConfig) {
        let call = Call::new("/test.Echo/Unary", None, None, Arc::new(NoopMetrics));
        let config = DecodeConfig {
            protocol,
            call: Some(call.clone()),
            ..Default::default()
        };
        (call, config)
    }

    #[tokio::test]
    async fn single_response_without_message_fails_the_call() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", HeaderValue::from_static("0"));
        let (call, config) = single_config(Protocol::Grpc);
        let mut streaming: Streaming<Bytes> = Streaming::new_empty(BytesCodec, headers, config);
        streaming.expect_single();

        let err = streaming.message().await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert_eq!(err.message(), "Missing response message.");
        assert_eq!(call.status().unwrap().code(), Code::Internal);
    }

    #[tokio::test]
    async fn single_response_rejects_a_second_message() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        let frames = [
            encode_frame(b"a", false).unwrap(),
            encode_frame(b"b", false).unwrap(),
            encode_trailers(&trailers),
        ];
        let (call, config) = single_config(Protocol::GrpcWeb);
        let mut streaming =
            Streaming::new_response(BytesCodec, body(&frames), StatusCode::OK, config);
        streaming.expect_single();

        assert_eq!(streaming.message().await.unwrap().unwrap(), "a");
        let err = streaming.message().await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert_eq!(call.status().unwrap().code(), Code::Internal);
        assert!(streaming.message().await.unwrap().is_none());
    }
}
