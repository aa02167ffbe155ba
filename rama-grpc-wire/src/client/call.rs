use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::call::{Call, CallState};
use crate::codec::compression::{CompressionProvider, CompressionRegistry, parse_accept_encoding};
use crate::codec::decode::DecodeConfig;
use crate::codec::{Decoder, Encoder, MessageEncoder, ReadSource, Streaming};
use crate::metadata::{GRPC_ACCEPT_ENCODING_HEADER, GRPC_ENCODING_HEADER, MetadataMap};
use crate::metrics::CallMetric;
use crate::web::{Base64Reader, Protocol};
use crate::{Code, Response, Status};

pub(super) type ExchangeResult = Result<(http::response::Parts, Box<dyn ReadSource>), Status>;

/// The sending half of a call.
///
/// Messages are written in order, one at a time. Once [`complete`] was
/// called any further write fails with `Internal`.
///
/// [`complete`]: RequestSink::complete
pub struct RequestSink<M> {
    call: Call,
    tx: Option<mpsc::Sender<Bytes>>,
    encoder: MessageEncoder<Box<dyn Encoder<Item = M> + Send>>,
    compression: Option<Arc<dyn CompressionProvider>>,
}

impl<M> fmt::Debug for RequestSink<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSink")
            .field("call", &self.call)
            .field("completed", &self.tx.is_none())
            .field(
                "compression",
                &self.compression.as_ref().map(|p| p.encoding_name().to_owned()),
            )
            .finish()
    }
}

impl<M> RequestSink<M> {
    pub(super) fn new(
        call: Call,
        tx: mpsc::Sender<Bytes>,
        encoder: MessageEncoder<Box<dyn Encoder<Item = M> + Send>>,
        compression: Option<Arc<dyn CompressionProvider>>,
    ) -> Self {
        Self {
            call,
            tx: Some(tx),
            encoder,
            compression,
        }
    }

    /// The call this sink writes to.
    pub fn call(&self) -> &Call {
        &self.call
    }

    /// Serialize, frame and send one message.
    pub async fn send(&mut self, message: M) -> Result<(), Status> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(Status::internal(
                "Request stream has already been completed.",
            ));
        };
        if self.call.is_terminated() {
            return Err(self.call.closed());
        }

        let compression = self
            .compression
            .as_deref()
            .filter(|provider| self.call.peer_accepts(provider.encoding_name()));
        let frame = match self.encoder.encode(message, compression) {
            Ok(frame) => frame,
            Err(status) => return Err(self.call.finish(status)),
        };
        let len = frame.len();

        tokio::select! {
            biased;
            () = self.call.terminated() => Err(self.call.closed()),
            sent = tx.send(frame) => match sent {
                Ok(()) => {
                    self.call.advance(CallState::Streaming);
                    self.call.metrics().increment(CallMetric::MessagesSent);
                    self.call.metrics().observe(CallMetric::MessagesSent, len as u64);
                    trace!(path = self.call.path(), len, "sent message");
                    Ok(())
                }
                Err(_closed) => Err(self.call.failure().unwrap_or_else(|| {
                    Status::unavailable("Request stream was closed by the transport.")
                })),
            },
        }
    }

    /// Signal that no more messages follow. Calling it twice is a no-op.
    pub fn complete(&mut self) {
        if self.tx.take().is_some() {
            trace!(path = self.call.path(), "request stream completed");
        }
    }

    /// Whether [`complete`](Self::complete) was called.
    pub fn is_completed(&self) -> bool {
        self.tx.is_none()
    }
}

/// The receiving half of a call, resolved once response headers arrive.
pub struct PendingResponse<M> {
    call: Call,
    rx: oneshot::Receiver<ExchangeResult>,
    decoder: Box<dyn Decoder<Item = M> + Send>,
    protocol: Protocol,
    registry: CompressionRegistry,
    max_message_size: usize,
}

impl<M> fmt::Debug for PendingResponse<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse")
            .field("call", &self.call)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl<M: 'static> PendingResponse<M> {
    pub(super) fn new(
        call: Call,
        rx: oneshot::Receiver<ExchangeResult>,
        decoder: Box<dyn Decoder<Item = M> + Send>,
        protocol: Protocol,
        registry: CompressionRegistry,
        max_message_size: usize,
    ) -> Self {
        Self {
            call,
            rx,
            decoder,
            protocol,
            registry,
            max_message_size,
        }
    }

    /// The call this response belongs to.
    pub fn call(&self) -> &Call {
        &self.call
    }

    /// Wait for the response headers.
    ///
    /// A status carried by the headers (trailers-only response) that is not
    /// `Ok` is returned as the error.
    pub async fn response(self) -> Result<Response<Streaming<M>>, Status> {
        let Self {
            call,
            rx,
            decoder,
            protocol,
            registry,
            max_message_size,
        } = self;

        let exchange = tokio::select! {
            biased;
            () = call.terminated() => return Err(call.closed()),
            exchange = rx => exchange,
        };
        let (parts, source) = match exchange {
            Ok(Ok(exchange)) => exchange,
            Ok(Err(status)) => return Err(call.finish(status)),
            Err(_dropped) => return Err(call.closed()),
        };

        if let Some(value) = parts.headers.get(GRPC_ACCEPT_ENCODING_HEADER) {
            call.set_peer_accept_encoding(parse_accept_encoding(value));
        }
        let encoding = parts
            .headers
            .get(GRPC_ENCODING_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let config = DecodeConfig {
            protocol,
            registry,
            encoding,
            max_message_size,
            call: Some(call.clone()),
        };

        let trailers_only = parts.headers.contains_key(Status::GRPC_STATUS);
        if trailers_only || parts.status != StatusCode::OK {
            let status = match Status::from_header_map(&parts.headers) {
                Some(status) => status,
                None => crate::status::infer_grpc_status(None, parts.status)
                    .err()
                    .unwrap_or_else(|| Status::unknown("response without a status")),
            };
            if status.code() != Code::Ok {
                return Err(call.finish(status));
            }
            trace!(path = call.path(), "trailers-only response");
            let streaming = Streaming::new_empty(decoder, parts.headers.clone(), config);
            return Ok(Response::from_parts(
                MetadataMap::from_headers(parts.headers),
                streaming,
                parts.extensions,
            ));
        }

        let source: Box<dyn ReadSource> = if protocol.is_text() {
            Box::new(Base64Reader::new(source))
        } else {
            source
        };
        let streaming = Streaming::new_response(decoder, source, parts.status, config);
        Ok(Response::from_parts(
            MetadataMap::from_headers(parts.headers),
            streaming,
            parts.extensions,
        ))
    }
}

/// Read exactly one message and the trailers of a response.
pub(super) async fn single_message<M>(
    response: Response<Streaming<M>>,
) -> Result<Response<M>, Status> {
    let (mut metadata, mut streaming, extensions) = response.into_parts();
    streaming.expect_single();

    let message = streaming
        .message()
        .await
        .map_err(|mut status| {
            status.metadata_mut().extend(metadata.clone());
            status
        })?
        .ok_or_else(|| Status::internal("Missing response message."))?;

    if let Some(trailers) = streaming.trailers().await? {
        metadata.extend(trailers);
    }

    Ok(Response::from_parts(metadata, message, extensions))
}

/// A client streaming call: many requests, one response.
pub struct ClientStreamingCall<M1, M2> {
    sink: RequestSink<M1>,
    response: PendingResponse<M2>,
}

impl<M1, M2> fmt::Debug for ClientStreamingCall<M1, M2> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStreamingCall")
            .field("sink", &self.sink)
            .finish()
    }
}

impl<M1, M2: 'static> ClientStreamingCall<M1, M2> {
    pub(super) fn new(sink: RequestSink<M1>, response: PendingResponse<M2>) -> Self {
        Self { sink, response }
    }

    /// The underlying call.
    pub fn call(&self) -> &Call {
        self.sink.call()
    }

    /// Send one request message.
    pub async fn send(&mut self, message: M1) -> Result<(), Status> {
        self.sink.send(message).await
    }

    /// Signal the end of the request stream.
    pub fn complete(&mut self) {
        self.sink.complete();
    }

    /// Complete the request stream and wait for the single response.
    pub async fn response(self) -> Result<Response<M2>, Status> {
        let Self { mut sink, response } = self;
        sink.complete();
        single_message(response.response().await?).await
    }
}

/// A duplex streaming call.
///
/// The halves can be split off and driven from separate tasks.
pub struct StreamingCall<M1, M2> {
    sink: RequestSink<M1>,
    response: PendingResponse<M2>,
}

impl<M1, M2> fmt::Debug for StreamingCall<M1, M2> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingCall")
            .field("sink", &self.sink)
            .finish()
    }
}

impl<M1, M2> StreamingCall<M1, M2> {
    pub(super) fn new(sink: RequestSink<M1>, response: PendingResponse<M2>) -> Self {
        Self { sink, response }
    }

    /// The underlying call.
    pub fn call(&self) -> &Call {
        self.sink.call()
    }

    /// The sending half.
    pub fn sink_mut(&mut self) -> &mut RequestSink<M1> {
        &mut self.sink
    }

    /// Split into the sending and receiving half.
    pub fn split(self) -> (RequestSink<M1>, PendingResponse<M2>) {
        (self.sink, self.response)
    }
}
