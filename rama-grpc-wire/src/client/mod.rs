//! The client side call invoker.
//!
//! A [`GrpcClient`] wraps a [`GrpcService`] transport and creates one
//! [`Call`] per invocation. Each of the four call shapes resolves call
//! credentials first, then hands the HTTP request to the transport and
//! streams messages through the write path while the transport runs.

use std::fmt;
use std::sync::Arc;

use http::header::{CONTENT_TYPE, TE, USER_AGENT};
use http::uri::{PathAndQuery, Uri};
use http::{HeaderValue, Method, Version};
use http_body_util::BodyExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::call::{Call, CallState};
use crate::codec::encode::ChannelBody;
use crate::codec::{
    BodySource, Codec, CompressionProvider, CompressionRegistry, DEFAULT_MAX_RECV_MESSAGE_SIZE,
    DEFAULT_MAX_SEND_MESSAGE_SIZE, Encoder, MessageEncoder, ReadSource, Streaming,
};
use crate::credentials::{AuthContext, CallCredentials, SecurityLevel};
use crate::metadata::{
    GRPC_ACCEPT_ENCODING_HEADER, GRPC_ENCODING_HEADER, GRPC_TIMEOUT_HEADER, MetadataMap,
    X_GRPC_WEB_HEADER, encode_grpc_timeout,
};
use crate::method::MethodDescriptor;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::request::CallOptions;
use crate::transport::{GrpcBody, GrpcService};
use crate::web::{Base64EncodeBody, Protocol};
use crate::{Request, Response, Status};

mod call;

#[doc(inline)]
pub use call::{ClientStreamingCall, PendingResponse, RequestSink, StreamingCall};

use call::{ExchangeResult, single_message};

/// Number of encoded frames buffered between a [`RequestSink`] and the
/// transport.
const REQUEST_BUFFER: usize = 8;

/// A gRPC client invoker.
///
/// Wraps a [`GrpcService`] transport and encodes / decodes messages via
/// the [`Codec`] passed to each call. Requests are sent to the origin
/// joined with the method path, e.g. `/greeter.Greeter/SayHello`.
pub struct GrpcClient<T> {
    transport: Arc<T>,
    config: ClientConfig,
}

#[derive(Clone)]
struct ClientConfig {
    origin: Uri,
    protocol: Protocol,
    registry: CompressionRegistry,
    send_compression: Option<String>,
    max_decoding_message_size: usize,
    max_encoding_message_size: usize,
    credentials: Option<CallCredentials>,
    security_level: SecurityLevel,
    metrics: Arc<dyn MetricsSink>,
}

impl<T> GrpcClient<T> {
    /// Create a client sending requests to `origin` over `transport`.
    ///
    /// Only the scheme, authority and path prefix of `origin` are used,
    /// the method path is appended per call.
    #[must_use]
    pub fn new(transport: T, origin: Uri) -> Self {
        Self {
            transport: Arc::new(transport),
            config: ClientConfig {
                origin,
                protocol: Protocol::Grpc,
                registry: CompressionRegistry::default(),
                send_compression: None,
                max_decoding_message_size: DEFAULT_MAX_RECV_MESSAGE_SIZE,
                max_encoding_message_size: DEFAULT_MAX_SEND_MESSAGE_SIZE,
                credentials: None,
                security_level: SecurityLevel::None,
                metrics: Arc::new(NoopMetrics),
            },
        }
    }

    /// The transport of this client.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    crate::macros::generate_set_and_with! {
        /// Speak grpc-web or grpc-web-text instead of plain gRPC.
        pub fn protocol(mut self, protocol: Protocol) -> Self {
            self.config.protocol = protocol;
            self
        }
    }

    crate::macros::generate_set_and_with! {
        /// The compression providers used to compress requests and
        /// decompress responses. Their names are advertised in
        /// `grpc-accept-encoding`.
        pub fn compression_registry(mut self, registry: CompressionRegistry) -> Self {
            self.config.registry = registry;
            self
        }
    }

    crate::macros::generate_set_and_with! {
        /// Compress requests with the named encoding.
        ///
        /// The encoding must be part of the compression registry. Messages
        /// are sent uncompressed once the server advertised it does not
        /// accept the encoding.
        pub fn send_compressed(mut self, encoding: impl Into<String>) -> Self {
            self.config.send_compression = Some(encoding.into());
            self
        }
    }

    crate::macros::generate_set_and_with! {
        /// Limits the maximum size of a decoded message.
        pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
            self.config.max_decoding_message_size = limit;
            self
        }
    }

    crate::macros::generate_set_and_with! {
        /// Limits the maximum size of an encoded message.
        pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
            self.config.max_encoding_message_size = limit;
            self
        }
    }

    crate::macros::generate_set_and_with! {
        /// Channel level credentials, applied before per-call credentials.
        pub fn credentials(mut self, credentials: CallCredentials) -> Self {
            self.config.credentials = Some(credentials);
            self
        }
    }

    crate::macros::generate_set_and_with! {
        /// The security level reported to call credentials.
        pub fn security_level(mut self, level: SecurityLevel) -> Self {
            self.config.security_level = level;
            self
        }
    }

    crate::macros::generate_set_and_with! {
        /// Sink receiving call metrics.
        pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
            self.config.metrics = metrics;
            self
        }
    }
}

impl<T: GrpcService> GrpcClient<T> {
    /// Send a single unary gRPC request.
    pub async fn unary<M1, M2, C>(
        &self,
        request: Request<M1>,
        method: &MethodDescriptor,
        codec: C,
    ) -> Result<Response<M2>, Status>
    where
        C: Codec<Encode = M1, Decode = M2>,
        M1: Send + 'static,
        M2: Send + 'static,
    {
        let response = self.server_streaming(request, method, codec).await?;
        single_message(response).await
    }

    /// Send a single request and stream the responses.
    pub async fn server_streaming<M1, M2, C>(
        &self,
        request: Request<M1>,
        method: &MethodDescriptor,
        mut codec: C,
    ) -> Result<Response<Streaming<M2>>, Status>
    where
        C: Codec<Encode = M1, Decode = M2>,
        M1: Send + 'static,
        M2: Send + 'static,
    {
        let (options, message, _extensions) = request.into_parts();
        let (mut sink, pending) = self.start_call(options, method, &mut codec).await?;

        let sent = sink.send(message).await;
        sink.complete();
        if let Err(status) = sent {
            // A closed request stream is answered by the response status.
            if sink.call().is_terminated() {
                return Err(status);
            }
            trace!(path = sink.call().path(), "request not delivered: {status}");
        }

        pending.response().await
    }

    /// Start a client streaming call.
    pub async fn client_streaming<M1, M2, C>(
        &self,
        options: CallOptions,
        method: &MethodDescriptor,
        mut codec: C,
    ) -> Result<ClientStreamingCall<M1, M2>, Status>
    where
        C: Codec<Encode = M1, Decode = M2>,
        M1: Send + 'static,
        M2: Send + 'static,
    {
        let (sink, pending) = self.start_call(options, method, &mut codec).await?;
        Ok(ClientStreamingCall::new(sink, pending))
    }

    /// Start a duplex streaming call.
    pub async fn duplex_streaming<M1, M2, C>(
        &self,
        options: CallOptions,
        method: &MethodDescriptor,
        mut codec: C,
    ) -> Result<StreamingCall<M1, M2>, Status>
    where
        C: Codec<Encode = M1, Decode = M2>,
        M1: Send + 'static,
        M2: Send + 'static,
    {
        let (sink, pending) = self.start_call(options, method, &mut codec).await?;
        Ok(StreamingCall::new(sink, pending))
    }

    async fn start_call<C>(
        &self,
        options: CallOptions,
        method: &MethodDescriptor,
        codec: &mut C,
    ) -> Result<(RequestSink<C::Encode>, PendingResponse<C::Decode>), Status>
    where
        C: Codec,
    {
        let compression = self.config.send_compression_provider()?;
        let (mut metadata, deadline, credentials, cancellation) = options.into_parts();

        let path = method.path();
        let call = Call::new(
            path.as_str(),
            deadline,
            cancellation,
            self.config.metrics.clone(),
        );
        debug!(path = %path, protocol = ?self.config.protocol, "starting call");

        let credentials = match (self.config.credentials.clone(), credentials) {
            (Some(channel), Some(per_call)) => Some(channel.and(per_call)),
            (channel, per_call) => channel.or(per_call),
        };
        if let Some(credentials) = credentials.filter(|credentials| !credentials.is_empty()) {
            let ctx = AuthContext::new(
                method.clone(),
                self.config.origin.authority().map(ToString::to_string),
                self.config.security_level,
            );
            tokio::select! {
                biased;
                () = call.terminated() => return Err(call.closed()),
                applied = credentials.apply(&ctx, &mut metadata) => {
                    if let Err(status) = applied {
                        return Err(call.finish(status));
                    }
                }
            }
        }

        let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
        let request = match self.config.prepare_request(
            &path,
            metadata,
            deadline,
            compression.as_deref(),
            ChannelBody::new(rx),
        ) {
            Ok(request) => request,
            Err(status) => return Err(call.finish(status)),
        };

        let (response_tx, response_rx) = oneshot::channel::<ExchangeResult>();
        let transport = Arc::clone(&self.transport);
        let token = call.cancellation_token();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => trace!("transport exchange abandoned"),
                result = transport.serve(request) => {
                    let result = result
                        .map(|response| {
                            let (parts, body) = response.into_parts();
                            let source: Box<dyn ReadSource> = Box::new(BodySource::new(body));
                            (parts, source)
                        })
                        .map_err(Status::from_error_generic);
                    if response_tx.send(result).is_err() {
                        trace!("response receiver dropped");
                    }
                }
            }
        });
        call.advance(CallState::HeadersSent);

        let encoder = MessageEncoder::new(
            Box::new(codec.encoder()) as Box<dyn Encoder<Item = C::Encode> + Send>,
            self.config.max_encoding_message_size,
        );
        let sink = RequestSink::new(call.clone(), tx, encoder, compression);
        let pending = PendingResponse::new(
            call,
            response_rx,
            Box::new(codec.decoder()),
            self.config.protocol,
            self.config.registry.clone(),
            self.config.max_decoding_message_size,
        );
        Ok((sink, pending))
    }
}

impl ClientConfig {
    fn send_compression_provider(&self) -> Result<Option<Arc<dyn CompressionProvider>>, Status> {
        self.send_compression
            .as_deref()
            .map(|name| {
                self.registry.get(name).cloned().ok_or_else(|| {
                    Status::internal(format!(
                        "send compression `{name}` is not part of the compression registry"
                    ))
                })
            })
            .transpose()
    }

    fn uri(&self, path: &str) -> Result<Uri, Status> {
        let mut parts = self.origin.clone().into_parts();

        let path_and_query: PathAndQuery = match &parts.path_and_query {
            Some(pnq) if pnq != "/" => format!("{}{path}", pnq.path().trim_end_matches('/'))
                .parse()
                .map_err(|_err| Status::internal("new Path/Query combo is invalid"))?,
            _ => path
                .parse()
                .map_err(|_err| Status::internal("method path is invalid"))?,
        };
        parts.path_and_query = Some(path_and_query);

        Uri::from_parts(parts)
            .map_err(|_err| Status::internal("uri with Path/Query combo is invalid"))
    }

    fn prepare_request(
        &self,
        path: &str,
        metadata: MetadataMap,
        deadline: Option<Instant>,
        compression: Option<&dyn CompressionProvider>,
        body: ChannelBody,
    ) -> Result<http::Request<GrpcBody>, Status> {
        let body = if self.protocol.is_text() {
            Base64EncodeBody::new(body).boxed_unsync()
        } else {
            body.boxed_unsync()
        };
        let version = if self.protocol.is_web() {
            Version::HTTP_11
        } else {
            Version::HTTP_2
        };

        let mut request = http::Request::builder()
            .method(Method::POST)
            .uri(self.uri(path)?)
            .version(version)
            .body(body)
            .map_err(|err| Status::internal(format!("failed to build request: {err}")))?;

        let headers = request.headers_mut();
        headers.extend(metadata.into_sanitized_headers());
        headers.insert(CONTENT_TYPE, self.protocol.content_type());
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("rama-grpc-wire/", env!("CARGO_PKG_VERSION"))),
        );
        if self.protocol.is_web() {
            headers.insert(X_GRPC_WEB_HEADER, HeaderValue::from_static("1"));
        } else {
            headers.insert(TE, HeaderValue::from_static("trailers"));
        }

        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            headers.insert(GRPC_TIMEOUT_HEADER, encode_grpc_timeout(remaining));
        }

        if let Some(provider) = compression {
            let value = HeaderValue::from_str(provider.encoding_name())
                .map_err(|_err| Status::internal("invalid compression encoding name"))?;
            headers.insert(GRPC_ENCODING_HEADER, value);
        }
        if let Some(value) = self.registry.accept_encoding_header() {
            headers.insert(GRPC_ACCEPT_ENCODING_HEADER, value);
        }

        Ok(request)
    }
}

impl<T> Clone for GrpcClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for GrpcClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcClient")
            .field("transport", &self.transport)
            .field("origin", &self.config.origin)
            .field("protocol", &self.config.protocol)
            .field("send_compression", &self.config.send_compression)
            .field(
                "max_decoding_message_size",
                &self.config.max_decoding_message_size,
            )
            .field(
                "max_encoding_message_size",
                &self.config.max_encoding_message_size,
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NoTransport;

    fn client(origin: &'static str) -> GrpcClient<NoTransport> {
        GrpcClient::new(NoTransport, Uri::from_static(origin))
    }

    #[test]
    fn uri_joins_origin_and_path() {
        let config = client("http://example.com").config;
        assert_eq!(
            config.uri("/svc.Greeter/Hello").unwrap(),
            "http://example.com/svc.Greeter/Hello"
        );

        let config = client("http://example.com/prefix/").config;
        assert_eq!(
            config.uri("/svc.Greeter/Hello").unwrap(),
            "http://example.com/prefix/svc.Greeter/Hello"
        );
    }

    #[test]
    fn unknown_send_compression_is_rejected() {
        let client = client("http://example.com").with_send_compressed("unknown-algo");
        let result = client.config.send_compression_provider();
        assert!(matches!(result, Err(status) if status.code() == crate::Code::Internal));
    }

    #[tokio::test]
    async fn request_headers() {
        let mut metadata = MetadataMap::new();
        metadata.insert("x-custom".parse().unwrap(), "value").unwrap();
        let config = client("http://example.com")
            .with_protocol(Protocol::GrpcWebText)
            .config;
        let (_tx, rx) = mpsc::channel(1);
        let request = config
            .prepare_request(
                "/svc.Greeter/Hello",
                metadata,
                Some(Instant::now() + std::time::Duration::from_secs(1)),
                None,
                ChannelBody::new(rx),
            )
            .unwrap();

        let headers = request.headers();
        assert_eq!(headers[CONTENT_TYPE], "application/grpc-web-text+proto");
        assert_eq!(headers[X_GRPC_WEB_HEADER], "1");
        assert_eq!(headers["x-custom"], "value");
        assert!(headers.contains_key(GRPC_TIMEOUT_HEADER));
        assert!(!headers.contains_key(TE));
        assert_eq!(request.version(), Version::HTTP_11);
    }
}
