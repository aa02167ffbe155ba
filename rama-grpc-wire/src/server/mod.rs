//! The server side call dispatcher.
//!
//! A [`GrpcServer`] routes `/{service}/{method}` requests to registered
//! [`MethodHandler`]s. It is itself a [`GrpcService`], so any HTTP stack
//! (or a [`GrpcClient`](crate::GrpcClient) directly) can drive it.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, StatusCode};
use http_body::Body;
use http_body_util::{BodyExt, Empty};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::call::Call;
use crate::codec::compression::parse_accept_encoding;
use crate::codec::decode::DecodeConfig;
use crate::codec::{
    BodySource, Codec, CompressionProvider, CompressionRegistry, DEFAULT_MAX_RECV_MESSAGE_SIZE,
    DEFAULT_MAX_SEND_MESSAGE_SIZE, EncodeBody, ReadSource,
};
use crate::metadata::{
    GRPC_ACCEPT_ENCODING_HEADER, GRPC_ENCODING_HEADER, MetadataMap, try_parse_grpc_timeout,
};
use crate::method::{MethodDescriptor, split_path};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::transport::{GrpcBody, GrpcService};
use crate::web::{Base64EncodeBody, Base64Reader, Protocol};
use crate::{BoxError, Code, Status};

mod handler;

#[doc(inline)]
pub use handler::{MethodHandler, ResponseStream};

use handler::{Dispatch, Route, TypedRoute};

/// A gRPC server dispatcher.
pub struct GrpcServer {
    services: HashMap<String, HashMap<String, Arc<dyn Route>>>,
    config: ServerConfig,
}

struct ServerConfig {
    registry: CompressionRegistry,
    send_compression: Option<String>,
    max_decoding_message_size: usize,
    max_encoding_message_size: usize,
    max_timeout: Option<Duration>,
    metrics: Arc<dyn MetricsSink>,
}

impl Default for GrpcServer {
    fn default() -> Self {
        Self::new()
    }
}

impl GrpcServer {
    /// Create a server without any registered method.
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
            config: ServerConfig {
                registry: CompressionRegistry::default(),
                send_compression: None,
                max_decoding_message_size: DEFAULT_MAX_RECV_MESSAGE_SIZE,
                max_encoding_message_size: DEFAULT_MAX_SEND_MESSAGE_SIZE,
                max_timeout: None,
                metrics: Arc::new(NoopMetrics),
            },
        }
    }

    crate::macros::generate_set_and_with! {
        /// The compression providers accepted for requests and available
        /// for responses.
        ///
        /// A compressed request in an encoding outside the registry is
        /// answered with [`Code::Unimplemented`].
        pub fn compression_registry(mut self, registry: CompressionRegistry) -> Self {
            self.config.registry = registry;
            self
        }
    }

    crate::macros::generate_set_and_with! {
        /// Compress responses with the named encoding, for clients which
        /// advertised it in `grpc-accept-encoding`.
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
        /// Upper bound for call deadlines.
        ///
        /// The shorter of this and the `grpc-timeout` sent by the client
        /// applies.
        pub fn max_timeout(mut self, timeout: Duration) -> Self {
            self.config.max_timeout = Some(timeout);
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

    /// Register `handler` for `method`.
    ///
    /// A method registered twice keeps the last handler.
    pub fn add_method<C>(
        &mut self,
        method: &MethodDescriptor,
        codec: C,
        handler: MethodHandler<C::Decode, C::Encode>,
    ) -> &mut Self
    where
        C: Codec + Clone + Send + Sync + 'static,
    {
        if handler.kind() != method.kind() {
            warn!(
                method = %method,
                descriptor = ?method.kind(),
                handler = ?handler.kind(),
                "handler shape differs from method descriptor"
            );
        }
        let route: Arc<dyn Route> = Arc::new(TypedRoute {
            codec,
            handler: Arc::new(handler),
        });
        self.services
            .entry(method.service().to_owned())
            .or_default()
            .insert(method.name().to_owned(), route);
        self
    }

    /// Register `handler` for `method`.
    #[must_use]
    pub fn with_method<C>(
        mut self,
        method: &MethodDescriptor,
        codec: C,
        handler: MethodHandler<C::Decode, C::Encode>,
    ) -> Self
    where
        C: Codec + Clone + Send + Sync + 'static,
    {
        self.add_method(method, codec, handler);
        self
    }

    /// Serve one HTTP request.
    pub async fn serve_http<B>(&self, request: http::Request<B>) -> http::Response<GrpcBody>
    where
        B: Body<Data = Bytes, Error: Into<BoxError>> + Send + 'static,
    {
        let (parts, body) = request.into_parts();

        let Some(protocol) = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(Protocol::from_content_type)
        else {
            debug!(path = parts.uri.path(), "unsupported content-type");
            let mut response = http::Response::new(empty_body());
            *response.status_mut() = StatusCode::UNSUPPORTED_MEDIA_TYPE;
            return response;
        };

        let path = parts.uri.path();
        let Some((service, method)) = split_path(path) else {
            return self.status_response(
                Status::unimplemented("Service is unimplemented."),
                protocol,
            );
        };
        let Some(methods) = self.services.get(service) else {
            debug!(path, "unknown service");
            return self.status_response(
                Status::unimplemented("Service is unimplemented."),
                protocol,
            );
        };
        let Some(route) = methods.get(method) else {
            debug!(path, "unknown method");
            return self.status_response(
                Status::unimplemented("Method is unimplemented."),
                protocol,
            );
        };

        let deadline = self.deadline(&parts.headers).map(|timeout| Instant::now() + timeout);
        let call = Call::new(path, deadline, None, self.config.metrics.clone());
        trace!(path, kind = ?route.kind(), ?protocol, "dispatching call");

        let encoding = parts
            .headers
            .get(GRPC_ENCODING_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let compression = self.response_compression(&parts.headers);

        let source: Box<dyn ReadSource> = if protocol.is_text() {
            Box::new(Base64Reader::new(BodySource::new(body)))
        } else {
            Box::new(BodySource::new(body))
        };
        let dispatch = Dispatch {
            call: call.clone(),
            source,
            decode: DecodeConfig {
                protocol,
                registry: self.config.registry.clone(),
                encoding,
                max_message_size: self.config.max_decoding_message_size,
                call: Some(call.clone()),
            },
            metadata: MetadataMap::from_headers(parts.headers),
            extensions: parts.extensions,
            compression: compression.clone(),
            max_encoding_message_size: self.config.max_encoding_message_size,
        };

        let dispatched = tokio::select! {
            biased;
            () = call.terminated() => Err(call.closed()),
            response = route.dispatch(dispatch) => response,
        };

        let response = match dispatched {
            Ok(response) => response,
            Err(status) => {
                let status = call.finish(status);
                debug!(path = call.path(), code = ?status.code(), "call failed before responding");
                return self.status_response(status, protocol);
            }
        };

        let (metadata, frames, extensions) = response.into_parts();
        let body = EncodeBody::new(frames, protocol, Some(call));
        let body = if protocol.is_text() {
            Base64EncodeBody::new(body).boxed_unsync()
        } else {
            body.boxed_unsync()
        };

        let mut response = http::Response::new(body);
        *response.extensions_mut() = extensions;
        let headers = response.headers_mut();
        headers.extend(metadata.into_sanitized_headers());
        self.insert_grpc_headers(headers, protocol);
        if let Some(provider) = compression.as_deref() {
            if let Ok(value) = HeaderValue::from_str(provider.encoding_name()) {
                headers.insert(GRPC_ENCODING_HEADER, value);
            }
        }
        response
    }

    fn deadline(&self, headers: &HeaderMap) -> Option<Duration> {
        let requested = try_parse_grpc_timeout(headers).unwrap_or_else(|value| {
            debug!(?value, "ignoring invalid grpc-timeout");
            None
        });
        match (requested, self.config.max_timeout) {
            (Some(requested), Some(max)) => Some(requested.min(max)),
            (requested, max) => requested.or(max),
        }
    }

    fn response_compression(&self, headers: &HeaderMap) -> Option<Arc<dyn CompressionProvider>> {
        let name = self.config.send_compression.as_deref()?;
        let accepted = parse_accept_encoding(headers.get(GRPC_ACCEPT_ENCODING_HEADER)?);
        if !accepted.iter().any(|accepted| accepted == name) {
            return None;
        }
        self.config.registry.get(name).cloned()
    }

    fn insert_grpc_headers(&self, headers: &mut HeaderMap, protocol: Protocol) {
        headers.insert(CONTENT_TYPE, protocol.content_type());
        if let Some(value) = self.config.registry.accept_encoding_header() {
            headers.insert(GRPC_ACCEPT_ENCODING_HEADER, value);
        }
    }

    /// A trailers-only response carrying `status`.
    fn status_response(&self, status: Status, protocol: Protocol) -> http::Response<GrpcBody> {
        let mut response = http::Response::new(empty_body());
        let headers = response.headers_mut();
        self.insert_grpc_headers(headers, protocol);
        if let Err(err) = status.add_header(headers) {
            warn!("failed to encode status headers: {err}");
            headers.insert(Status::GRPC_STATUS, HeaderValue::from(Code::Internal as i32));
        }
        response
    }
}

fn empty_body() -> GrpcBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

impl GrpcService for GrpcServer {
    type ResponseBody = GrpcBody;
    type Error = Infallible;

    fn serve(
        &self,
        request: http::Request<GrpcBody>,
    ) -> impl Future<Output = Result<http::Response<GrpcBody>, Infallible>> + Send {
        async move { Ok(self.serve_http(request).await) }
    }
}

impl fmt::Debug for GrpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut services: Vec<_> = self.services.keys().collect();
        services.sort();
        f.debug_struct("GrpcServer")
            .field("services", &services)
            .field("send_compression", &self.config.send_compression)
            .field("max_timeout", &self.config.max_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BytesCodec;
    use crate::method::MethodKind;
    use crate::{Request, Response};

    fn server() -> GrpcServer {
        GrpcServer::new().with_method(
            &MethodDescriptor::new("test.Echo", "Unary", MethodKind::Unary),
            BytesCodec,
            MethodHandler::unary(|request: Request<Bytes>| async move {
                Ok(Response::new(request.into_inner()))
            }),
        )
    }

    fn request(path: &str, content_type: &'static str) -> http::Request<GrpcBody> {
        http::Request::builder()
            .uri(path)
            .header(CONTENT_TYPE, content_type)
            .body(empty_body())
            .unwrap()
    }

    #[tokio::test]
    async fn unsupported_content_type() {
        let response = server()
            .serve_http(request("/test.Echo/Unary", "application/json"))
            .await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn unknown_service_and_method() {
        let server = server();

        let response = server
            .serve_http(request("/test.Missing/Unary", "application/grpc"))
            .await;
        let status = Status::from_header_map(response.headers()).unwrap();
        assert_eq!(status.code(), Code::Unimplemented);
        assert_eq!(status.message(), "Service is unimplemented.");

        let response = server
            .serve_http(request("/test.Echo/Missing", "application/grpc"))
            .await;
        let status = Status::from_header_map(response.headers()).unwrap();
        assert_eq!(status.code(), Code::Unimplemented);
        assert_eq!(status.message(), "Method is unimplemented.");
        assert!(
            response.headers().contains_key(GRPC_ACCEPT_ENCODING_HEADER)
                || cfg!(not(feature = "compression"))
        );
    }

    #[tokio::test]
    async fn empty_unary_request() {
        let response = server()
            .serve_http(request("/test.Echo/Unary", "application/grpc"))
            .await;
        let status = Status::from_header_map(response.headers()).unwrap();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "Missing request message.");
    }

    #[test]
    fn shorter_timeout_wins() {
        let server = server().with_max_timeout(Duration::from_secs(1));
        let mut headers = HeaderMap::new();
        assert_eq!(server.deadline(&headers), Some(Duration::from_secs(1)));
        headers.insert("grpc-timeout", HeaderValue::from_static("100m"));
        assert_eq!(server.deadline(&headers), Some(Duration::from_millis(100)));
        headers.insert("grpc-timeout", HeaderValue::from_static("5S"));
        assert_eq!(server.deadline(&headers), Some(Duration::from_secs(1)));
    }
}
