//! What actually goes over the wire, observed at the transport seam.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures::stream;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, Uri};
use http_body::Frame;
use http_body_util::{BodyExt, Full, StreamBody};
use parking_lot::Mutex;
use rama_grpc_wire::codec::BytesCodec;
use rama_grpc_wire::web::decode_trailers;
use rama_grpc_wire::{
    CallOptions, Code, GrpcBody, GrpcClient, GrpcServer, GrpcService, MethodDescriptor,
    MethodHandler, MethodKind, Request, Response, Status,
};

fn unary_method() -> MethodDescriptor {
    MethodDescriptor::new("test.Echo", "Unary", MethodKind::Unary)
}

fn concat_method() -> MethodDescriptor {
    MethodDescriptor::new("test.Echo", "Concat", MethodKind::ClientStreaming)
}

fn server(invoked: Arc<AtomicBool>) -> GrpcServer {
    GrpcServer::new()
        .with_method(
            &unary_method(),
            BytesCodec,
            MethodHandler::unary(move |request: Request<Bytes>| {
                invoked.store(true, Ordering::SeqCst);
                async move { Ok(Response::new(request.into_inner())) }
            }),
        )
        .with_method(
            &concat_method(),
            BytesCodec,
            MethodHandler::client_streaming(
                |request: Request<rama_grpc_wire::Streaming<Bytes>>| async move {
                    let mut messages = request.into_inner();
                    let mut len = 0;
                    while let Some(message) = messages.message().await? {
                        len += message.len();
                    }
                    Ok::<_, Status>(Response::new(Bytes::from(len.to_string())))
                },
            ),
        )
}

/// Buffers each request body, forwards it to the server and keeps a copy
/// of everything that passed.
struct Recording {
    server: GrpcServer,
    requests: Mutex<Vec<(HeaderMap, Bytes)>>,
    responses: Mutex<Vec<HeaderMap>>,
}

impl Recording {
    fn new(server: GrpcServer) -> Self {
        Self {
            server,
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
        }
    }
}

impl GrpcService for Recording {
    type ResponseBody = GrpcBody;
    type Error = Infallible;

    fn serve(
        &self,
        request: http::Request<GrpcBody>,
    ) -> impl Future<Output = Result<http::Response<GrpcBody>, Infallible>> + Send {
        async move {
            let (parts, body) = request.into_parts();
            let body = body.collect().await.unwrap().to_bytes();
            self.requests
                .lock()
                .push((parts.headers.clone(), body.clone()));

            let response = self
                .server
                .serve_http(http::Request::from_parts(parts, Full::new(body)))
                .await;
            self.responses.lock().push(response.headers().clone());
            Ok(response)
        }
    }
}

fn recording_client(server: GrpcServer) -> GrpcClient<Recording> {
    GrpcClient::new(Recording::new(server), Uri::from_static("http://localhost"))
}

#[tokio::test]
async fn client_stream_frames_in_order() {
    let client = recording_client(server(Arc::default()));
    let mut call = client
        .client_streaming(CallOptions::new(), &concat_method(), BytesCodec)
        .await
        .unwrap();
    for len in [10usize, 0, 4096] {
        call.send(Bytes::from(vec![0xab; len])).await.unwrap();
    }
    let response = call.response().await.unwrap();
    assert_eq!(response.get_ref(), "4106");

    let requests = client.transport().requests.lock();
    let (headers, body) = &requests[0];
    assert_eq!(headers[CONTENT_TYPE], "application/grpc");
    assert_eq!(headers["te"], "trailers");

    let mut rest = &body[..];
    for expected in [10usize, 0, 4096] {
        assert_eq!(rest[0], 0, "uncompressed flag");
        let len = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
        assert_eq!(len, expected);
        rest = &rest[5 + len..];
    }
    assert!(rest.is_empty());
}

#[tokio::test]
async fn unknown_encoding_never_reaches_the_handler() {
    let invoked = Arc::new(AtomicBool::new(false));
    let server = server(invoked.clone());

    let request = http::Request::builder()
        .method(Method::POST)
        .uri("/test.Echo/Unary")
        .header(CONTENT_TYPE, "application/grpc")
        .header("grpc-encoding", "unknown-algo")
        .body(Full::new(Bytes::from_static(&[1, 0, 0, 0, 3, b'a', b'b', b'c'])))
        .unwrap();
    let response = server.serve_http(request).await;

    let status = Status::from_header_map(response.headers()).unwrap();
    assert_eq!(status.code(), Code::Unimplemented);
    assert!(status.message().contains("unknown-algo"));
    #[cfg(feature = "compression")]
    assert_eq!(response.headers()["grpc-accept-encoding"], "gzip,deflate,zstd");
    assert!(!invoked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn text_body_fragments_decode() {
    let server = server(Arc::default());

    // [0][len 5]"Hello" is "AAAAAAVIZWxsbw==", split across reads and padding
    let chunks = ["AAAAAAVI", "ZWxsbw", "=", "="];
    let body = StreamBody::new(stream::iter(
        chunks
            .into_iter()
            .map(|chunk| Ok::<_, Infallible>(Frame::data(Bytes::from_static(chunk.as_bytes())))),
    ));
    let request = http::Request::builder()
        .method(Method::POST)
        .uri("/test.Echo/Unary")
        .header(CONTENT_TYPE, "application/grpc-web-text")
        .body(body)
        .unwrap();

    let response = server.serve_http(request).await;
    assert_eq!(
        response.headers()[CONTENT_TYPE],
        "application/grpc-web-text+proto"
    );
    let text = response.into_body().collect().await.unwrap().to_bytes();
    let decoded: Vec<u8> = text
        .chunks(4)
        .flat_map(|group| STANDARD.decode(group).unwrap())
        .collect();

    assert_eq!(&decoded[..10], b"\x00\x00\x00\x00\x05Hello");
    assert_eq!(decoded[10], 0x80);
    let trailers = decode_trailers(&decoded[15..]).unwrap();
    assert_eq!(trailers["grpc-status"], "0");
}

#[tokio::test]
async fn web_request_headers() {
    let client = recording_client(server(Arc::default()))
        .with_protocol(rama_grpc_wire::Protocol::GrpcWeb);
    client
        .unary(Request::new(Bytes::from_static(b"x")), &unary_method(), BytesCodec)
        .await
        .unwrap();

    let requests = client.transport().requests.lock();
    let (headers, _body) = &requests[0];
    assert_eq!(headers[CONTENT_TYPE], "application/grpc-web+proto");
    assert_eq!(headers["x-grpc-web"], "1");
    assert!(!headers.contains_key("te"));
}

#[cfg(feature = "compression")]
#[tokio::test]
async fn compression_is_negotiated() {
    let payload = Bytes::from(b"abcdefgh".repeat(256));

    let client = recording_client(server(Arc::default()).with_send_compressed("gzip"))
        .with_send_compressed("gzip");
    let response = client
        .unary(Request::new(payload.clone()), &unary_method(), BytesCodec)
        .await
        .unwrap();
    assert_eq!(response.get_ref(), &payload);

    let requests = client.transport().requests.lock();
    let (headers, body) = &requests[0];
    assert_eq!(headers["grpc-encoding"], "gzip");
    assert_eq!(headers["grpc-accept-encoding"], "gzip,deflate,zstd");
    assert_eq!(body[0], 1, "compressed flag");
    assert!(body.len() < payload.len());
    let responses = client.transport().responses.lock();
    assert_eq!(responses[0]["grpc-encoding"], "gzip");
}

#[cfg(feature = "compression")]
#[tokio::test]
async fn server_only_compresses_for_accepting_clients() {
    let client = recording_client(server(Arc::default()).with_send_compressed("gzip"))
        .with_compression_registry(rama_grpc_wire::codec::CompressionRegistry::empty());
    let response = client
        .unary(Request::new(Bytes::from_static(b"plain")), &unary_method(), BytesCodec)
        .await
        .unwrap();
    assert_eq!(response.get_ref(), "plain");

    let requests = client.transport().requests.lock();
    assert!(!requests[0].0.contains_key("grpc-accept-encoding"));
    let responses = client.transport().responses.lock();
    assert!(!responses[0].contains_key("grpc-encoding"));
}
