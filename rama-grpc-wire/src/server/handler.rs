use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, Stream, StreamExt};
use http::Extensions;

use crate::call::Call;
use crate::codec::decode::DecodeConfig;
use crate::codec::{Codec, CompressionProvider, MessageEncoder, ReadSource, Streaming};
use crate::method::MethodKind;
use crate::metadata::MetadataMap;
use crate::request::CallOptions;
use crate::{Request, Response, Status};

type UnaryFn<Req, Res> =
    Box<dyn Fn(Request<Req>) -> BoxFuture<'static, Result<Response<Res>, Status>> + Send + Sync>;
type ClientStreamingFn<Req, Res> = Box<
    dyn Fn(Request<Streaming<Req>>) -> BoxFuture<'static, Result<Response<Res>, Status>>
        + Send
        + Sync,
>;
type ServerStreamingFn<Req, Res> = Box<
    dyn Fn(Request<Req>) -> BoxFuture<'static, Result<Response<ResponseStream<Res>>, Status>>
        + Send
        + Sync,
>;
type DuplexStreamingFn<Req, Res> = Box<
    dyn Fn(
            Request<Streaming<Req>>,
        ) -> BoxFuture<'static, Result<Response<ResponseStream<Res>>, Status>>
        + Send
        + Sync,
>;

/// The stream of messages a streaming handler responds with.
pub type ResponseStream<T> = BoxStream<'static, Result<T, Status>>;

/// A typed method handler, one variant per call shape.
///
/// The [`Call`] of the request is available in its extensions.
pub enum MethodHandler<Req, Res> {
    /// One request, one response.
    Unary(UnaryFn<Req, Res>),
    /// A request stream, one response.
    ClientStreaming(ClientStreamingFn<Req, Res>),
    /// One request, a response stream.
    ServerStreaming(ServerStreamingFn<Req, Res>),
    /// A request stream and a response stream.
    DuplexStreaming(DuplexStreamingFn<Req, Res>),
}

impl<Req, Res> fmt::Debug for MethodHandler<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MethodHandler").field(&self.kind()).finish()
    }
}

impl<Req, Res> MethodHandler<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    /// A unary handler.
    pub fn unary<F, Fut>(f: F) -> Self
    where
        F: Fn(Request<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<Res>, Status>> + Send + 'static,
    {
        Self::Unary(Box::new(move |request| f(request).boxed()))
    }

    /// A client streaming handler.
    pub fn client_streaming<F, Fut>(f: F) -> Self
    where
        F: Fn(Request<Streaming<Req>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<Res>, Status>> + Send + 'static,
    {
        Self::ClientStreaming(Box::new(move |request| f(request).boxed()))
    }

    /// A server streaming handler.
    pub fn server_streaming<F, Fut, S>(f: F) -> Self
    where
        F: Fn(Request<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<S>, Status>> + Send + 'static,
        S: Stream<Item = Result<Res, Status>> + Send + 'static,
    {
        Self::ServerStreaming(Box::new(move |request| {
            let response = f(request);
            async move { response.await.map(|response| response.map(StreamExt::boxed)) }.boxed()
        }))
    }

    /// A duplex streaming handler.
    pub fn duplex_streaming<F, Fut, S>(f: F) -> Self
    where
        F: Fn(Request<Streaming<Req>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<S>, Status>> + Send + 'static,
        S: Stream<Item = Result<Res, Status>> + Send + 'static,
    {
        Self::DuplexStreaming(Box::new(move |request| {
            let response = f(request);
            async move { response.await.map(|response| response.map(StreamExt::boxed)) }.boxed()
        }))
    }
}

impl<Req, Res> MethodHandler<Req, Res> {
    /// The call shape this handler serves.
    pub fn kind(&self) -> MethodKind {
        match self {
            Self::Unary(_) => MethodKind::Unary,
            Self::ClientStreaming(_) => MethodKind::ClientStreaming,
            Self::ServerStreaming(_) => MethodKind::ServerStreaming,
            Self::DuplexStreaming(_) => MethodKind::DuplexStreaming,
        }
    }
}

/// Everything a route needs to run one call.
pub(super) struct Dispatch {
    pub(super) call: Call,
    pub(super) source: Box<dyn ReadSource>,
    pub(super) decode: DecodeConfig,
    pub(super) metadata: MetadataMap,
    pub(super) extensions: Extensions,
    pub(super) compression: Option<Arc<dyn CompressionProvider>>,
    pub(super) max_encoding_message_size: usize,
}

pub(super) type FrameStream = BoxStream<'static, Result<Bytes, Status>>;

/// A registered method with its message types erased.
pub(super) trait Route: Send + Sync + 'static {
    fn kind(&self) -> MethodKind;

    fn dispatch(
        &self,
        dispatch: Dispatch,
    ) -> BoxFuture<'static, Result<Response<FrameStream>, Status>>;
}

pub(super) struct TypedRoute<C: Codec> {
    pub(super) codec: C,
    pub(super) handler: Arc<MethodHandler<C::Decode, C::Encode>>,
}

impl<C> Route for TypedRoute<C>
where
    C: Codec + Clone + Send + Sync + 'static,
{
    fn kind(&self) -> MethodKind {
        self.handler.kind()
    }

    fn dispatch(
        &self,
        dispatch: Dispatch,
    ) -> BoxFuture<'static, Result<Response<FrameStream>, Status>> {
        let mut codec = self.codec.clone();
        let handler = Arc::clone(&self.handler);
        async move {
            let Dispatch {
                call,
                source,
                decode,
                metadata,
                mut extensions,
                compression,
                max_encoding_message_size,
            } = dispatch;

            extensions.insert(call.clone());
            let options = CallOptions::new()
                .with_metadata(metadata)
                .with_deadline(call.deadline());
            let mut streaming = Streaming::new_request(codec.decoder(), source, decode);
            let mut encoder = MessageEncoder::new(codec.encoder(), max_encoding_message_size);

            let response: Response<ResponseStream<C::Encode>> = match handler.as_ref() {
                MethodHandler::Unary(f) => {
                    let message = single_request(&mut streaming).await?;
                    f(Request::from_parts(options, message, extensions))
                        .await?
                        .map(|message| stream::once(async move { Ok(message) }).boxed())
                }
                MethodHandler::ServerStreaming(f) => {
                    let message = single_request(&mut streaming).await?;
                    f(Request::from_parts(options, message, extensions)).await?
                }
                MethodHandler::ClientStreaming(f) => f(Request::from_parts(
                    options, streaming, extensions,
                ))
                .await?
                .map(|message| stream::once(async move { Ok(message) }).boxed()),
                MethodHandler::DuplexStreaming(f) => {
                    f(Request::from_parts(options, streaming, extensions)).await?
                }
            };

            Ok(response.map(|messages| {
                messages
                    .map(move |message| {
                        message.and_then(|message| encoder.encode(message, compression.as_deref()))
                    })
                    .boxed()
            }))
        }
        .boxed()
    }
}

/// Read the single message of a unary request.
async fn single_request<T>(streaming: &mut Streaming<T>) -> Result<T, Status> {
    let message = streaming
        .message()
        .await?
        .ok_or_else(|| Status::internal("Missing request message."))?;
    if streaming.message().await?.is_some() {
        return Err(Status::internal(
            "Expected one request message but received more.",
        ));
    }
    Ok(message)
}
