//! The seam between the engine and an HTTP transport.
//!
//! The engine does not own connections. A client hands fully formed HTTP
//! requests to a [`GrpcService`] and reads the response it returns, a
//! server is itself a [`GrpcService`] an HTTP stack can call into.

use std::fmt;
use std::future::Future;

use bytes::Bytes;
use http_body::Body;
use http_body_util::combinators::UnsyncBoxBody;

use crate::{BoxError, Status};

/// The body type of requests and responses produced by the engine.
pub type GrpcBody = UnsyncBoxBody<Bytes, Status>;

/// An HTTP exchange carrying gRPC calls.
pub trait GrpcService: Send + Sync + 'static {
    /// Body of the returned response.
    type ResponseBody: Body<Data = Bytes, Error: Into<BoxError>> + Send + 'static;
    /// Error of a failed exchange, mapped to a [`Status`] by the caller.
    type Error: Into<BoxError> + Send + 'static;

    /// Send `request` and resolve with the response head as soon as it is
    /// available. The body is streamed.
    fn serve(
        &self,
        request: http::Request<GrpcBody>,
    ) -> impl Future<Output = Result<http::Response<Self::ResponseBody>, Self::Error>> + Send;
}

/// A [`GrpcService`] created from an async function, see [`service_fn`].
#[derive(Clone)]
pub struct ServiceFn<F> {
    f: F,
}

impl<F> fmt::Debug for ServiceFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceFn")
            .field("f", &std::any::type_name::<F>())
            .finish()
    }
}

/// Create a [`GrpcService`] from an async function.
pub fn service_fn<F>(f: F) -> ServiceFn<F> {
    ServiceFn { f }
}

impl<F, Fut, B, E> GrpcService for ServiceFn<F>
where
    F: Fn(http::Request<GrpcBody>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<http::Response<B>, E>> + Send,
    B: Body<Data = Bytes, Error: Into<BoxError>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    type ResponseBody = B;
    type Error = E;

    fn serve(
        &self,
        request: http::Request<GrpcBody>,
    ) -> impl Future<Output = Result<http::Response<B>, E>> + Send {
        (self.f)(request)
    }
}
