//! # rama-grpc-wire
//!
//! The wire protocol engine of [gRPC] and [grpc-web], as used by Rama.
//!
//! This crate implements everything between a typed message and the bytes
//! on an HTTP connection, without owning the connection itself:
//!
//! - length-prefixed message framing with per-message compression,
//!   see [`codec`];
//! - compression negotiation over `grpc-encoding` and
//!   `grpc-accept-encoding`, through a [`CompressionRegistry`];
//! - grpc-web trailer frames and the streaming base64 transcoder of
//!   `grpc-web-text`, see [`web`];
//! - composable call credentials, see [`credentials`];
//! - a per-call state machine with deadlines, cancellation and a status
//!   that is assigned exactly once, see [`call`];
//! - a client side invoker ([`GrpcClient`]) and a server side dispatcher
//!   ([`GrpcServer`]) for the four call shapes.
//!
//! ## Transport
//!
//! There is no transport layer in this crate. A [`GrpcClient`] hands
//! requests to any [`GrpcService`], and a [`GrpcServer`] is a
//! [`GrpcService`] that HTTP stacks can call into. Connecting the two
//! directly gives an in-process loopback.
//!
//! ## Messages
//!
//! Payloads are opaque bytes to the engine. A [`Codec`](codec::Codec)
//! turns typed messages into bytes and back, [`BytesCodec`](codec::BytesCodec)
//! passes them through unchanged.
//!
//! ## Max Message Size
//!
//! Both servers and clients can be configured to set the max message encoding and
//! decoding size. This ensures an incoming gRPC message will not exhaust the systems
//! memory. By default, the decoding message limit is `4MB` and the encoding limit is `usize::MAX`.
//!
//! ## Rama
//!
//! Learn more about `rama`:
//!
//! - Github: <https://github.com/plabayo/rama>
//! - Book: <https://ramaproxy.org/book/>
//!
//! [gRPC]: https://grpc.io
//! [grpc-web]: https://github.com/grpc/grpc/blob/master/doc/PROTOCOL-WEB.md
//! [`CompressionRegistry`]: codec::CompressionRegistry

#![doc(
    html_favicon_url = "https://raw.githubusercontent.com/plabayo/rama/main/docs/img/old_logo.png"
)]
#![doc(html_logo_url = "https://raw.githubusercontent.com/plabayo/rama/main/docs/img/old_logo.png")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(
    not(test),
    warn(clippy::print_stdout, clippy::dbg_macro),
    deny(clippy::unwrap_used, clippy::expect_used)
)]

pub mod call;
pub mod client;
pub mod codec;
pub mod credentials;
pub mod metadata;
pub mod method;
pub mod metrics;
pub mod server;
pub mod transport;
pub mod web;

mod macros;
mod request;
mod response;
mod status;
mod util;

#[doc(inline)]
pub use call::{Call, CallState};
#[doc(inline)]
pub use client::GrpcClient;
#[doc(inline)]
pub use codec::Streaming;
#[doc(inline)]
pub use method::{MethodDescriptor, MethodKind};
pub use request::{CallOptions, Request};
pub use response::Response;
#[doc(inline)]
pub use server::{GrpcServer, MethodHandler};
pub use status::{Code, ConnectError, Status};
#[doc(inline)]
pub use transport::{GrpcBody, GrpcService, service_fn};
#[doc(inline)]
pub use web::Protocol;

/// Alias for a type-erased error type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// `Result` is a type that represents either success ([`Ok`]) or failure ([`Err`]).
/// By default, the Err value is of type [`Status`] but this can be overridden if desired.
pub type Result<T, E = Status> = std::result::Result<T, E>;
