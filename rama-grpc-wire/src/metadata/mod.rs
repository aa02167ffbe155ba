//! Custom call metadata and the reserved headers of the gRPC protocol.
//!
//! Metadata is an ordered multimap: keys are ASCII, compared
//! case-insensitively, and may repeat. Keys ending in `-bin` carry binary
//! values which travel base64 encoded.

use http::{HeaderName, HeaderValue};

mod key;
mod map;
mod timeout;
mod value;

#[doc(inline)]
pub use self::{
    key::{InvalidMetadataKey, MetadataKey},
    map::{Iter, MetadataMap},
    value::{InvalidMetadataValue, MetadataValue},
};

pub(crate) use self::timeout::{encode_grpc_timeout, try_parse_grpc_timeout};

/// The default `content-type` of a gRPC message exchange.
pub const GRPC_CONTENT_TYPE: HeaderValue = HeaderValue::from_static("application/grpc");

/// The `grpc-timeout` header.
pub const GRPC_TIMEOUT_HEADER: HeaderName = HeaderName::from_static("grpc-timeout");
/// The `grpc-encoding` header, naming the compression of flagged frames.
pub const GRPC_ENCODING_HEADER: HeaderName = HeaderName::from_static("grpc-encoding");
/// The `grpc-accept-encoding` header, advertising the accepted encodings.
pub const GRPC_ACCEPT_ENCODING_HEADER: HeaderName =
    HeaderName::from_static("grpc-accept-encoding");
/// The `x-grpc-web` marker header sent by grpc-web clients.
pub const X_GRPC_WEB_HEADER: HeaderName = HeaderName::from_static("x-grpc-web");

const RESERVED_HEADERS: &[&str] = &[
    "te",
    "host",
    "connection",
    "transfer-encoding",
    "content-type",
    "content-length",
    "user-agent",
    "accept-encoding",
    "grpc-timeout",
    "grpc-encoding",
    "grpc-accept-encoding",
    "grpc-status",
    "grpc-message",
    "grpc-status-details-bin",
    "x-grpc-web",
];

/// Headers owned by the protocol engine, never carried as custom metadata.
pub(crate) fn is_reserved_header(name: &str) -> bool {
    RESERVED_HEADERS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}
