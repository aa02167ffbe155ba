//! grpc-web support.
//!
//! grpc-web reuses the gRPC frame format over HTTP/1.1 compatible
//! transports. Trailers travel in-band as a final frame flagged with `0x80`,
//! and the `grpc-web-text` variant base64 encodes the whole body.

use http::HeaderValue;

mod base64;
mod encoder;
mod trailers;

#[doc(inline)]
pub use self::{
    base64::{Base64Reader, TranscodeError},
    encoder::{Base64EncodeBody, Base64Encoder},
    trailers::{decode_trailers, encode_trailers},
};

pub(crate) mod content_types {
    pub(crate) const GRPC: &str = "application/grpc";
    pub(crate) const GRPC_WEB: &str = "application/grpc-web";
    pub(crate) const GRPC_WEB_PROTO: &str = "application/grpc-web+proto";
    pub(crate) const GRPC_WEB_TEXT: &str = "application/grpc-web-text";
    pub(crate) const GRPC_WEB_TEXT_PROTO: &str = "application/grpc-web-text+proto";
}

/// The wire protocol variant of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    /// Plain gRPC over HTTP/2, trailers as HTTP trailers.
    #[default]
    Grpc,
    /// grpc-web with a binary body.
    GrpcWeb,
    /// grpc-web with a base64 encoded body.
    GrpcWebText,
}

impl Protocol {
    /// Detect the protocol from a `content-type` value.
    ///
    /// Accepts `application/grpc`, `application/grpc-web` and
    /// `application/grpc-web-text`, each optionally followed by a `+format`
    /// suffix and parameters.
    #[must_use]
    pub fn from_content_type(value: &HeaderValue) -> Option<Self> {
        let value = value.to_str().ok()?;
        let mime = value.split(';').next().unwrap_or_default().trim();
        let essence = mime.split('+').next().unwrap_or_default();

        if essence.eq_ignore_ascii_case(content_types::GRPC) {
            Some(Self::Grpc)
        } else if essence.eq_ignore_ascii_case(content_types::GRPC_WEB) {
            Some(Self::GrpcWeb)
        } else if essence.eq_ignore_ascii_case(content_types::GRPC_WEB_TEXT) {
            Some(Self::GrpcWebText)
        } else {
            None
        }
    }

    /// The `content-type` sent for this protocol.
    #[must_use]
    pub fn content_type(self) -> HeaderValue {
        match self {
            Self::Grpc => crate::metadata::GRPC_CONTENT_TYPE,
            Self::GrpcWeb => HeaderValue::from_static(content_types::GRPC_WEB_PROTO),
            Self::GrpcWebText => HeaderValue::from_static(content_types::GRPC_WEB_TEXT_PROTO),
        }
    }

    /// Whether trailers travel in-band.
    #[must_use]
    pub fn is_web(self) -> bool {
        matches!(self, Self::GrpcWeb | Self::GrpcWebText)
    }

    /// Whether the body is base64 encoded.
    #[must_use]
    pub fn is_text(self) -> bool {
        matches!(self, Self::GrpcWebText)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_detection() {
        for (raw, expected) in [
            ("application/grpc", Some(Protocol::Grpc)),
            ("application/grpc+proto", Some(Protocol::Grpc)),
            ("Application/GRPC; charset=utf-8", Some(Protocol::Grpc)),
            ("application/grpc-web", Some(Protocol::GrpcWeb)),
            ("application/grpc-web+json", Some(Protocol::GrpcWeb)),
            ("application/grpc-web-text", Some(Protocol::GrpcWebText)),
            ("application/grpc-web-text+proto", Some(Protocol::GrpcWebText)),
            ("application/grpcx", None),
            ("application/json", None),
            ("", None),
        ] {
            assert_eq!(
                Protocol::from_content_type(&HeaderValue::from_static(raw)),
                expected,
                "content-type {raw:?}"
            );
        }
    }

    #[test]
    fn content_type_roundtrip() {
        for protocol in [Protocol::Grpc, Protocol::GrpcWeb, Protocol::GrpcWebText] {
            assert_eq!(
                Protocol::from_content_type(&protocol.content_type()),
                Some(protocol)
            );
        }
    }
}
