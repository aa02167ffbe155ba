use std::error::Error;
use std::fmt;

use base64::Engine as _;
use bytes::Bytes;
use http::HeaderValue;

/// A metadata value, either printable ASCII or opaque binary.
///
/// Binary values are only valid under a `-bin` key, ASCII values only under
/// a key without that suffix.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum MetadataValue {
    /// Printable ASCII value, sent as is.
    Ascii(HeaderValue),
    /// Binary value, base64 encoded on the wire.
    Binary(Bytes),
}

/// A possible error when converting a `MetadataValue` from another type,
/// or when pairing a value with a key of the other kind.
#[derive(Debug, Default)]
pub struct InvalidMetadataValue {
    _priv: (),
}

impl MetadataValue {
    /// Create an ASCII value from a static string.
    ///
    /// The string must be printable ASCII.
    #[must_use]
    pub const fn from_static(src: &'static str) -> Self {
        Self::Ascii(HeaderValue::from_static(src))
    }

    /// Try to create an ASCII value.
    pub fn try_from_ascii(src: &str) -> Result<Self, InvalidMetadataValue> {
        if !src.bytes().all(|b| (0x20..0x7f).contains(&b)) {
            return Err(InvalidMetadataValue::new());
        }
        HeaderValue::from_str(src)
            .map(Self::Ascii)
            .map_err(|_err| InvalidMetadataValue::new())
    }

    /// Create a binary value.
    pub fn from_binary(src: impl Into<Bytes>) -> Self {
        Self::Binary(src.into())
    }

    /// Whether this is a binary value.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// The raw bytes of the value, decoded for binary values.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Ascii(value) => value.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    /// The value as a string, `None` for binary values.
    #[must_use]
    pub fn to_str(&self) -> Option<&str> {
        match self {
            Self::Ascii(value) => value.to_str().ok(),
            Self::Binary(_) => None,
        }
    }

    pub(crate) fn to_header_value(&self) -> Result<HeaderValue, InvalidMetadataValue> {
        match self {
            Self::Ascii(value) => Ok(value.clone()),
            Self::Binary(bytes) => {
                let encoded = crate::util::base64::STANDARD_NO_PAD.encode(bytes);
                HeaderValue::from_maybe_shared(encoded)
                    .map_err(|_err| InvalidMetadataValue::new())
            }
        }
    }

    pub(crate) fn from_header_value(value: &HeaderValue, binary: bool) -> Option<Self> {
        if binary {
            crate::util::base64::STANDARD
                .decode(value.as_bytes())
                .ok()
                .map(Self::from_binary)
        } else {
            Some(Self::Ascii(value.clone()))
        }
    }
}

impl fmt::Debug for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ascii(value) => fmt::Debug::fmt(value, f),
            Self::Binary(bytes) => fmt::Debug::fmt(bytes, f),
        }
    }
}

impl From<&'static str> for MetadataValue {
    fn from(src: &'static str) -> Self {
        Self::from_static(src)
    }
}

impl From<Bytes> for MetadataValue {
    fn from(src: Bytes) -> Self {
        Self::Binary(src)
    }
}

impl InvalidMetadataValue {
    #[doc(hidden)]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Display for InvalidMetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid gRPC metadata value")
    }
}

impl Error for InvalidMetadataValue {}

impl From<InvalidMetadataValue> for crate::Status {
    fn from(err: InvalidMetadataValue) -> Self {
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_rejects_control_chars() {
        assert!(MetadataValue::try_from_ascii("hello world").is_ok());
        assert!(MetadataValue::try_from_ascii("bad\nvalue").is_err());
        assert!(MetadataValue::try_from_ascii("caf\u{e9}").is_err());
    }

    #[test]
    fn binary_header_value_is_unpadded_base64() {
        let value = MetadataValue::from_binary(&b"\x00\x01\x02\x03"[..]);
        assert_eq!(value.to_header_value().unwrap(), "AAECAw");

        let decoded =
            MetadataValue::from_header_value(&HeaderValue::from_static("AAECAw=="), true).unwrap();
        assert_eq!(decoded.as_bytes(), b"\x00\x01\x02\x03");
    }
}
