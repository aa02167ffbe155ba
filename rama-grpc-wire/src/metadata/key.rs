use std::borrow::Borrow;
use std::error::Error;
use std::fmt;
use std::str::FromStr;

use http::HeaderName;

/// Represents a custom metadata field name.
///
/// Names are lowercased on construction, comparisons against strings are
/// case-insensitive. A name ending in `-bin` marks a binary entry.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct MetadataKey {
    inner: HeaderName,
}

/// A possible error when converting a `MetadataKey` from another type.
#[derive(Debug, Default)]
pub struct InvalidMetadataKey {
    _priv: (),
}

impl MetadataKey {
    /// Converts a slice of bytes to a `MetadataKey`.
    ///
    /// This function normalizes the input.
    pub fn from_bytes(src: &[u8]) -> Result<Self, InvalidMetadataKey> {
        let name = HeaderName::from_bytes(src).map_err(|_err| InvalidMetadataKey::new())?;
        if name.as_str() == "-bin" {
            return Err(InvalidMetadataKey::new());
        }
        Ok(Self { inner: name })
    }

    /// Converts a static string to a `MetadataKey`.
    ///
    /// The string must be lowercase and a valid header name.
    #[must_use]
    pub const fn from_static(src: &'static str) -> Self {
        Self {
            inner: HeaderName::from_static(src),
        }
    }

    /// Returns a `str` representation of the metadata key, always lowercase.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.inner.as_str()
    }

    /// Whether values under this key are binary (`-bin` suffix).
    #[must_use]
    pub fn is_binary(&self) -> bool {
        self.as_str().ends_with("-bin")
    }

    pub(crate) fn from_header_name(name: HeaderName) -> Self {
        Self { inner: name }
    }

    pub(crate) fn as_header_name(&self) -> &HeaderName {
        &self.inner
    }
}

impl FromStr for MetadataKey {
    type Err = InvalidMetadataKey;

    fn from_str(s: &str) -> Result<Self, InvalidMetadataKey> {
        Self::from_bytes(s.as_bytes())
    }
}

impl AsRef<str> for MetadataKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Borrow<str> for MetadataKey {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Debug for MetadataKey {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), fmt)
    }
}

impl fmt::Display for MetadataKey {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.as_str(), fmt)
    }
}

impl PartialEq<str> for MetadataKey {
    #[inline]
    fn eq(&self, other: &str) -> bool {
        self.inner.as_str().eq_ignore_ascii_case(other)
    }
}

impl PartialEq<&str> for MetadataKey {
    #[inline]
    fn eq(&self, other: &&str) -> bool {
        *self == **other
    }
}

impl InvalidMetadataKey {
    #[doc(hidden)]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Display for InvalidMetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid gRPC metadata key name")
    }
}

impl Error for InvalidMetadataKey {}

impl From<InvalidMetadataKey> for crate::Status {
    fn from(err: InvalidMetadataKey) -> Self {
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::MetadataKey;

    #[test]
    fn test_from_bytes() {
        assert!(MetadataKey::from_bytes(b"").is_err());
        assert!(MetadataKey::from_bytes(b"\xFF").is_err());
        assert!(MetadataKey::from_bytes(b"-bin").is_err());

        let key = MetadataKey::from_bytes(b"X-Trace-Id").unwrap();
        assert_eq!(key.as_str(), "x-trace-id");
        assert!(!key.is_binary());

        let key = MetadataKey::from_bytes(b"abc-bin").unwrap();
        assert!(key.is_binary());
    }

    #[test]
    fn test_case_insensitive_eq() {
        let key = MetadataKey::from_static("authorization");
        assert_eq!(key, "Authorization");
        assert_eq!(key, "AUTHORIZATION");
    }
}
