//! Compression providers and the negotiation contract.
//!
//! A registry holds providers by their negotiation name. Names are unique,
//! case-sensitive and looked up exactly. The registry is immutable once
//! built and shared by reference between calls.

use std::error::Error;
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use http::HeaderValue;
use tracing::trace;

use crate::Status;

/// The encoding name meaning "no compression".
pub const IDENTITY: &str = "identity";

/// A bidirectional payload transform selected by its negotiation name.
pub trait CompressionProvider: Send + Sync + 'static {
    /// The name used in `grpc-encoding` and `grpc-accept-encoding`.
    fn encoding_name(&self) -> &str;

    /// Compress `src`, appending the output to `dst`.
    fn compress(&self, src: &[u8], dst: &mut BytesMut) -> io::Result<()>;

    /// A reader yielding the decompressed form of `src`.
    fn decompressor<'a>(&self, src: &'a [u8]) -> io::Result<Box<dyn Read + 'a>>;
}

/// A provider name was registered twice.
#[derive(Debug, Clone)]
pub struct DuplicateEncoding {
    name: String,
}

impl DuplicateEncoding {
    /// The duplicated encoding name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for DuplicateEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "duplicate compression encoding '{}'", self.name)
    }
}

impl Error for DuplicateEncoding {}

/// An immutable, ordered set of compression providers.
#[derive(Clone)]
pub struct CompressionRegistry {
    providers: Arc<[Arc<dyn CompressionProvider>]>,
}

impl fmt::Debug for CompressionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl Default for CompressionRegistry {
    /// All built-in providers when the `compression` feature is enabled.
    fn default() -> Self {
        #[cfg(feature = "compression")]
        {
            Self {
                providers: Arc::from(vec![
                    Arc::new(Gzip::default()) as Arc<dyn CompressionProvider>,
                    Arc::new(Deflate::default()),
                    Arc::new(Zstd::default()),
                ]),
            }
        }
        #[cfg(not(feature = "compression"))]
        {
            Self::empty()
        }
    }
}

impl CompressionRegistry {
    /// A registry without providers.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            providers: Arc::from(Vec::new()),
        }
    }

    /// Start building a registry.
    #[must_use]
    pub fn builder() -> CompressionRegistryBuilder {
        CompressionRegistryBuilder::default()
    }

    /// Exact lookup by encoding name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn CompressionProvider>> {
        self.providers.iter().find(|p| p.encoding_name() == name)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.encoding_name())
    }

    /// Whether no provider is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// The `grpc-accept-encoding` value advertising every provider.
    #[must_use]
    pub fn accept_encoding_header(&self) -> Option<HeaderValue> {
        if self.is_empty() {
            return None;
        }
        let value = self.names().collect::<Vec<_>>().join(",");
        HeaderValue::try_from(value).ok()
    }
}

/// Builder for a [`CompressionRegistry`].
#[derive(Default)]
pub struct CompressionRegistryBuilder {
    providers: Vec<Arc<dyn CompressionProvider>>,
}

impl fmt::Debug for CompressionRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.providers.iter().map(|p| p.encoding_name()))
            .finish()
    }
}

impl CompressionRegistryBuilder {
    /// Register a provider.
    #[must_use]
    pub fn with_provider(mut self, provider: impl CompressionProvider) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Register a provider.
    pub fn add_provider(&mut self, provider: impl CompressionProvider) -> &mut Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Build the registry, rejecting duplicate (or `identity`) names.
    pub fn build(self) -> Result<CompressionRegistry, DuplicateEncoding> {
        for (index, provider) in self.providers.iter().enumerate() {
            let name = provider.encoding_name();
            let duplicate = name == IDENTITY
                || self.providers[..index]
                    .iter()
                    .any(|p| p.encoding_name() == name);
            if duplicate {
                return Err(DuplicateEncoding {
                    name: name.to_owned(),
                });
            }
        }
        Ok(CompressionRegistry {
            providers: Arc::from(self.providers),
        })
    }
}

/// Parse a `grpc-accept-encoding` value into its names.
pub(crate) fn parse_accept_encoding(value: &HeaderValue) -> Vec<String> {
    value
        .to_str()
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// Compress a payload with `provider`.
pub(crate) fn compress(provider: &dyn CompressionProvider, src: &[u8]) -> Result<BytesMut, Status> {
    let mut dst = BytesMut::with_capacity(src.len() / 2 + 64);
    provider.compress(src, &mut dst).map_err(|err| {
        Status::internal(format!(
            "Error compressing message with {}: {err}",
            provider.encoding_name()
        ))
    })?;
    trace!(
        encoding = provider.encoding_name(),
        from = src.len(),
        to = dst.len(),
        "compressed message"
    );
    Ok(dst)
}

/// Decompress a payload, failing with `ResourceExhausted` past `max_size`.
pub(crate) fn decompress(
    provider: &dyn CompressionProvider,
    src: &[u8],
    max_size: usize,
) -> Result<Bytes, Status> {
    let error = |err: io::Error| {
        Status::internal(format!(
            "Error decompressing message with {}: {err}",
            provider.encoding_name()
        ))
    };

    let reader = provider.decompressor(src).map_err(error)?;
    let limit = u64::try_from(max_size).unwrap_or(u64::MAX).saturating_add(1);
    let mut writer = BytesMut::with_capacity(src.len().min(max_size)).writer();
    io::copy(&mut reader.take(limit), &mut writer).map_err(error)?;
    let out = writer.into_inner();

    if out.len() > max_size {
        return Err(Status::resource_exhausted(format!(
            "Error, decompressed message too large: exceeds the limit of {max_size} bytes"
        )));
    }
    Ok(out.freeze())
}

#[cfg(feature = "compression")]
pub use self::builtin::{Deflate, Gzip, Zstd};

#[cfg(feature = "compression")]
mod builtin {
    use std::io::{self, Read, Write};

    use bytes::{BufMut, BytesMut};
    use flate2::Compression;

    use super::CompressionProvider;

    /// `gzip` compression.
    #[derive(Debug, Clone, Copy)]
    pub struct Gzip {
        level: Compression,
    }

    impl Default for Gzip {
        fn default() -> Self {
            Self {
                level: Compression::new(6),
            }
        }
    }

    impl Gzip {
        crate::macros::generate_set_and_with! {
            /// Compression level, 0 (none) to 9 (best).
            pub fn level(mut self, level: u32) -> Self {
                self.level = Compression::new(level.min(9));
                self
            }
        }
    }

    impl CompressionProvider for Gzip {
        fn encoding_name(&self) -> &str {
            "gzip"
        }

        fn compress(&self, src: &[u8], dst: &mut BytesMut) -> io::Result<()> {
            let mut encoder = flate2::write::GzEncoder::new(dst.writer(), self.level);
            encoder.write_all(src)?;
            encoder.finish()?;
            Ok(())
        }

        fn decompressor<'a>(&self, src: &'a [u8]) -> io::Result<Box<dyn Read + 'a>> {
            Ok(Box::new(flate2::read::GzDecoder::new(src)))
        }
    }

    /// `deflate` compression, zlib framed.
    #[derive(Debug, Clone, Copy)]
    pub struct Deflate {
        level: Compression,
    }

    impl Default for Deflate {
        fn default() -> Self {
            Self {
                level: Compression::new(6),
            }
        }
    }

    impl Deflate {
        crate::macros::generate_set_and_with! {
            /// Compression level, 0 (none) to 9 (best).
            pub fn level(mut self, level: u32) -> Self {
                self.level = Compression::new(level.min(9));
                self
            }
        }
    }

    impl CompressionProvider for Deflate {
        fn encoding_name(&self) -> &str {
            "deflate"
        }

        fn compress(&self, src: &[u8], dst: &mut BytesMut) -> io::Result<()> {
            let mut encoder = flate2::write::ZlibEncoder::new(dst.writer(), self.level);
            encoder.write_all(src)?;
            encoder.finish()?;
            Ok(())
        }

        fn decompressor<'a>(&self, src: &'a [u8]) -> io::Result<Box<dyn Read + 'a>> {
            Ok(Box::new(flate2::read::ZlibDecoder::new(src)))
        }
    }

    /// `zstd` compression.
    #[derive(Debug, Clone, Copy)]
    pub struct Zstd {
        level: i32,
    }

    impl Default for Zstd {
        fn default() -> Self {
            Self {
                level: zstd::DEFAULT_COMPRESSION_LEVEL,
            }
        }
    }

    impl Zstd {
        crate::macros::generate_set_and_with! {
            /// Compression level, see `zstd::compression_level_range`.
            pub fn level(mut self, level: i32) -> Self {
                self.level = level;
                self
            }
        }
    }

    impl CompressionProvider for Zstd {
        fn encoding_name(&self) -> &str {
            "zstd"
        }

        fn compress(&self, src: &[u8], dst: &mut BytesMut) -> io::Result<()> {
            let mut encoder = zstd::stream::write::Encoder::new(dst.writer(), self.level)?;
            encoder.write_all(src)?;
            encoder.finish()?;
            Ok(())
        }

        fn decompressor<'a>(&self, src: &'a [u8]) -> io::Result<Box<dyn Read + 'a>> {
            Ok(Box::new(zstd::stream::read::Decoder::new(src)?))
        }
    }
}

#[cfg(all(test, feature = "compression"))]
mod tests {
    use super::*;
    use crate::Code;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn decompress_compress_roundtrip(payload: Vec<u8>) -> bool {
        let registry = CompressionRegistry::default();
        registry.names().all(|name| {
            let provider = registry.get(name).unwrap();
            let compressed = compress(provider.as_ref(), &payload).unwrap();
            let decompressed = decompress(provider.as_ref(), &compressed, usize::MAX).unwrap();
            decompressed == payload
        })
    }

    #[test]
    fn lookups_are_exact() {
        let registry = CompressionRegistry::default();
        assert!(registry.get("gzip").is_some());
        assert!(registry.get("GZIP").is_none());
        assert!(registry.get(" gzip").is_none());
        assert!(registry.get("identity").is_none());
        assert_eq!(
            registry.accept_encoding_header().unwrap(),
            "gzip,deflate,zstd"
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = CompressionRegistry::builder()
            .with_provider(Gzip::default())
            .with_provider(Deflate::default())
            .with_provider(Gzip::default().with_level(9))
            .build()
            .unwrap_err();
        assert_eq!(err.name(), "gzip");

        let registry = CompressionRegistry::builder()
            .with_provider(Zstd::default())
            .build()
            .unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), ["zstd"]);
    }

    #[test]
    fn decompression_is_bounded() {
        let provider = Gzip::default();
        let compressed = compress(&provider, &[0u8; 64 * 1024]).unwrap();
        assert!(compressed.len() < 1024);
        let err = decompress(&provider, &compressed, 1024).unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        assert_eq!(
            decompress(&provider, &compressed, 64 * 1024).unwrap().len(),
            64 * 1024
        );
    }

    #[test]
    fn accept_encoding_parsing() {
        let names = parse_accept_encoding(&HeaderValue::from_static("gzip, zstd ,,identity"));
        assert_eq!(names, ["gzip", "zstd", "identity"]);
    }
}
