use std::{borrow::Cow, error::Error, fmt, sync::Arc};

use base64::Engine as _;
use bytes::Bytes;
use http::{
    HeaderName, StatusCode,
    header::{HeaderMap, HeaderValue},
};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode, percent_encode};
use tracing::{debug, trace, warn};

use crate::BoxError;
use crate::metadata::MetadataMap;

const ENCODING_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'?')
    .add(b'{')
    .add(b'}');

/// A gRPC status describing the result of an RPC call.
///
/// A `Status` is both the terminal outcome of every call and the error type
/// of every fallible operation in this crate.
///
/// ```rust
/// # use rama_grpc_wire::{Status, Code};
/// let status = Status::invalid_argument("name is invalid");
/// assert_eq!(status.code(), Code::InvalidArgument);
/// ```
#[derive(Clone)]
pub struct Status(Box<StatusInner>);

#[derive(Clone)]
struct StatusInner {
    code: Code,
    /// Found in the `grpc-message` trailer.
    message: Arc<str>,
    /// Found in the `grpc-status-details-bin` trailer.
    details: Bytes,
    /// Custom trailer metadata, reserved names are never carried here.
    metadata: MetadataMap,
    source: Option<Arc<dyn Error + Send + Sync + 'static>>,
}

/// gRPC status codes used by [`Status`].
///
/// These variants match the [gRPC status codes] and are transmitted as their
/// numeric ordinal.
///
/// [gRPC status codes]: https://github.com/grpc/grpc/blob/master/doc/statuscodes.md#status-codes-and-their-use-in-grpc
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    /// The operation completed successfully.
    Ok = 0,
    /// The operation was cancelled.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// Client specified an invalid argument.
    InvalidArgument = 3,
    /// Deadline expired before operation could complete.
    DeadlineExceeded = 4,
    /// Some requested entity was not found.
    NotFound = 5,
    /// Some entity that we attempted to create already exists.
    AlreadyExists = 6,
    /// The caller does not have permission to execute the specified operation.
    PermissionDenied = 7,
    /// Some resource has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation's execution.
    FailedPrecondition = 9,
    /// The operation was aborted.
    Aborted = 10,
    /// Operation was attempted past the valid range.
    OutOfRange = 11,
    /// Operation is not implemented or not supported.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// The request does not have valid authentication credentials.
    Unauthenticated = 16,
}

impl Code {
    /// Get the human readable description of this `Code`.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Ok => "The operation completed successfully",
            Self::Cancelled => "The operation was cancelled",
            Self::Unknown => "Unknown error",
            Self::InvalidArgument => "Client specified an invalid argument",
            Self::DeadlineExceeded => "Deadline expired before operation could complete",
            Self::NotFound => "Some requested entity was not found",
            Self::AlreadyExists => "Some entity that we attempted to create already exists",
            Self::PermissionDenied => {
                "The caller does not have permission to execute the specified operation"
            }
            Self::ResourceExhausted => "Some resource has been exhausted",
            Self::FailedPrecondition => {
                "The system is not in a state required for the operation's execution"
            }
            Self::Aborted => "The operation was aborted",
            Self::OutOfRange => "Operation was attempted past the valid range",
            Self::Unimplemented => "Operation is not implemented or not supported",
            Self::Internal => "Internal error",
            Self::Unavailable => "The service is currently unavailable",
            Self::DataLoss => "Unrecoverable data loss or corruption",
            Self::Unauthenticated => "The request does not have valid authentication credentials",
        }
    }

    /// Get the `Code` that represents the integer, `Code::Unknown` if not known.
    #[must_use]
    pub const fn from_i32(i: i32) -> Self {
        match i {
            0 => Self::Ok,
            1 => Self::Cancelled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    /// Parse the ASCII decimal representation found in a `grpc-status`
    /// header. Anything that is not a known ordinal maps to `Code::Unknown`.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let parsed = std::str::from_utf8(bytes)
            .ok()
            .filter(|s| (1..=2).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse::<i32>().ok());
        match parsed {
            Some(i) => Self::from_i32(i),
            None => {
                trace!("error parsing grpc-status");
                Self::Unknown
            }
        }
    }

    fn to_header_value(self) -> HeaderValue {
        HeaderValue::from(self as i32)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.description(), f)
    }
}

impl From<i32> for Code {
    fn from(i: i32) -> Self {
        Self::from_i32(i)
    }
}

impl From<Code> for i32 {
    #[inline]
    fn from(code: Code) -> Self {
        code as Self
    }
}

// ===== impl Status =====

macro_rules! status_constructors {
    ($($(#[$doc:meta])* $name:ident => $code:ident,)+) => {
        $(
            $(#[$doc])*
            pub fn $name(message: impl Into<Arc<str>>) -> Self {
                Self::new(Code::$code, message)
            }
        )+
    };
}

impl Status {
    /// Create a new `Status` with the associated code and message.
    pub fn new(code: Code, message: impl Into<Arc<str>>) -> Self {
        Self::with_details_and_metadata(code, message, Bytes::new(), MetadataMap::new())
    }

    status_constructors! {
        /// The operation completed successfully.
        ok => Ok,
        /// The operation was cancelled, typically by the caller.
        cancelled => Cancelled,
        /// Unknown error, usually an error from another error-space.
        unknown => Unknown,
        /// Client specified an argument that is invalid regardless of system state.
        invalid_argument => InvalidArgument,
        /// Deadline expired before the operation could complete.
        deadline_exceeded => DeadlineExceeded,
        /// Some requested entity was not found.
        not_found => NotFound,
        /// Some entity that we attempted to create already exists.
        already_exists => AlreadyExists,
        /// The caller does not have permission to execute the operation.
        permission_denied => PermissionDenied,
        /// Some resource has been exhausted, such as a message size limit.
        resource_exhausted => ResourceExhausted,
        /// The system is not in a state required for the operation.
        failed_precondition => FailedPrecondition,
        /// The operation was aborted, typically due to a concurrency issue.
        aborted => Aborted,
        /// Operation was attempted past the valid range.
        out_of_range => OutOfRange,
        /// Operation is not implemented or not supported.
        unimplemented => Unimplemented,
        /// Invariants expected by the underlying system have been broken.
        internal => Internal,
        /// The service is currently unavailable, most likely transient.
        unavailable => Unavailable,
        /// Unrecoverable data loss or corruption.
        data_loss => DataLoss,
        /// The request does not have valid authentication credentials.
        unauthenticated => Unauthenticated,
    }

    /// Create a new `Status` with the associated code, message, and binary details field.
    pub fn with_details(code: Code, message: impl Into<Arc<str>>, details: Bytes) -> Self {
        Self::with_details_and_metadata(code, message, details, MetadataMap::new())
    }

    /// Create a new `Status` with the associated code, message, and custom metadata.
    pub fn with_metadata(code: Code, message: impl Into<Arc<str>>, metadata: MetadataMap) -> Self {
        Self::with_details_and_metadata(code, message, Bytes::new(), metadata)
    }

    /// Create a new `Status` with code, message, binary details and custom metadata.
    pub fn with_details_and_metadata(
        code: Code,
        message: impl Into<Arc<str>>,
        details: Bytes,
        metadata: MetadataMap,
    ) -> Self {
        Self(Box::new(StatusInner {
            code,
            message: message.into(),
            details,
            metadata,
            source: None,
        }))
    }

    pub(crate) fn from_error_generic(err: impl Into<BoxError>) -> Self {
        Self::from_error(err.into())
    }

    /// Create a `Status` from an erased error.
    ///
    /// The source chain is inspected for an embedded [`Status`] or
    /// [`ConnectError`], anything else becomes `Code::Unknown`.
    #[must_use]
    pub fn from_error(err: BoxError) -> Self {
        let err = match err.downcast::<Self>() {
            Ok(status) => return *status,
            Err(err) => err,
        };

        let mut status = find_status_in_source_chain(&*err)
            .unwrap_or_else(|| Self::new(Code::Unknown, err.to_string()));
        status.0.source = Some(err.into());
        status
    }

    /// Extract a [`Status`] from a [`HeaderMap`], `None` if it has no `grpc-status`.
    #[must_use]
    pub fn from_header_map(header_map: &HeaderMap) -> Option<Self> {
        let code = Code::from_bytes(header_map.get(Self::GRPC_STATUS)?.as_bytes());

        let message = match header_map.get(Self::GRPC_MESSAGE) {
            Some(header) => percent_decode(header.as_bytes())
                .decode_utf8()
                .map(|cow| Arc::<str>::from(cow.as_ref())),
            None => Ok(Arc::from("")),
        };

        let details = match header_map.get(Self::GRPC_STATUS_DETAILS) {
            Some(header) => match crate::util::base64::STANDARD.decode(header.as_bytes()) {
                Ok(v) => v.into(),
                Err(err) => {
                    debug!("failed to b64 decode grpc status details: {err}");
                    Bytes::new()
                }
            },
            None => Bytes::new(),
        };

        let (code, message) = match message {
            Ok(message) => (code, message),
            Err(err) => {
                let message = format!("Error deserializing status message header: {err}");
                warn!("{message}");
                (Code::Unknown, message.into())
            }
        };

        Some(Self::with_details_and_metadata(
            code,
            message,
            details,
            MetadataMap::from_headers(header_map.clone()),
        ))
    }

    /// Get the gRPC `Code` of this `Status`.
    #[must_use]
    pub fn code(&self) -> Code {
        self.0.code
    }

    /// Get the text error message of this `Status`.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.0.message
    }

    /// Get the opaque error details of this `Status`.
    #[must_use]
    pub fn details(&self) -> &[u8] {
        &self.0.details
    }

    /// Get a reference to the custom metadata.
    #[must_use]
    pub fn metadata(&self) -> &MetadataMap {
        &self.0.metadata
    }

    /// Get a mutable reference to the custom metadata.
    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.0.metadata
    }

    /// Add a source error to this status.
    pub fn set_source(&mut self, source: Arc<dyn Error + Send + Sync + 'static>) -> &mut Self {
        self.0.source = Some(source);
        self
    }

    pub(crate) fn to_header_map(&self) -> Result<HeaderMap, Self> {
        let mut header_map = HeaderMap::with_capacity(3 + self.0.metadata.len());
        self.add_header(&mut header_map)?;
        Ok(header_map)
    }

    /// Add the trailers describing this `Status` into `header_map`.
    pub fn add_header(&self, header_map: &mut HeaderMap) -> Result<(), Self> {
        header_map.extend(self.0.metadata.clone().into_sanitized_headers());

        header_map.insert(Self::GRPC_STATUS, self.0.code.to_header_value());

        if !self.0.message.is_empty() {
            let to_write = Bytes::copy_from_slice(
                Cow::from(percent_encode(self.message().as_bytes(), ENCODING_SET)).as_bytes(),
            );
            header_map.insert(
                Self::GRPC_MESSAGE,
                HeaderValue::from_maybe_shared(to_write).map_err(invalid_header_value_byte)?,
            );
        }

        if !self.0.details.is_empty() {
            let details = crate::util::base64::STANDARD_NO_PAD.encode(&self.0.details[..]);
            header_map.insert(
                Self::GRPC_STATUS_DETAILS,
                HeaderValue::from_maybe_shared(details).map_err(invalid_header_value_byte)?,
            );
        }

        Ok(())
    }

    #[doc(hidden)]
    pub const GRPC_STATUS: HeaderName = HeaderName::from_static("grpc-status");
    #[doc(hidden)]
    pub const GRPC_MESSAGE: HeaderName = HeaderName::from_static("grpc-message");
    #[doc(hidden)]
    pub const GRPC_STATUS_DETAILS: HeaderName = HeaderName::from_static("grpc-status-details-bin");
}

fn find_status_in_source_chain(err: &(dyn Error + 'static)) -> Option<Status> {
    let mut source = Some(err);

    while let Some(err) = source {
        if let Some(status) = err.downcast_ref::<Status>() {
            let mut status = status.clone();
            status.0.source = None;
            return Some(status);
        }

        // A failure to reach the peer is transient from the caller's point of view.
        if let Some(connect) = err.downcast_ref::<ConnectError>() {
            return Some(Status::unavailable(connect.to_string()));
        }

        source = err.source();
    }

    None
}

fn invalid_header_value_byte<E: fmt::Display>(err: E) -> Status {
    debug!("Invalid header: {err}");
    Status::internal("Couldn't serialize non-text grpc status header")
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Status");

        builder.field("code", &self.0.code);
        if !self.0.message.is_empty() {
            builder.field("message", &self.0.message);
        }
        if !self.0.details.is_empty() {
            builder.field("details", &self.0.details);
        }
        if !self.0.metadata.is_empty() {
            builder.field("metadata", &self.0.metadata);
        }
        builder.field("source", &self.0.source);

        builder.finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code: '{}'", self.code())?;
        if !self.message().is_empty() {
            write!(f, ", message: {:?}", self.message())?;
        }
        if !self.metadata().is_empty() {
            write!(f, ", metadata: {:?}", self.metadata())?;
        }
        if let Some(source) = self.source() {
            write!(f, ", source: {source:?}")?;
        }
        Ok(())
    }
}

impl Error for Status {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.0.source.as_ref().map(|err| (&**err) as _)
    }
}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let code = match err.kind() {
            ErrorKind::BrokenPipe
            | ErrorKind::WouldBlock
            | ErrorKind::WriteZero
            | ErrorKind::Interrupted => Code::Internal,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::NotConnected
            | ErrorKind::AddrInUse
            | ErrorKind::AddrNotAvailable => Code::Unavailable,
            ErrorKind::AlreadyExists => Code::AlreadyExists,
            ErrorKind::ConnectionAborted => Code::Aborted,
            ErrorKind::InvalidData => Code::DataLoss,
            ErrorKind::InvalidInput => Code::InvalidArgument,
            ErrorKind::NotFound => Code::NotFound,
            ErrorKind::PermissionDenied => Code::PermissionDenied,
            ErrorKind::TimedOut => Code::DeadlineExceeded,
            ErrorKind::UnexpectedEof => Code::OutOfRange,
            _ => Code::Unknown,
        };
        Self::new(code, err.to_string())
    }
}

/// Take the `Status` from `trailers` if available, else infer it from the
/// HTTP `status_code` following the [http to grpc status mapping].
///
/// Returns `Ok(())` for an explicit `grpc-status: 0`.
///
/// [http to grpc status mapping]: https://github.com/grpc/grpc/blob/master/doc/http-grpc-status-mapping.md
pub(crate) fn infer_grpc_status(
    trailers: Option<&HeaderMap>,
    status_code: StatusCode,
) -> Result<(), Status> {
    if let Some(status) = trailers.and_then(Status::from_header_map) {
        return if status.code() == Code::Ok {
            Ok(())
        } else {
            Err(status)
        };
    }
    trace!("trailers missing grpc-status");

    let code = match status_code {
        StatusCode::BAD_REQUEST => Code::Internal,
        StatusCode::UNAUTHORIZED => Code::Unauthenticated,
        StatusCode::FORBIDDEN => Code::PermissionDenied,
        StatusCode::NOT_FOUND => Code::Unimplemented,
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => Code::Unavailable,
        // the peer answered but never sent trailers, the stream end alone proves nothing
        StatusCode::OK => {
            return Err(Status::internal(
                "response stream ended without grpc-status trailers",
            ));
        }
        _ => Code::Unknown,
    };

    Err(Status::new(
        code,
        format!(
            "grpc-status header missing, mapped from HTTP status code {}",
            status_code.as_u16(),
        ),
    ))
}

/// Wrapper type to indicate that an error occurs during the connection
/// process, so that the appropriate gRPC Status can be inferred.
#[derive(Debug)]
pub struct ConnectError(pub BoxError);

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Error for ConnectError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.0.as_ref())
    }
}
