use std::time::Duration;

use http::Extensions;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::credentials::CallCredentials;
use crate::metadata::MetadataMap;

/// Options of a single call.
///
/// ```rust
/// # use std::time::Duration;
/// # use rama_grpc_wire::CallOptions;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let options = CallOptions::new().with_timeout(Duration::from_secs(5));
/// assert!(options.deadline().is_some());
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    metadata: MetadataMap,
    deadline: Option<Instant>,
    credentials: Option<CallCredentials>,
    cancellation: Option<CancellationToken>,
}

impl CallOptions {
    /// Options without metadata, deadline or credentials.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Outgoing metadata, or the received metadata on the server.
    #[must_use]
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    /// Mutable access to the metadata.
    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }

    /// Absolute deadline of the call.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Per-call credentials, applied after the client's own credentials.
    #[must_use]
    pub fn credentials(&self) -> Option<&CallCredentials> {
        self.credentials.as_ref()
    }

    /// Token cancelling the call when cancelled.
    ///
    /// On the server this token is cancelled once the call terminates.
    #[must_use]
    pub fn cancellation_token(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    crate::macros::generate_set_and_with! {
        /// Replace the metadata.
        pub fn metadata(mut self, metadata: MetadataMap) -> Self {
            self.metadata = metadata;
            self
        }
    }

    crate::macros::generate_set_and_with! {
        /// Set the absolute deadline.
        pub fn deadline(mut self, deadline: Option<Instant>) -> Self {
            self.deadline = deadline;
            self
        }
    }

    crate::macros::generate_set_and_with! {
        /// Set the deadline `timeout` from now.
        pub fn timeout(mut self, timeout: Duration) -> Self {
            self.deadline = Instant::now().checked_add(timeout);
            self
        }
    }

    crate::macros::generate_set_and_with! {
        /// Set per-call credentials.
        pub fn credentials(mut self, credentials: Option<CallCredentials>) -> Self {
            self.credentials = credentials;
            self
        }
    }

    crate::macros::generate_set_and_with! {
        /// Set a token which cancels the call.
        pub fn cancellation_token(mut self, token: Option<CancellationToken>) -> Self {
            self.cancellation = token;
            self
        }
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        MetadataMap,
        Option<Instant>,
        Option<CallCredentials>,
        Option<CancellationToken>,
    ) {
        (
            self.metadata,
            self.deadline,
            self.credentials,
            self.cancellation,
        )
    }
}

/// A gRPC request: a message with its [`CallOptions`] and extensions.
#[derive(Debug)]
pub struct Request<T> {
    options: CallOptions,
    message: T,
    extensions: Extensions,
}

impl<T> Request<T> {
    /// Create a new gRPC request.
    pub fn new(message: T) -> Self {
        Self {
            options: CallOptions::new(),
            message,
            extensions: Extensions::new(),
        }
    }

    /// Create a request from options, message and extensions.
    pub fn from_parts(options: CallOptions, message: T, extensions: Extensions) -> Self {
        Self {
            options,
            message,
            extensions,
        }
    }

    /// Get a reference to the message
    pub fn get_ref(&self) -> &T {
        &self.message
    }

    /// Get a mutable reference to the message
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.message
    }

    /// The call options.
    pub fn options(&self) -> &CallOptions {
        &self.options
    }

    /// Mutable access to the call options.
    pub fn options_mut(&mut self) -> &mut CallOptions {
        &mut self.options
    }

    /// Get a reference to the custom request metadata.
    pub fn metadata(&self) -> &MetadataMap {
        self.options.metadata()
    }

    /// Get a mutable reference to the request metadata.
    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        self.options.metadata_mut()
    }

    /// Get a reference to the extensions.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Get a mutable reference to the extensions.
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Consumes `self`, returning the message
    pub fn into_inner(self) -> T {
        self.message
    }

    /// Consumes `self` returning the parts of the request.
    pub fn into_parts(self) -> (CallOptions, T, Extensions) {
        (self.options, self.message, self.extensions)
    }

    /// Set the deadline `timeout` from now.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.set_timeout(timeout);
        self
    }

    /// Set the deadline `timeout` from now.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.options.set_timeout(timeout);
        self
    }

    /// Map the message, keeping options and extensions.
    pub fn map<F, U>(self, f: F) -> Request<U>
    where
        F: FnOnce(T) -> U,
    {
        Request {
            options: self.options,
            message: f(self.message),
            extensions: self.extensions,
        }
    }
}

impl<T> From<T> for Request<T> {
    fn from(inner: T) -> Self {
        Self::new(inner)
    }
}
