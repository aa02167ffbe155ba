use std::borrow::Cow;
use std::fmt;

/// The shape of a gRPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    /// One request message, one response message.
    Unary,
    /// A stream of request messages, one response message.
    ClientStreaming,
    /// One request message, a stream of response messages.
    ServerStreaming,
    /// Independent request and response streams.
    DuplexStreaming,
}

impl MethodKind {
    /// Whether the client sends more than one message.
    #[must_use]
    pub fn client_streams(self) -> bool {
        matches!(self, Self::ClientStreaming | Self::DuplexStreaming)
    }

    /// Whether the server sends more than one message.
    #[must_use]
    pub fn server_streams(self) -> bool {
        matches!(self, Self::ServerStreaming | Self::DuplexStreaming)
    }
}

/// Describes a method: the service it belongs to, its name and its shape.
///
/// The request path is `/{service}/{method}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    service: Cow<'static, str>,
    name: Cow<'static, str>,
    kind: MethodKind,
}

impl MethodDescriptor {
    /// Create a new [`MethodDescriptor`].
    pub fn new(
        service: impl Into<Cow<'static, str>>,
        name: impl Into<Cow<'static, str>>,
        kind: MethodKind,
    ) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
            kind,
        }
    }

    /// Fully qualified service name, e.g. `helloworld.Greeter`.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Method name, e.g. `SayHello`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shape of the method.
    #[must_use]
    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    /// Request path of the method.
    #[must_use]
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.name)
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.service, self.name)
    }
}

/// Split a request path into its service and method names.
///
/// Returns `None` unless the path is exactly `/{service}/{method}` with
/// both parts non-empty.
pub(crate) fn split_path(path: &str) -> Option<(&str, &str)> {
    let (service, method) = path.strip_prefix('/')?.split_once('/')?;
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some((service, method))
}
