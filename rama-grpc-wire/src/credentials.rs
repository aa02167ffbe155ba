//! Call credentials: asynchronous units adding metadata to outgoing calls.
//!
//! A unit receives the [`AuthContext`] of the call and a mutable metadata
//! sink. Composed units run one after another, in registration order,
//! against the same sink, so each sees what the previous ones added.
//!
//! ```rust
//! # use rama_grpc_wire::credentials::CallCredentials;
//! # use rama_grpc_wire::metadata::{MetadataKey, MetadataValue};
//! # use rama_grpc_wire::BoxError;
//! let token = CallCredentials::from_fn(|_ctx, mut metadata| async move {
//!     metadata.append(
//!         MetadataKey::from_static("authorization"),
//!         MetadataValue::from_static("Bearer secret"),
//!     )?;
//!     Ok::<_, BoxError>(metadata)
//! });
//! let tenant = CallCredentials::from_fn(|_ctx, mut metadata| async move {
//!     metadata.append(MetadataKey::from_static("x-tenant"), "acme")?;
//!     Ok::<_, BoxError>(metadata)
//! });
//! let composed = CallCredentials::compose([token, tenant]);
//! assert_eq!(composed.len(), 2);
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use crate::metadata::MetadataMap;
use crate::method::MethodDescriptor;
use crate::{BoxError, Status};

/// Transport security of the connection carrying a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SecurityLevel {
    /// No transport security.
    #[default]
    None,
    /// Integrity protected but not encrypted.
    Integrity,
    /// Encrypted and integrity protected, e.g. TLS.
    PrivacyAndIntegrity,
}

/// What a credential unit knows about the call it decorates.
#[derive(Debug, Clone)]
pub struct AuthContext {
    method: MethodDescriptor,
    authority: Option<String>,
    security_level: SecurityLevel,
}

impl AuthContext {
    /// Create a new [`AuthContext`].
    #[must_use]
    pub fn new(
        method: MethodDescriptor,
        authority: Option<String>,
        security_level: SecurityLevel,
    ) -> Self {
        Self {
            method,
            authority,
            security_level,
        }
    }

    /// The method being called.
    #[must_use]
    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    /// The authority (`host[:port]`) of the target.
    #[must_use]
    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    /// Transport security of the connection.
    #[must_use]
    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    /// The service URL, `scheme://authority/service`.
    #[must_use]
    pub fn service_url(&self) -> String {
        let scheme = match self.security_level {
            SecurityLevel::PrivacyAndIntegrity => "https",
            SecurityLevel::None | SecurityLevel::Integrity => "http",
        };
        format!(
            "{scheme}://{}/{}",
            self.authority.as_deref().unwrap_or_default(),
            self.method.service()
        )
    }
}

/// A single credential unit.
pub trait CallCredentialProvider: Send + Sync + 'static {
    /// Add metadata for the call described by `ctx`.
    fn apply<'a>(
        &'a self,
        ctx: &'a AuthContext,
        metadata: &'a mut MetadataMap,
    ) -> BoxFuture<'a, Result<(), BoxError>>;
}

struct FnProvider<F>(F);

impl<F, Fut> CallCredentialProvider for FnProvider<F>
where
    F: Fn(AuthContext, MetadataMap) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<MetadataMap, BoxError>> + Send + 'static,
{
    fn apply<'a>(
        &'a self,
        ctx: &'a AuthContext,
        metadata: &'a mut MetadataMap,
    ) -> BoxFuture<'a, Result<(), BoxError>> {
        let fut = (self.0)(ctx.clone(), std::mem::take(metadata));
        Box::pin(async move {
            *metadata = fut.await?;
            Ok(())
        })
    }
}

/// A flattened, ordered composition of credential units.
#[derive(Clone, Default)]
pub struct CallCredentials {
    units: Arc<[Arc<dyn CallCredentialProvider>]>,
}

impl fmt::Debug for CallCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallCredentials")
            .field("units", &self.units.len())
            .finish()
    }
}

impl CallCredentials {
    /// Credentials made of a single provider.
    pub fn new(provider: impl CallCredentialProvider) -> Self {
        Self {
            units: Arc::from(vec![Arc::new(provider) as Arc<dyn CallCredentialProvider>]),
        }
    }

    /// Credentials from an async function.
    ///
    /// The function receives the metadata collected so far and returns it,
    /// usually with entries added.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(AuthContext, MetadataMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<MetadataMap, BoxError>> + Send + 'static,
    {
        Self::new(FnProvider(f))
    }

    /// Compose credentials left to right, flattening nested compositions.
    pub fn compose(credentials: impl IntoIterator<Item = Self>) -> Self {
        let units: Vec<_> = credentials
            .into_iter()
            .flat_map(|c| c.units.iter().cloned().collect::<Vec<_>>())
            .collect();
        Self {
            units: Arc::from(units),
        }
    }

    /// Compose `self` followed by `other`.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self::compose([self, other])
    }

    /// Number of units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether there are no units.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Run all units in order, merging their metadata into `metadata`.
    ///
    /// Units work on a copy, `metadata` is only updated when all of them
    /// succeed. Any failure is `Unauthenticated`.
    pub async fn apply(&self, ctx: &AuthContext, metadata: &mut MetadataMap) -> Result<(), Status> {
        if self.units.is_empty() {
            return Ok(());
        }

        let mut scratch = metadata.clone();
        for (index, unit) in self.units.iter().enumerate() {
            if let Err(err) = unit.apply(ctx, &mut scratch).await {
                debug!(
                    method = %ctx.method(),
                    unit = index,
                    "call credentials failed: {err}"
                );
                return Err(Status::unauthenticated(format!(
                    "Error starting gRPC call: call credentials failed: {err}"
                )));
            }
        }
        *metadata = scratch;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;
    use crate::metadata::{MetadataKey, MetadataValue};
    use crate::method::MethodKind;
    use std::time::Duration;

    fn ctx() -> AuthContext {
        AuthContext::new(
            MethodDescriptor::new("test.Service", "Call", MethodKind::Unary),
            Some("localhost:50051".to_owned()),
            SecurityLevel::PrivacyAndIntegrity,
        )
    }

    fn append(key: &'static str, value: &'static str, delay: u64) -> CallCredentials {
        CallCredentials::from_fn(move |_ctx, mut metadata| async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            metadata.append(MetadataKey::from_static(key), MetadataValue::from_static(value))?;
            Ok::<_, BoxError>(metadata)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn composed_units_run_in_order() {
        let a = append("authorization", "first", 30);
        let b = append("authorization", "second", 10);
        let c = append("authorization", "third", 0);
        let composed = CallCredentials::compose([a.and(b), c]);
        assert_eq!(composed.len(), 3);

        let mut metadata = MetadataMap::new();
        composed.apply(&ctx(), &mut metadata).await.unwrap();

        let values: Vec<_> = metadata
            .get_all("authorization")
            .filter_map(MetadataValue::to_str)
            .collect();
        assert_eq!(values, ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn later_units_see_earlier_entries() {
        let first = append("x-first", "1", 0);
        let second = CallCredentials::from_fn(|_ctx, mut metadata| async move {
            let seen = if metadata.contains_key("x-first") {
                "yes"
            } else {
                "no"
            };
            metadata.append(MetadataKey::from_static("x-saw-first"), seen)?;
            Ok::<_, BoxError>(metadata)
        });

        let mut metadata = MetadataMap::new();
        first.and(second).apply(&ctx(), &mut metadata).await.unwrap();
        assert_eq!(metadata.get("x-saw-first").unwrap().to_str(), Some("yes"));
    }

    #[tokio::test]
    async fn failure_sends_nothing() {
        let ok = append("x-ok", "1", 0);
        let failing = CallCredentials::from_fn(|_ctx, _metadata| async move {
            Err::<MetadataMap, BoxError>("token expired".into())
        });

        let mut metadata = MetadataMap::new();
        let err = ok
            .and(failing)
            .apply(&ctx(), &mut metadata)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
        assert!(err.message().contains("token expired"));
        assert!(metadata.is_empty());
    }

    #[test]
    fn service_url() {
        assert_eq!(ctx().service_url(), "https://localhost:50051/test.Service");
    }
}
