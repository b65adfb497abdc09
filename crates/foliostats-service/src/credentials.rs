use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::fetch::FetchError;
use crate::metric;

/// Credentials for the upstream APIs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    /// The bearer token attached to authenticated requests.
    pub token: String,
    /// The account the token belongs to.
    pub account_id: String,
}

/// Source of fresh [`Credentials`].
///
/// Resolution can be arbitrarily expensive (a token exchange, a keychain
/// lookup), so resolved credentials are reused through [`CachedCredentials`]
/// rather than resolved per request.
pub trait CredentialProvider: Send + Sync {
    fn resolve(&self) -> BoxFuture<'_, Result<Credentials, FetchError>>;
}

/// A provider handing out a fixed token, for deployments where the token is
/// issued out of band.
#[derive(Clone, Debug)]
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            credentials: Credentials {
                token: token.into(),
                account_id: account_id.into(),
            },
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn resolve(&self) -> BoxFuture<'_, Result<Credentials, FetchError>> {
        let credentials = self.credentials.clone();
        Box::pin(async move { Ok(credentials) })
    }
}

/// Caches resolved credentials for a bounded amount of time.
///
/// Tokens stay valid for a while, so requests share one resolved set until
/// it ages out. Concurrent resolutions are coalesced: when several requests
/// miss at the same time, only one hits the underlying provider and the
/// rest wait for its result. [`invalidate`](Self::invalidate) drops the
/// cached set early, e.g. when the upstream rejected the token.
#[derive(Clone)]
pub struct CachedCredentials {
    provider: Arc<dyn CredentialProvider>,
    cache: moka::future::Cache<(), Credentials>,
}

impl CachedCredentials {
    pub fn new(provider: Arc<dyn CredentialProvider>, max_age: Duration) -> Self {
        let cache = moka::future::Cache::builder()
            .max_capacity(1)
            .time_to_live(max_age)
            .build();
        Self { provider, cache }
    }

    /// Returns the cached credentials, resolving fresh ones if needed.
    pub async fn resolve(&self) -> Result<Credentials, FetchError> {
        let provider = self.provider.clone();
        self.cache
            .try_get_with((), async move {
                metric!(counter("credentials.refresh") += 1);
                provider.resolve().await
            })
            .await
            .map_err(|e| (*e).clone())
    }

    /// Drops the cached credentials so the next request resolves fresh ones.
    pub async fn invalidate(&self) {
        self.cache.invalidate(&()).await;
    }
}
