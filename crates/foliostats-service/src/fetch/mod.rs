//! Executing requests against the upstream APIs.
//!
//! [`FetchService`] is the one place all outbound traffic goes through. It
//! owns the HTTP client, the [`RequestQueue`] that schedules and retries
//! requests, the persistent response cache, and the credential cache.
//!
//! The JSON path is [`FetchService::cached_json`]: a fresh cache entry short
//! circuits the request entirely, everything else is fetched through the
//! queue and written back to the cache. Cache trouble is logged and
//! swallowed; a request never fails because the cache does. Failures come
//! back as a [`RequestError`] naming what was being fetched.
//!
//! ### Metrics
//!
//! - `cache.hit` / `cache.hit_stale` / `cache.miss`: Cache lookups by outcome.
//! - `cache.read_failure` / `cache.write_failure`: Swallowed cache errors.
//! - `fetch.queue.submitted` / `fetch.queue.admitted`: Requests entering and
//!   leaving the queue.
//! - `fetch.queue.pending`: Gauge of requests waiting in the queue.
//! - `fetch.queue.retry` / `fetch.queue.exhausted`: Retry traffic.
//! - `futures.wait_time` / `futures.done` with `task_name:fetch`: Request
//!   timings, queueing included.

mod error;
mod queue;

pub use error::{FetchError, RequestError};
pub use queue::{QueueConfig, RequestQueue};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use reqwest::Method;
use reqwest::header::HeaderMap;
use url::Url;

use crate::caching::{CacheError, CacheKey, CacheStore};
use crate::config::Config;
use crate::credentials::{CachedCredentials, CredentialProvider};
use crate::metric;
use crate::utils::futures::{m, measure};
use crate::utils::http::create_client;

/// A response from the upstream, body undecoded.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

/// How a single request is executed.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    /// Additional headers to send.
    pub headers: HeaderMap,
    /// JSON body to send, if any.
    pub body: Option<serde_json::Value>,
    /// Whether to attach a bearer token resolved from the credential cache.
    ///
    /// The token is resolved anew for every attempt, so a retry that spent
    /// a long backoff waiting does not run with a token that aged out in
    /// the meantime.
    pub bearer: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            bearer: true,
        }
    }
}

/// Cache placement of a single request.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// The key the decoded response is cached under. `None` disables
    /// caching for this request.
    pub key: Option<CacheKey>,
    /// How long the entry stays fresh.
    pub ttl: Duration,
}

impl CacheOptions {
    pub fn cached(key: CacheKey, ttl: Duration) -> Self {
        Self {
            key: Some(key),
            ttl,
        }
    }

    pub fn uncached() -> Self {
        Self::default()
    }
}

/// Executes JSON requests against the upstream APIs.
///
/// Cloning is cheap; clones share the HTTP connection pool, the request
/// queue, and both caches.
#[derive(Clone)]
pub struct FetchService {
    client: reqwest::Client,
    queue: RequestQueue<HttpResponse>,
    cache: CacheStore,
    credentials: CachedCredentials,
}

impl FetchService {
    pub fn new(config: &Config, provider: Arc<dyn CredentialProvider>) -> anyhow::Result<Self> {
        let cache = CacheStore::from_config(config).context("failed to open the cache")?;
        Ok(Self {
            client: create_client(config),
            queue: RequestQueue::new(config.queue.clone()),
            cache,
            credentials: CachedCredentials::new(provider, config.credentials_max_age),
        })
    }

    /// The credential cache used for authenticated requests.
    pub fn credentials(&self) -> &CachedCredentials {
        &self.credentials
    }

    /// Fetches `url` and decodes the response as JSON, consulting the cache.
    ///
    /// A fresh cache entry is served without queueing a request. Everything
    /// else goes through the queue, and the decoded response is written back
    /// to the cache unconditionally, so that even an entry with a zero
    /// time-to-live remains available on disk as a stale fallback.
    ///
    /// Responses that fail to decode are not retried: by that point the
    /// upstream has answered, and the same bytes would just come back again.
    ///
    /// `description` names what is being fetched, in human terms. It ends up
    /// in the [`RequestError`] message on failure.
    pub async fn cached_json(
        &self,
        url: Url,
        options: RequestOptions,
        cache: CacheOptions,
        description: impl Into<String>,
    ) -> Result<serde_json::Value, RequestError> {
        self.cached_json_inner(url, options, cache)
            .await
            .map_err(|e| RequestError::new(description, e))
    }

    async fn cached_json_inner(
        &self,
        url: Url,
        options: RequestOptions,
        cache: CacheOptions,
    ) -> Result<serde_json::Value, FetchError> {
        if let Some(ref key) = cache.key {
            match self.cache.get(key).await {
                Ok(Some(entry)) if entry.is_fresh() => {
                    metric!(counter("cache.hit") += 1);
                    tracing::debug!(key = %key, "serving cached response");
                    return Ok(entry.value);
                }
                Ok(Some(_)) => {
                    metric!(counter("cache.hit_stale") += 1);
                }
                Ok(None) => {
                    metric!(counter("cache.miss") += 1);
                }
                // Caching is off entirely, every request is a plain fetch.
                Err(CacheError::Disabled) => {}
                Err(e) => {
                    metric!(counter("cache.read_failure") += 1);
                    let error: &dyn std::error::Error = &e;
                    tracing::warn!(error, key = %key, "failed to read cached response");
                }
            }
        }

        let response = self.fetch(url, options).await?;
        let value: serde_json::Value = serde_json::from_slice(&response.body)
            .map_err(|e| FetchError::Parse(e.to_string()))?;

        if let Some(ref key) = cache.key {
            match self.cache.set(key, value.clone(), cache.ttl).await {
                Ok(()) | Err(CacheError::Disabled) => {}
                Err(e) => {
                    metric!(counter("cache.write_failure") += 1);
                    let error: &dyn std::error::Error = &e;
                    tracing::warn!(error, key = %key, "failed to write cached response");
                }
            }
        }

        Ok(value)
    }

    /// Executes a request through the queue, without touching the cache.
    pub async fn fetch(
        &self,
        url: Url,
        options: RequestOptions,
    ) -> Result<HttpResponse, FetchError> {
        let client = self.client.clone();
        let credentials = self.credentials.clone();

        let response = self.queue.submit(move || {
            let client = client.clone();
            let credentials = credentials.clone();
            let url = url.clone();
            let options = options.clone();
            async move { execute_request(client, credentials, url, options).await }
        });

        measure("fetch", m::result, response).await
    }
}

/// Runs one attempt of a request.
async fn execute_request(
    client: reqwest::Client,
    credentials: CachedCredentials,
    url: Url,
    options: RequestOptions,
) -> Result<HttpResponse, FetchError> {
    let mut builder = client.request(options.method, url).headers(options.headers);

    if options.bearer {
        let credentials = credentials.resolve().await?;
        builder = builder.bearer_auth(credentials.token);
    }
    if let Some(ref body) = options.body {
        builder = builder.json(body);
    }

    let response = builder.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Http {
            status: status.as_u16(),
        });
    }

    let body = response.bytes().await?;
    Ok(HttpResponse {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use foliostats_test::HitCounter;

    use crate::credentials::{Credentials, StaticCredentials};

    use super::*;

    fn test_service(cache_dir: Option<&Path>) -> FetchService {
        let config = Config {
            cache_dir: cache_dir.map(|p| p.to_path_buf()),
            queue: QueueConfig {
                initial_retry_delay: Duration::from_millis(10),
                backoff_factor: 1.0,
                ..QueueConfig::default()
            },
            ..Config::default()
        };
        FetchService::new(&config, Arc::new(StaticCredentials::new("test-token", "acct-1"))).unwrap()
    }

    #[tokio::test]
    async fn test_cached_json_serves_from_cache() {
        foliostats_test::setup();
        let server = HitCounter::new();
        let cache_dir = foliostats_test::tempdir();
        let service = test_service(Some(cache_dir.path()));

        let cache = CacheOptions::cached(
            CacheKey::new("foliostats-test-entry"),
            Duration::from_secs(3600),
        );

        let first = service
            .cached_json(
                server.url("/json/data"),
                RequestOptions::default(),
                cache.clone(),
                "test data",
            )
            .await
            .unwrap();
        let second = service
            .cached_json(
                server.url("/json/data"),
                RequestOptions::default(),
                cache.clone(),
                "test data",
            )
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(server.accesses(), 1);
    }

    #[tokio::test]
    async fn test_cached_json_expires() {
        foliostats_test::setup();
        let server = HitCounter::new();
        let cache_dir = foliostats_test::tempdir();
        let service = test_service(Some(cache_dir.path()));

        let cache = CacheOptions::cached(
            CacheKey::new("foliostats-short-lived"),
            Duration::from_millis(250),
        );

        service
            .cached_json(
                server.url("/json/data"),
                RequestOptions::default(),
                cache.clone(),
                "test data",
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        service
            .cached_json(
                server.url("/json/data"),
                RequestOptions::default(),
                cache.clone(),
                "test data",
            )
            .await
            .unwrap();

        assert_eq!(server.accesses(), 2);
    }

    #[tokio::test]
    async fn test_uncached_requests_always_fetch() {
        foliostats_test::setup();
        let server = HitCounter::new();
        let service = test_service(None);

        for _ in 0..2 {
            service
                .cached_json(
                    server.url("/json/data"),
                    RequestOptions::default(),
                    CacheOptions::uncached(),
                    "test data",
                )
                .await
                .unwrap();
        }

        assert_eq!(server.accesses(), 2);
    }

    #[tokio::test]
    async fn test_disabled_cache_always_fetches() {
        foliostats_test::setup();
        let server = HitCounter::new();
        let service = test_service(None);

        // A cache key on a service without a cache directory degrades to a
        // plain fetch instead of failing the request.
        let cache = CacheOptions::cached(
            CacheKey::new("foliostats-test-entry"),
            Duration::from_secs(3600),
        );

        for _ in 0..2 {
            service
                .cached_json(
                    server.url("/json/data"),
                    RequestOptions::default(),
                    cache.clone(),
                    "test data",
                )
                .await
                .unwrap();
        }

        assert_eq!(server.accesses(), 2);
    }

    #[tokio::test]
    async fn test_undecodable_response_is_not_retried() {
        foliostats_test::setup();
        let server = HitCounter::new();
        let service = test_service(None);

        let result = service
            .cached_json(
                server.url("/garbage_data/not-json"),
                RequestOptions::default(),
                CacheOptions::uncached(),
                "test data",
            )
            .await;

        assert!(matches!(result.unwrap_err().source, FetchError::Parse(_)));
        assert_eq!(server.accesses(), 1);
    }

    #[tokio::test]
    async fn test_client_error_propagates() {
        foliostats_test::setup();
        let server = HitCounter::new();
        let service = test_service(None);

        let result = service
            .cached_json(
                server.url("/respond_statuscode/404/missing"),
                RequestOptions::default(),
                CacheOptions::uncached(),
                "the missing resource",
            )
            .await;

        let error = result.unwrap_err();
        assert_eq!(error.source, FetchError::Http { status: 404 });
        insta::assert_snapshot!(
            error.to_string(),
            @"failed to fetch the missing resource: unexpected status code: 404"
        );
        assert_eq!(server.accesses(), 1);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        foliostats_test::setup();
        let server = HitCounter::new();
        let service = test_service(None);

        let value = service
            .cached_json(
                server.url("/flaky/2/data"),
                RequestOptions::default(),
                CacheOptions::uncached(),
                "test data",
            )
            .await
            .unwrap();

        assert_eq!(value["attempt"], serde_json::json!(3));
        assert_eq!(server.accesses(), 3);
    }

    #[tokio::test]
    async fn test_bearer_token_refreshed_between_attempts() {
        foliostats_test::setup();
        let server = HitCounter::new();

        // Hands out a new token on every resolution.
        #[derive(Default)]
        struct RotatingProvider {
            calls: std::sync::atomic::AtomicU32,
        }

        impl CredentialProvider for RotatingProvider {
            fn resolve(&self) -> futures::future::BoxFuture<'_, Result<Credentials, FetchError>> {
                Box::pin(async {
                    let n = self
                        .calls
                        .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                        + 1;
                    Ok(Credentials {
                        token: format!("token-{n}"),
                        account_id: "acct-1".into(),
                    })
                })
            }
        }

        let config = Config {
            cache_dir: None,
            // Ages out well within a single backoff delay.
            credentials_max_age: Duration::from_millis(1),
            queue: QueueConfig {
                initial_retry_delay: Duration::from_millis(10),
                backoff_factor: 1.0,
                ..QueueConfig::default()
            },
            ..Config::default()
        };
        let service =
            FetchService::new(&config, Arc::new(RotatingProvider::default())).unwrap();

        let value = service
            .cached_json(
                server.url("/flaky/2/auth"),
                RequestOptions::default(),
                CacheOptions::uncached(),
                "test data",
            )
            .await
            .unwrap();

        // The token expired during each backoff, so the final attempt runs
        // with a freshly resolved one rather than the token of attempt 1.
        assert_eq!(value["attempt"], serde_json::json!(3));
        assert_eq!(value["authorization"], serde_json::json!("Bearer token-3"));
    }

    #[tokio::test]
    async fn test_bearer_token_attached() {
        foliostats_test::setup();
        let server = HitCounter::new();
        let service = test_service(None);

        let value = service
            .cached_json(
                server.url("/bearer/auth"),
                RequestOptions::default(),
                CacheOptions::uncached(),
                "test data",
            )
            .await
            .unwrap();

        assert_eq!(
            value["authorization"],
            serde_json::json!("Bearer test-token")
        );
    }

    #[tokio::test]
    async fn test_bearer_can_be_disabled() {
        foliostats_test::setup();
        let server = HitCounter::new();
        let service = test_service(None);

        let value = service
            .cached_json(
                server.url("/bearer/anon"),
                RequestOptions {
                    bearer: false,
                    ..RequestOptions::default()
                },
                CacheOptions::uncached(),
                "test data",
            )
            .await
            .unwrap();

        assert_eq!(value["authorization"], serde_json::json!(""));
    }
}
