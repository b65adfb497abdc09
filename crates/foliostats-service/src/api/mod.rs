//! Typed wrappers for the upstream platform endpoints.
//!
//! Each method corresponds to one endpoint the statistics need, with the
//! cache key and time-to-live that endpoint has always used. Payloads stay
//! opaque [`serde_json::Value`]s; this subsystem schedules and caches them,
//! the formulas downstream interpret them.
//!
//! The platform serves portfolio data and trading data from two separate
//! hosts, so [`ApiClient`] carries both base URLs (see
//! [`ApiConfig`](crate::config::ApiConfig)).

use std::time::Duration;

use serde_json::Value;
use url::Url;

use crate::caching::CacheKey;
use crate::config::ApiConfig;
use crate::fetch::{CacheOptions, FetchService, RequestError, RequestOptions};

const HOUR: Duration = Duration::from_secs(60 * 60);

/// A client for the upstream platform APIs.
///
/// Cloning is cheap and clones share the underlying [`FetchService`].
#[derive(Clone)]
pub struct ApiClient {
    fetch: FetchService,
    config: ApiConfig,
}

impl ApiClient {
    /// Creates a client for the configured base URLs.
    ///
    /// Fails when a base URL cannot take relative paths (e.g. a `data:`
    /// URL); this makes the endpoint joins below infallible.
    pub fn new(fetch: FetchService, config: ApiConfig) -> anyhow::Result<Self> {
        for url in [&config.portfolio_url, &config.trading_url] {
            if url.cannot_be_a_base() {
                anyhow::bail!("API base URL cannot take paths: {url}");
            }
        }
        Ok(Self { fetch, config })
    }

    /// The historical value series of an account's whole portfolio.
    pub async fn portfolio_history(&self, account_id: &str) -> Result<Value, RequestError> {
        self.get(
            &self.config.portfolio_url,
            &format!("portfolio/accounts/{account_id}/portfolio-history"),
            CacheOptions::cached(
                CacheKey::new(format!("foliostats-portfolio-history-{account_id}")),
                HOUR,
            ),
            format!("portfolio history for account {account_id}"),
        )
        .await
    }

    /// The ACH transfers into and out of an account during `year`.
    pub async fn ach_transfers(&self, account_id: &str, year: u16) -> Result<Value, RequestError> {
        self.get(
            &self.config.portfolio_url,
            &format!("cash/accounts/{account_id}/ach-transfers?year={year}"),
            CacheOptions::cached(
                CacheKey::new(format!("foliostats-ach-transfers-{account_id}-{year}")),
                HOUR,
            ),
            format!("ACH transfers for account {account_id} in {year}"),
        )
        .await
    }

    /// The daily change of a single strategy within an account.
    ///
    /// The time-to-live is the caller's choice. Statistics views pass zero:
    /// the value changes intraday and must be fetched fresh, but the write
    /// still lands on disk as a stale fallback.
    pub async fn strategy_daily_change(
        &self,
        account_id: &str,
        strategy_id: &str,
        ttl: Duration,
    ) -> Result<Value, RequestError> {
        self.get(
            &self.config.portfolio_url,
            &format!("portfolio/accounts/{account_id}/strategies/{strategy_id}"),
            CacheOptions::cached(
                CacheKey::new(format!("foliostats-strategy-{strategy_id}")),
                ttl,
            ),
            format!("daily change of strategy {strategy_id}"),
        )
        .await
    }

    /// The deploys of an account, filtered by deploy status.
    pub async fn account_deploys(
        &self,
        account_id: &str,
        status: &str,
    ) -> Result<Value, RequestError> {
        self.get(
            &self.config.trading_url,
            &format!("deploy/accounts/{account_id}/deploys?status={status}"),
            CacheOptions::cached(
                CacheKey::new(format!("foliostats-deploys-{status}")),
                12 * HOUR,
            ),
            format!("deploys with status {status}"),
        )
        .await
    }

    /// Metadata about which statistics exist for an account's strategies.
    pub async fn strategy_stats_meta(&self, account_id: &str) -> Result<Value, RequestError> {
        self.get(
            &self.config.portfolio_url,
            &format!("portfolio/accounts/{account_id}/strategy-stats-meta"),
            CacheOptions::cached(CacheKey::new("foliostats-strategy-stats-meta"), 12 * HOUR),
            "strategy stats metadata".to_owned(),
        )
        .await
    }

    async fn get(
        &self,
        base: &Url,
        path: &str,
        cache: CacheOptions,
        description: String,
    ) -> Result<Value, RequestError> {
        // Infallible: `new` rejected bases that cannot take paths.
        let url = base.join(path).expect("checked API base URL");
        self.fetch
            .cached_json(url, RequestOptions::default(), cache, description)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use foliostats_test::HitCounter;

    use crate::config::Config;
    use crate::credentials::StaticCredentials;
    use crate::fetch::FetchError;

    use super::*;

    fn test_client(server: &HitCounter, cache_dir: Option<&std::path::Path>) -> ApiClient {
        let config = Config {
            cache_dir: cache_dir.map(|p| p.to_path_buf()),
            api: ApiConfig {
                portfolio_url: server.url("/json/portfolio/"),
                trading_url: server.url("/json/trading/"),
            },
            ..Config::default()
        };
        let fetch =
            FetchService::new(&config, Arc::new(StaticCredentials::new("test-token", "acct-1"))).unwrap();
        ApiClient::new(fetch, config.api).unwrap()
    }

    #[tokio::test]
    async fn test_portfolio_history_path() {
        foliostats_test::setup();
        let server = HitCounter::new();
        let client = test_client(&server, None);

        let value = client.portfolio_history("acct-1").await.unwrap();
        assert_eq!(
            value["path"],
            serde_json::json!("portfolio/portfolio/accounts/acct-1/portfolio-history")
        );
    }

    #[tokio::test]
    async fn test_deploys_use_the_trading_host() {
        foliostats_test::setup();
        let server = HitCounter::new();
        let client = test_client(&server, None);

        let value = client.account_deploys("acct-1", "SUCCEEDED").await.unwrap();
        assert_eq!(
            value["path"],
            serde_json::json!("trading/deploy/accounts/acct-1/deploys")
        );
    }

    #[tokio::test]
    async fn test_responses_are_cached_per_endpoint() {
        foliostats_test::setup();
        let server = HitCounter::new();
        let cache_dir = foliostats_test::tempdir();
        let client = test_client(&server, Some(cache_dir.path()));

        client.portfolio_history("acct-1").await.unwrap();
        client.portfolio_history("acct-1").await.unwrap();
        // A different account is a different cache key.
        client.portfolio_history("acct-2").await.unwrap();

        assert_eq!(server.accesses(), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_always_fetches_but_keeps_the_entry() {
        foliostats_test::setup();
        let server = HitCounter::new();
        let cache_dir = foliostats_test::tempdir();
        let client = test_client(&server, Some(cache_dir.path()));

        client
            .strategy_daily_change("acct-1", "strat-9", Duration::ZERO)
            .await
            .unwrap();
        client
            .strategy_daily_change("acct-1", "strat-9", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(server.accesses(), 2);

        // The write-through still happened; the entry is on disk, stale.
        let store = crate::caching::CacheStore::new(Some(cache_dir.path().to_path_buf())).unwrap();
        let entry = store
            .get(&CacheKey::new("foliostats-strategy-strat-9"))
            .await
            .unwrap()
            .unwrap();
        assert!(!entry.is_fresh());
    }

    #[tokio::test]
    async fn test_errors_carry_the_request_description() {
        foliostats_test::setup();
        let server = HitCounter::new();

        let config = Config {
            cache_dir: None,
            api: ApiConfig {
                portfolio_url: server.url("/respond_statuscode/404/"),
                trading_url: server.url("/respond_statuscode/404/"),
            },
            ..Config::default()
        };
        let fetch =
            FetchService::new(&config, Arc::new(StaticCredentials::new("test-token", "acct-1"))).unwrap();
        let client = ApiClient::new(fetch, config.api).unwrap();

        let error = client.ach_transfers("acct-1", 2025).await.unwrap_err();
        assert_eq!(error.description, "ACH transfers for account acct-1 in 2025");
        assert_eq!(error.source, FetchError::Http { status: 404 });
        insta::assert_snapshot!(
            error,
            @"failed to fetch ACH transfers for account acct-1 in 2025: unexpected status code: 404"
        );
    }

    #[test]
    fn test_rejects_unusable_base_urls() {
        let config = Config {
            cache_dir: None,
            ..Config::default()
        };
        let fetch =
            FetchService::new(&config, Arc::new(StaticCredentials::new("test-token", "acct-1"))).unwrap();

        let result = ApiClient::new(
            fetch,
            ApiConfig {
                portfolio_url: Url::parse("data:text/plain,nope").unwrap(),
                ..ApiConfig::default()
            },
        );
        assert!(result.is_err());
    }
}
