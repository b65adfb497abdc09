use std::time::Duration;

use crate::config::Config;

/// Creates a [`reqwest::Client`] for talking to the upstream APIs.
///
/// The client transparently decompresses gzip responses and resolves
/// hostnames through hickory-dns. Connection and per-request timeouts
/// come from the configuration.
///
/// Redirects are not followed: an expired session redirects API calls to a
/// login page, and that must surface as its status code instead of being
/// followed into a misleading 200.
pub fn create_client(config: &Config) -> reqwest::Client {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .hickory_dns(true)
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .unwrap()
}
