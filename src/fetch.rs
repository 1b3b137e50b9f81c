//! Fetching bytes for a URL.
//!
//! The caches never speak HTTP themselves: they ask a [`Fetcher`] for the
//! body of a URL with whatever headers the caller's source requires.

use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use exn::ResultExt;
use kura_config::HttpConfig;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;

/// Request headers, passed through verbatim.
pub type Headers = BTreeMap<String, String>;

/// Fetch the complete body of a URL.
///
/// Implementations own timeouts and retries; a returned error means the
/// request as a whole failed.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, headers: &Headers) -> Result<Vec<u8>>;
}

/// [`Fetcher`] backed by a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .or_raise(|| ErrorKind::Config)?;
        Ok(Self { client })
    }

    fn header_map(headers: &Headers) -> Result<HeaderMap> {
        let mut map = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes()).or_raise(|| ErrorKind::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value).or_raise(|| ErrorKind::InvalidHeader(name.to_string()))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, headers: &Headers) -> Result<Vec<u8>> {
        tracing::trace!(url, "HTTP GET request starting");
        let response = self
            .client
            .get(url)
            .headers(Self::header_map(headers)?)
            .send()
            .await
            .or_raise(|| ErrorKind::Network(url.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(url, status = status.as_u16(), "HTTP error status");
            exn::bail!(ErrorKind::Status { status: status.as_u16(), url: url.to_string() });
        }
        let body = response.bytes().await.or_raise(|| ErrorKind::Network(url.to_string()))?;
        tracing::debug!(url, bytes = body.len(), "HTTP response received");
        Ok(body.to_vec())
    }
}

#[cfg(any(test, feature = "mock"))]
pub use self::mock::MockFetcher;

#[cfg(any(test, feature = "mock"))]
mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    /// In-memory [`Fetcher`] for tests: serves registered bodies, counts
    /// calls, and can be slowed down to widen race windows.
    #[derive(Debug, Default)]
    pub struct MockFetcher {
        bodies: Mutex<HashMap<String, Vec<u8>>>,
        calls: Mutex<HashMap<String, usize>>,
        total: AtomicUsize,
        delay: Duration,
    }

    impl MockFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every fetch sleeps for `delay` before answering.
        pub fn with_delay(delay: Duration) -> Self {
            Self { delay, ..Self::default() }
        }

        /// Serve `body` for `url`. Unregistered URLs answer 404.
        pub fn insert(&self, url: impl Into<String>, body: impl Into<Vec<u8>>) {
            self.bodies.lock().unwrap_or_else(PoisonError::into_inner).insert(url.into(), body.into());
        }

        /// Total number of fetches.
        pub fn calls(&self) -> usize {
            self.total.load(Ordering::SeqCst)
        }

        pub fn calls_for(&self, url: &str) -> usize {
            self.calls.lock().unwrap_or_else(PoisonError::into_inner).get(url).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch(&self, url: &str, _headers: &Headers) -> Result<Vec<u8>> {
            self.total.fetch_add(1, Ordering::SeqCst);
            *self.calls.lock().unwrap_or_else(PoisonError::into_inner).entry(url.to_string()).or_default() += 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let body = self.bodies.lock().unwrap_or_else(PoisonError::into_inner).get(url).cloned();
            match body {
                Some(body) => Ok(body),
                None => exn::bail!(ErrorKind::Status { status: 404, url: url.to_string() }),
            }
        }
    }
}
