//! Single web-search operation with a bounded, time-boxed cache and a
//! transparent degraded mode when no provider is configured.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use miette::Diagnostic;
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use crate::config::SearchConfig;
use crate::registry::Language;

const CACHE_TTL: Duration = Duration::from_secs(15 * 60);
const CACHE_CAPACITY: usize = 256;

#[derive(Debug, Error, Diagnostic)]
pub enum SearchGatewayError {
    #[error("search provider `{provider}` returned an error: {message}")]
    #[diagnostic(code(deepresearch::search::provider))]
    Provider { provider: &'static str, message: String },

    #[error("search request timed out")]
    #[diagnostic(code(deepresearch::search::timeout))]
    Timeout,
}

pub type Result<T> = std::result::Result<T, SearchGatewayError>;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub score: f32,
}

/// Outcome of one search call: the ranked results plus whether the gateway
/// is operating without a configured provider.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    pub degraded: bool,
}

/// Bound on a health-check probe against the provider; unrelated to a
/// search call's own request timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
pub trait SearchGateway: Send + Sync {
    async fn search(
        &self,
        query: &str,
        language: Language,
        max_results: usize,
    ) -> Result<SearchOutcome>;

    /// Whether the provider answers a minimal probe within a bounded window
    /// without reporting itself degraded. Used for health reporting only.
    async fn probe(&self) -> bool {
        match tokio::time::timeout(PROBE_TIMEOUT, self.search("healthcheck", Language::En, 1)).await {
            Ok(Ok(outcome)) => !outcome.degraded,
            _ => false,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Hash)]
struct CacheKey {
    query: String,
    language: Language,
    max_results: usize,
}

struct CacheEntry {
    outcome: SearchOutcome,
    inserted_at: Instant,
}

/// HTTP-backed search gateway with a bounded LRU cache and single-flight
/// de-duplication of concurrent identical queries.
pub struct HttpSearchGateway {
    client: reqwest::Client,
    endpoint: Option<String>,
    api_key: Option<String>,
    cache: Mutex<LruCache<CacheKey, CacheEntry>>,
    in_flight: AsyncMutex<()>,
}

impl HttpSearchGateway {
    #[must_use]
    pub fn new(config: &SearchConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            cache: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(CACHE_CAPACITY).unwrap(),
            )),
            in_flight: AsyncMutex::new(()),
        }
    }

    fn cache_get(&self, key: &CacheKey) -> Option<SearchOutcome> {
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get(key) {
            if entry.inserted_at.elapsed() < CACHE_TTL {
                return Some(entry.outcome.clone());
            }
        }
        cache.pop(key);
        None
    }

    fn cache_put(&self, key: CacheKey, outcome: SearchOutcome) {
        let mut cache = self.cache.lock();
        cache.put(
            key,
            CacheEntry {
                outcome,
                inserted_at: Instant::now(),
            },
        );
    }

    async fn fetch(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        let (Some(endpoint), Some(api_key)) = (&self.endpoint, &self.api_key) else {
            return Ok(Vec::new());
        };

        let response = self
            .client
            .get(endpoint)
            .bearer_auth(api_key)
            .query(&[("q", query), ("count", &max_results.to_string())])
            .send()
            .await
            .map_err(|e| SearchGatewayError::Provider {
                provider: "http",
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(SearchGatewayError::Provider {
                provider: "http",
                message: format!("HTTP {}", response.status()),
            });
        }

        let parsed: ProviderResponse = response.json().await.map_err(|e| SearchGatewayError::Provider {
            provider: "http",
            message: e.to_string(),
        })?;

        let mut results: Vec<SearchResult> = parsed
            .results
            .into_iter()
            .map(|r| SearchResult {
                title: r.title,
                url: r.url,
                snippet: r.snippet,
                score: r.score.unwrap_or(0.0),
            })
            .collect();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(max_results);
        Ok(results)
    }
}

#[async_trait]
impl SearchGateway for HttpSearchGateway {
    #[instrument(skip(self), err)]
    async fn search(
        &self,
        query: &str,
        language: Language,
        max_results: usize,
    ) -> Result<SearchOutcome> {
        let normalized = query.trim().to_lowercase();
        let key = CacheKey {
            query: normalized,
            language,
            max_results,
        };

        if let Some(hit) = self.cache_get(&key) {
            return Ok(hit);
        }

        // Single-flight: serialise concurrent misses so identical queries
        // don't hit the provider twice while the first is in flight.
        let _guard = self.in_flight.lock().await;
        if let Some(hit) = self.cache_get(&key) {
            return Ok(hit);
        }

        let results = self.fetch(query, max_results).await?;
        let outcome = SearchOutcome {
            degraded: self.endpoint.is_none() || self.api_key.is_none(),
            results,
        };
        self.cache_put(key, outcome.clone());
        Ok(outcome)
    }
}

#[derive(Deserialize)]
struct ProviderResponse {
    results: Vec<ProviderResult>,
}

#[derive(Deserialize)]
struct ProviderResult {
    title: String,
    url: String,
    snippet: String,
    score: Option<f32>,
}

/// Test/offline stub that never calls the network.
pub struct StubSearchGateway {
    pub fixed: Vec<SearchResult>,
}

#[async_trait]
impl SearchGateway for StubSearchGateway {
    async fn search(
        &self,
        _query: &str,
        _language: Language,
        max_results: usize,
    ) -> Result<SearchOutcome> {
        let mut results = self.fixed.clone();
        results.truncate(max_results);
        Ok(SearchOutcome {
            degraded: false,
            results,
        })
    }
}

#[must_use]
pub fn shared_http_gateway(config: &SearchConfig) -> Arc<dyn SearchGateway> {
    Arc::new(HttpSearchGateway::new(config))
}
