//! The rate-limited, retrying upstream client.
//!
//! Every request goes through one [`RateGate`], the retry schedule and the
//! circuit breaker. A logical fetch (one page walk, one chunked window) runs
//! against a single wall-clock deadline; when it passes, the fetch fails
//! with [`FetchError::Timeout`].

use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::auth::Credentials;
use super::circuit_breaker::CircuitBreaker;
use super::error::{FetchError, TransportError};
use super::rate_gate::RateGate;
use super::retry::RetryPolicy;
use super::transport::{HttpResponse, ReqwestTransport, Transport};
use crate::config::ClientConfig;

/// One page of a cursor-paginated resource.
pub trait Paginated: DeserializeOwned {
    type Item;

    /// Split into items and the next cursor (`None` or empty when done).
    fn into_parts(self) -> (Vec<Self::Item>, Option<String>);
}

/// A half-open `[start, end)` window of interval starts, in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub start: i64,
    pub end: i64,
}

/// Split `[start, end)` into consecutive windows of at most `max_intervals`
/// periods each. A partial trailing interval counts as one interval.
pub fn plan_chunks(start: i64, end: i64, period_secs: i64, max_intervals: u32) -> Vec<Chunk> {
    if end <= start || period_secs <= 0 {
        return Vec::new();
    }
    let span = period_secs.saturating_mul(max_intervals.max(1) as i64);
    let mut chunks = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = cursor.saturating_add(span).min(end);
        chunks.push(Chunk {
            start: cursor,
            end: next,
        });
        cursor = next;
    }
    chunks
}

/// Number of intervals of `period_secs` needed to cover `[start, end)`.
pub fn interval_count(start: i64, end: i64, period_secs: i64) -> u64 {
    if end <= start || period_secs <= 0 {
        return 0;
    }
    ((end - start + period_secs - 1) / period_secs) as u64
}

pub struct RateLimitedClient {
    transport: Box<dyn Transport>,
    gate: RateGate,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    credentials: Credentials,
    budget: Duration,
    request_timeout: Duration,
    page_size: u32,
    max_pages: u32,
    max_intervals: u32,
}

impl RateLimitedClient {
    /// Client over the real HTTP transport.
    pub fn new(config: &ClientConfig, credentials: Credentials) -> Result<Self, FetchError> {
        let transport = ReqwestTransport::new(config).map_err(|e| FetchError::Permanent {
            status: 0,
            message: e.to_string(),
        })?;
        Ok(Self::with_transport(config, credentials, Box::new(transport)))
    }

    pub fn with_transport(
        config: &ClientConfig,
        credentials: Credentials,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            transport,
            gate: RateGate::new(config.requests_per_second, config.burst),
            retry: RetryPolicy::from_config(config),
            breaker: CircuitBreaker::new(
                config.breaker_threshold,
                Duration::from_secs(config.breaker_cooldown_secs),
            ),
            credentials,
            budget: config.fetch_budget(),
            request_timeout: config.request_timeout(),
            page_size: config.page_size,
            max_pages: config.max_pages,
            max_intervals: config.max_intervals,
        }
    }

    /// Override the retry schedule (tests use zero delays).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    /// Deadline for a fetch starting now.
    pub fn deadline(&self) -> Instant {
        self.deadline_within(None)
    }

    /// Deadline for a fetch with its own budget, never longer than the
    /// client-wide one.
    pub fn deadline_within(&self, budget: Option<Duration>) -> Instant {
        let budget = budget.map_or(self.budget, |b| b.min(self.budget));
        Instant::now() + budget
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Safety bound on pages followed per fetch.
    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    pub fn max_intervals(&self) -> u32 {
        self.max_intervals
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Fetch and decode one resource under its own budget.
    pub fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<T, FetchError> {
        self.get_json_until(path, query, self.deadline())
    }

    /// Fetch and decode one resource, sharing an existing deadline.
    pub fn get_json_until<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
        deadline: Instant,
    ) -> Result<T, FetchError> {
        let body = self.request(path, query, deadline)?;
        serde_json::from_slice(&body).map_err(|e| {
            FetchError::Malformed(format!("{path}: {e}"))
        })
    }

    /// Walk a cursor-paginated resource, handing each page to `on_page`.
    /// Stops when the cursor runs out or `on_page` breaks. A `limit` already
    /// in `query` overrides the configured page size.
    pub fn for_each_page<P, F>(
        &self,
        path: &str,
        query: &[(String, String)],
        deadline: Instant,
        mut on_page: F,
    ) -> Result<u32, FetchError>
    where
        P: Paginated,
        F: FnMut(Vec<P::Item>) -> Result<ControlFlow<()>, FetchError>,
    {
        let mut cursor: Option<String> = None;
        let mut pages = 0u32;
        loop {
            if pages >= self.max_pages {
                return Err(FetchError::Malformed(format!(
                    "{path}: cursor did not terminate after {pages} pages"
                )));
            }
            let mut q = query.to_vec();
            if !q.iter().any(|(k, _)| k == "limit") {
                q.push(("limit".to_string(), self.page_size.to_string()));
            }
            if let Some(c) = &cursor {
                q.push(("cursor".to_string(), c.clone()));
            }
            let page: P = self.get_json_until(path, &q, deadline)?;
            pages += 1;
            let (items, next) = page.into_parts();
            debug!(path, page = pages, items = items.len(), "page fetched");
            if on_page(items)?.is_break() {
                break;
            }
            match next {
                Some(n) if !n.is_empty() => {
                    if cursor.as_deref() == Some(n.as_str()) {
                        return Err(FetchError::Malformed(format!(
                            "{path}: cursor repeated after page {pages}"
                        )));
                    }
                    cursor = Some(n);
                }
                _ => break,
            }
        }
        Ok(pages)
    }

    /// Every item of a cursor-paginated resource, in page order.
    pub fn fetch_all_pages<P: Paginated>(
        &self,
        path: &str,
        query: &[(String, String)],
        deadline: Instant,
    ) -> Result<Vec<P::Item>, FetchError> {
        let mut all = Vec::new();
        self.for_each_page::<P, _>(path, query, deadline, |items| {
            all.extend(items);
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(all)
    }

    /// Fetch a time-series window in sequential chunks of at most
    /// `max_intervals` periods.
    ///
    /// Each chunk adds `start_ts`/`end_ts` to `query`; `extract` turns the
    /// decoded response into items and `key` gives an item's interval start
    /// (epoch seconds). Items outside their chunk are dropped, so the result
    /// is ordered with no duplicate interval starts. An empty chunk is a gap,
    /// not the end of the series.
    #[allow(clippy::too_many_arguments)]
    pub fn fetch_chunked<R, T, E, K>(
        &self,
        path: &str,
        query: &[(String, String)],
        start: i64,
        end: i64,
        period_secs: i64,
        deadline: Instant,
        extract: E,
        key: K,
    ) -> Result<Vec<T>, FetchError>
    where
        R: DeserializeOwned,
        E: Fn(R) -> Result<Vec<T>, FetchError>,
        K: Fn(&T) -> i64,
    {
        let chunks = plan_chunks(start, end, period_secs, self.max_intervals);
        let mut by_start: BTreeMap<i64, T> = BTreeMap::new();
        for chunk in &chunks {
            let mut q = query.to_vec();
            q.push(("start_ts".to_string(), chunk.start.to_string()));
            q.push(("end_ts".to_string(), chunk.end.to_string()));
            let resp: R = self.get_json_until(path, &q, deadline)?;
            let items = extract(resp)?;
            let mut kept = 0usize;
            for item in items {
                let k = key(&item);
                if k >= chunk.start && k < chunk.end {
                    by_start.entry(k).or_insert(item);
                    kept += 1;
                }
            }
            debug!(path, chunk_start = chunk.start, chunk_end = chunk.end, kept, "chunk fetched");
        }
        Ok(by_start.into_values().collect())
    }

    /// One request with rate gating, retries and the breaker. Returns the body.
    ///
    /// Each attempt is given whatever is left of the deadline (at most the
    /// per-request timeout); an answer arriving after the deadline is a
    /// timeout even if it succeeded.
    fn request(
        &self,
        path: &str,
        query: &[(String, String)],
        deadline: Instant,
    ) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if let Err(remaining) = self.breaker.check() {
                return Err(FetchError::CircuitOpen { remaining });
            }
            if !self.gate.acquire_before(deadline) {
                return Err(self.timed_out());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.timed_out());
            }
            let headers = self.credentials.headers("GET", path)?;
            let sent = self
                .transport
                .get(path, query, &headers, remaining.min(self.request_timeout));
            if Instant::now() >= deadline {
                debug!(path, attempt, "answer arrived after the fetch deadline");
                return Err(self.timed_out());
            }
            let outcome = match sent {
                Ok(resp) => classify(resp, attempt),
                Err(e) => Err(transport_failure(e, attempt)),
            };
            let err = match outcome {
                Ok(body) => {
                    self.breaker.record_success();
                    return Ok(body);
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt > self.retry.max_retries {
                warn!(path, attempts = attempt, error = %err, "retries exhausted");
                self.breaker.record_failure();
                return Err(err);
            }
            let delay = match &err {
                FetchError::RateLimited {
                    retry_after: Some(after),
                } => *after,
                _ => self.retry.delay(attempt),
            };
            if Instant::now() + delay > deadline {
                return Err(self.timed_out());
            }
            warn!(
                path,
                attempt,
                kind = err.kind(),
                delay_ms = delay.as_millis() as u64,
                "upstream request failed; backing off"
            );
            std::thread::sleep(delay);
        }
    }

    fn timed_out(&self) -> FetchError {
        self.breaker.record_failure();
        FetchError::Timeout {
            budget: self.budget,
        }
    }
}

/// Map an HTTP status to the retry taxonomy.
fn classify(resp: HttpResponse, attempt: u32) -> Result<Vec<u8>, FetchError> {
    match resp.status {
        s if (200..300).contains(&s) => Ok(resp.body),
        429 => Err(FetchError::RateLimited {
            retry_after: resp.retry_after,
        }),
        408 | 500..=599 => Err(FetchError::Transient {
            attempts: attempt,
            message: format!("HTTP {}: {}", resp.status, resp.body_snippet()),
        }),
        s => Err(FetchError::Permanent {
            status: s,
            message: resp.body_snippet(),
        }),
    }
}

fn transport_failure(e: TransportError, attempt: u32) -> FetchError {
    FetchError::Transient {
        attempts: attempt,
        message: e.to_string(),
    }
}
