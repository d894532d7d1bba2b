//! Outbound request gating: moving-window quotas plus exponential-backoff retry.
//!
//! A [`RequestGate`] registers one hit against its quota before the wrapped
//! request runs, then retries transient failures of that request within the
//! [`RetryPolicy`] budget. Retries do not consume extra hits.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use log::{debug, warn};
use once_cell::sync::Lazy;

use crate::error::{FetchError, Result};

static GLOBAL_QUOTAS: Lazy<QuotaRegistry> = Lazy::new(QuotaRegistry::new);

/// A named allowance of `calls` hits per `period`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    pub name: String,
    pub calls: NonZeroU32,
    pub period: Duration,
}

impl RateLimit {
    pub fn new(name: impl Into<String>, calls: u32, period: Duration) -> Self {
        Self {
            name: name.into(),
            calls: NonZeroU32::new(calls).unwrap_or(NonZeroU32::MIN),
            period,
        }
    }

    /// GitHub's unauthenticated allowance: 60 requests per hour.
    pub fn github() -> Self {
        Self::new("github", 60, Duration::from_secs(3600))
    }

    /// Authenticated GitHub access, paced well under 5000 per hour.
    pub fn github_authenticated() -> Self {
        Self::new("github-authenticated", 7, Duration::from_secs(5))
    }
}

/// Quota state shared by every caller that gates on the same [`RateLimit`] name.
///
/// Each `(quota, key)` pair keeps a log of its hit times. A hit is admitted
/// while fewer than `calls` hits fall inside the trailing `period`. Cloning is
/// cheap and shares the logs.
#[derive(Clone, Default)]
pub struct QuotaRegistry {
    windows: Arc<Mutex<HashMap<(String, String), VecDeque<Instant>>>>,
}

impl QuotaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by default configurations.
    pub fn global() -> Self {
        GLOBAL_QUOTAS.clone()
    }

    /// Registers a hit without waiting. On refusal returns how long until the
    /// oldest hit in the window expires.
    pub fn try_hit(&self, limit: &RateLimit, key: &str) -> std::result::Result<(), Duration> {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let hits = windows
            .entry((limit.name.clone(), key.to_string()))
            .or_default();

        while hits
            .front()
            .map_or(false, |oldest| now.duration_since(*oldest) >= limit.period)
        {
            hits.pop_front();
        }

        if hits.len() >= limit.calls.get() as usize {
            let oldest = hits.front().copied().unwrap_or(now);
            return Err(limit.period.saturating_sub(now.duration_since(oldest)));
        }
        hits.push_back(now);
        Ok(())
    }

    /// Registers a hit, sleeping until the window allows it.
    pub async fn hit(&self, limit: &RateLimit, key: &str) {
        while let Err(wait) = self.try_hit(limit, key) {
            debug!("quota '{}' exhausted for '{}', sleeping {:?}", limit.name, key, wait);
            tokio::time::sleep(wait).await;
        }
    }
}

/// Caps transfer throughput at a number of bytes per second.
pub struct Bandwidth {
    limiter: DefaultDirectRateLimiter,
    burst: NonZeroU32,
}

impl Bandwidth {
    pub fn per_second(bytes: NonZeroU32) -> Self {
        Self {
            limiter: RateLimiter::direct(Quota::per_second(bytes)),
            burst: bytes,
        }
    }

    /// Waits until `bytes` more bytes may be written.
    pub async fn consume(&self, bytes: usize) {
        let mut left = bytes;
        while left > 0 {
            let n = left.min(self.burst.get() as usize);
            if let Some(cells) = NonZeroU32::new(n as u32) {
                if self.limiter.until_n_ready(cells).await.is_err() {
                    break;
                }
            }
            left -= n;
        }
    }
}

/// Exponential backoff for transient request failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_tries: u32,
    /// No retry is scheduled once this much time has passed since the first attempt.
    pub max_time: Duration,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: 2,
            max_time: Duration::from_secs(1),
            initial_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_tries: 1,
            ..Self::default()
        }
    }

    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut delay = self.initial_delay;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_tries => {
                    if started.elapsed() + delay > self.max_time {
                        return Err(e);
                    }
                    warn!("attempt {} failed ({}), retrying in {:?}", attempt, e, delay);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Quota gating composed with backoff retry around a single request.
#[derive(Clone)]
pub struct RequestGate {
    registry: QuotaRegistry,
    limit: RateLimit,
    identifiers: Vec<String>,
    reschedule: bool,
    retry: RetryPolicy,
}

impl RequestGate {
    pub fn new(registry: QuotaRegistry, limit: RateLimit) -> Self {
        Self {
            registry,
            limit,
            identifiers: Vec::new(),
            reschedule: true,
            retry: RetryPolicy::default(),
        }
    }

    /// With `false`, an exhausted quota fails fast with [`FetchError::RateLimited`].
    pub fn reschedule(mut self, reschedule: bool) -> Self {
        self.reschedule = reschedule;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Separates this gate's hits from other callers of the same quota.
    pub fn identifiers<I, S>(mut self, identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identifiers = identifiers.into_iter().map(Into::into).collect();
        self
    }

    fn key(&self) -> String {
        self.identifiers.join("/")
    }

    async fn acquire(&self) -> Result<()> {
        let key = self.key();
        if self.reschedule {
            self.registry.hit(&self.limit, &key).await;
            return Ok(());
        }
        self.registry
            .try_hit(&self.limit, &key)
            .map_err(|retry_after| FetchError::RateLimited {
                quota: self.limit.name.clone(),
                retry_after,
            })
    }

    /// Runs `op` once the quota allows it, retrying transient failures.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire().await?;
        self.retry.run(op).await
    }
}
