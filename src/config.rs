use std::num::NonZeroU32;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::archive::UnpackOptions;
use crate::limiter::{QuotaRegistry, RetryPolicy};

/// Default chunk size for streamed writes (8 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_10_1) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/39.0.2171.95 Safari/537.36";

/// Header sent when the caller doesn't provide one.
pub fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    headers
}

/// Everything a [`crate::Fetcher`] needs to know.
///
/// The quota registry and archive lock default to the process-wide shared
/// instances; give a config fresh ones to isolate it.
#[derive(Clone)]
pub struct FetchConfig {
    pub headers: HeaderMap,
    pub chunk_size: usize,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    /// Sleep until the quota window resets instead of failing with `RateLimited`.
    pub reschedule: bool,
    /// Upper bound on Google Drive confirmation-page hops.
    pub max_hops: usize,
    pub github_api: String,
    pub github_web: String,
    pub gdrive_api: String,
    /// Cap on bytes written per second, shared by every download of one fetcher.
    pub bandwidth: Option<NonZeroU32>,
    pub quotas: QuotaRegistry,
    pub unpack: UnpackOptions,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            headers: default_headers(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            reschedule: true,
            max_hops: 5,
            github_api: "https://api.github.com".to_string(),
            github_web: "https://github.com".to_string(),
            gdrive_api: "https://www.googleapis.com/drive/v3".to_string(),
            bandwidth: None,
            quotas: QuotaRegistry::global(),
            unpack: UnpackOptions::default(),
        }
    }
}

impl FetchConfig {
    /// A config with its own quota registry, for callers that must not share limits.
    pub fn isolated() -> Self {
        Self {
            quotas: QuotaRegistry::new(),
            ..Self::default()
        }
    }
}
