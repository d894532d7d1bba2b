use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Errors surfaced by downloads, request gating and archive extraction.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error("bad chunk detected after {written} bytes, likely a truncated stream")]
    TruncatedStream { written: u64 },
    #[error("limit exceeded for '{quota}' (retry in {retry_after:?})")]
    RateLimited { quota: String, retry_after: Duration },
    #[error("google drive denied access to the file: {0}")]
    AccessDenied(String),
    #[error("gave up resolving download link after {0} hops")]
    TooManyHops(usize),
    #[error("archive not found: {0}")]
    ArchiveNotFound(PathBuf),
    #[error("failed to extract {path}: {reason}")]
    Archive { path: PathBuf, reason: String },
    #[error("7z exited with {status} while extracting {path}")]
    SevenZipTool { path: PathBuf, status: std::process::ExitStatus },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("download cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http(e) => match e.status() {
                Some(status) => is_transient_status(status),
                None => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            },
            FetchError::Status { status, .. } => is_transient_status(*status),
            _ => false,
        }
    }

    pub(crate) fn archive(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        FetchError::Archive {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub type Result<T> = std::result::Result<T, FetchError>;
