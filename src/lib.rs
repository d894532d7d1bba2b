//! Resumable, rate-limited file retrieval with Google Drive and GitHub flows
//! and suffix-dispatched archive unpacking.

pub mod archive;
pub mod config;
pub mod cookies;
pub mod downloader;
pub mod error;
pub mod hashing;
pub mod limiter;
pub mod providers;
pub mod utils;

pub use archive::{unpack_archive, unpack_archive_async, ArchiveKind, ArchiveLock, SevenZipBackend, UnpackOptions};
pub use config::{default_headers, FetchConfig, DEFAULT_CHUNK_SIZE};
pub use cookies::CookieJar;
pub use downloader::{DownloadRequest, Fetcher, ProgressCallback};
pub use error::{FetchError, Result};
pub use hashing::calculate_hash;
pub use limiter::{Bandwidth, QuotaRegistry, RateLimit, RequestGate, RetryPolicy};
pub use providers::{GitHub, GoogleDrive, GoogleDriveMetadata, Provider};
