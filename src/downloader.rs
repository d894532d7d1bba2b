use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use log::{debug, error, info};
use reqwest::header::{HeaderMap, RANGE};
use reqwest::{Client, Response, StatusCode};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::FetchConfig;
use crate::error::{FetchError, Result};
use crate::limiter::Bandwidth;
use crate::utils::{estimate_content_length, mkdir_full_perms};

/// Called after every chunk with `(bytes written so far, best-effort total)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// One file to fetch and where to put it.
#[derive(Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub path: PathBuf,
    /// Falls back to the fetcher's default headers when `None`.
    pub headers: Option<HeaderMap>,
    /// Falls back to the fetcher's configured chunk size when `None`.
    pub chunk_size: Option<usize>,
    pub progress: Option<ProgressCallback>,
    pub cancel: Option<CancellationToken>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
            headers: None,
            chunk_size: None,
            progress: None,
            cancel: None,
        }
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Offset `N` of a `Range: bytes=N-` header, if that's what the headers carry.
pub fn range_start(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get(RANGE)?.to_str().ok()?;
    let open_range = raw.trim().strip_prefix("bytes=")?.strip_suffix('-')?;
    open_range.trim().parse().ok()
}

/// Returns the offset to append at when `path` already holds exactly the
/// bytes the `Range` header skips.
pub async fn resume_offset(path: &Path, headers: &HeaderMap) -> Result<Option<u64>> {
    let Some(start) = range_start(headers) else {
        return Ok(None);
    };
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() == start => Ok(Some(start)),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Streams a body to an open file in fixed-size chunks.
pub struct ChunkWriter<'a> {
    chunk_size: usize,
    progress: Option<&'a ProgressCallback>,
    cancel: Option<&'a CancellationToken>,
    bandwidth: Option<&'a Bandwidth>,
}

impl<'a> ChunkWriter<'a> {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            progress: None,
            cancel: None,
            bandwidth: None,
        }
    }

    pub fn bandwidth(mut self, bandwidth: Option<&'a Bandwidth>) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    pub fn progress(mut self, progress: Option<&'a ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    pub fn cancel(mut self, cancel: Option<&'a CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Drains `stream` into `file`, returning the final file position.
    ///
    /// `written` is the position the file starts at (non-zero when resuming).
    /// An empty piece from the stream is never taken as end of body: the
    /// transfer fails with [`FetchError::TruncatedStream`].
    pub async fn write_stream<S, B, E>(
        &self,
        stream: S,
        file: &mut File,
        mut written: u64,
        estimated_total: u64,
    ) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: Into<FetchError>,
    {
        let mut stream = std::pin::pin!(stream);
        let mut buffer: Vec<u8> = Vec::with_capacity(self.chunk_size.min(1 << 20));

        while let Some(item) = stream.next().await {
            if self.cancel.map_or(false, CancellationToken::is_cancelled) {
                return Err(FetchError::Cancelled);
            }
            let piece = item.map_err(Into::into)?;
            let piece = piece.as_ref();
            if piece.is_empty() {
                return Err(FetchError::TruncatedStream { written });
            }

            buffer.extend_from_slice(piece);
            while buffer.len() >= self.chunk_size {
                let rest = buffer.split_off(self.chunk_size);
                self.write_chunk(file, &buffer, &mut written, estimated_total).await?;
                buffer = rest;
            }
        }

        if !buffer.is_empty() {
            self.write_chunk(file, &buffer, &mut written, estimated_total).await?;
        }
        file.flush().await?;
        Ok(written)
    }

    async fn write_chunk(
        &self,
        file: &mut File,
        chunk: &[u8],
        written: &mut u64,
        estimated_total: u64,
    ) -> Result<()> {
        if let Some(bandwidth) = self.bandwidth {
            bandwidth.consume(chunk.len()).await;
        }
        file.write_all(chunk).await?;
        *written += chunk.len() as u64;
        if let Some(callback) = self.progress {
            callback(*written, estimated_total.max(*written));
        }
        Ok(())
    }
}

/// HTTP client plus configuration shared by every retrieval flow.
///
/// Clones share the connection pool, quota registry, bandwidth cap and archive lock.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    config: Arc<FetchConfig>,
    bandwidth: Option<Arc<Bandwidth>>,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: FetchConfig) -> Self {
        let bandwidth = config
            .bandwidth
            .map(|bytes| Arc::new(Bandwidth::per_second(bytes)));
        Self {
            client,
            config: Arc::new(config),
            bandwidth,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub(crate) fn headers_or_default(&self, headers: Option<HeaderMap>) -> HeaderMap {
        headers.unwrap_or_else(|| self.config.headers.clone())
    }

    /// GET with the given headers; any non-success status is an error.
    pub async fn get(&self, url: &str, headers: HeaderMap) -> Result<Response> {
        debug!("GET {}", url);
        let response = self.client.get(url).headers(headers).send().await?;
        ensure_success(response)
    }

    /// Downloads `request.url` to `request.path`, resuming when the request's
    /// `Range` header matches what is already on disk.
    pub async fn download_file(&self, request: DownloadRequest) -> Result<PathBuf> {
        if let Some(parent) = request.path.parent() {
            if !parent.as_os_str().is_empty() {
                mkdir_full_perms(parent).await?;
            }
        }
        let headers = self.headers_or_default(request.headers.clone());
        let resume = resume_offset(&request.path, &headers).await?;
        let response = self.get(&request.url, headers).await?;
        self.download_from_response(response, &request, resume).await
    }

    /// Writes an already received response to `request.path`.
    ///
    /// Appends at `resume` only if the server honoured the range with
    /// `206 Partial Content`; otherwise the file is truncated and rewritten.
    pub async fn download_from_response(
        &self,
        response: Response,
        request: &DownloadRequest,
        resume: Option<u64>,
    ) -> Result<PathBuf> {
        let append = resume.is_some() && response.status() == StatusCode::PARTIAL_CONTENT;
        let start = if append { resume.unwrap_or(0) } else { 0 };
        let estimated_total = start + estimate_content_length(response.headers());

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&request.path)
            .await?;

        let writer = ChunkWriter::new(request.chunk_size.unwrap_or(self.config.chunk_size))
            .progress(request.progress.as_ref())
            .cancel(request.cancel.as_ref())
            .bandwidth(self.bandwidth.as_deref());

        match writer
            .write_stream(response.bytes_stream(), &mut file, start, estimated_total)
            .await
        {
            Ok(written) => {
                info!("saved {} ({} bytes)", request.path.display(), written);
                Ok(request.path.clone())
            }
            Err(e) => {
                error!("download of {} failed: {}", request.url, e);
                Err(e)
            }
        }
    }
}

pub(crate) fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(FetchError::Status {
            status,
            url: response.url().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use reqwest::header::HeaderValue;
    use std::sync::Mutex;

    fn range(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RANGE, HeaderValue::from_static(value));
        headers
    }

    fn pieces(
        parts: &[&'static [u8]],
    ) -> impl Stream<Item = std::result::Result<&'static [u8], FetchError>> {
        stream::iter(parts.iter().map(|p| Ok(*p)).collect::<Vec<_>>())
    }

    #[test]
    fn range_start_only_accepts_open_ranges() {
        assert_eq!(range_start(&range("bytes=100-")), Some(100));
        assert_eq!(range_start(&range("bytes=0-")), Some(0));
        assert_eq!(range_start(&range("bytes=0-99")), None);
        assert_eq!(range_start(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn resume_requires_matching_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"hello").unwrap();

        assert_eq!(resume_offset(&path, &range("bytes=5-")).await.unwrap(), Some(5));
        assert_eq!(resume_offset(&path, &range("bytes=4-")).await.unwrap(), None);
        assert_eq!(resume_offset(&path, &HeaderMap::new()).await.unwrap(), None);
        assert_eq!(
            resume_offset(&dir.path().join("missing"), &range("bytes=0-")).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn rechunks_to_fixed_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut file = File::create(&path).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ProgressCallback = Arc::new(move |current, total| {
            sink.lock().unwrap().push((current, total));
        });

        let written = ChunkWriter::new(4)
            .progress(Some(&callback))
            .write_stream(pieces(&[b"abcdef", b"ghij", b"k"]), &mut file, 0, 0)
            .await
            .unwrap();

        assert_eq!(written, 11);
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdefghijk");
        assert_eq!(*seen.lock().unwrap(), vec![(4, 4), (8, 8), (11, 11)]);
    }

    #[tokio::test]
    async fn empty_piece_is_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join("out.bin")).await.unwrap();

        let err = ChunkWriter::new(2)
            .write_stream(pieces(&[b"ab", b"", b"cd"]), &mut file, 0, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TruncatedStream { written: 2 }));
    }

    #[test]
    fn fetcher_takes_the_bandwidth_cap_from_config() {
        let fetcher = Fetcher::new(FetchConfig::default()).unwrap();
        assert!(fetcher.bandwidth.is_none());
        let config = FetchConfig {
            bandwidth: std::num::NonZeroU32::new(4096),
            ..FetchConfig::default()
        };
        let fetcher = Fetcher::new(config).unwrap();
        assert!(fetcher.bandwidth.is_some());
        assert_eq!(fetcher.config().chunk_size, crate::DEFAULT_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn empty_piece_is_truncation_with_progress_attached() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join("out.bin")).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ProgressCallback = Arc::new(move |current, total| {
            sink.lock().unwrap().push((current, total));
        });

        let err = ChunkWriter::new(2)
            .progress(Some(&callback))
            .write_stream(pieces(&[b"ab", b"", b"cd"]), &mut file, 0, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TruncatedStream { written: 2 }));
        assert_eq!(*seen.lock().unwrap(), vec![(2, 4)]);
    }

    #[tokio::test]
    async fn cancelled_token_stops_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join("out.bin")).await.unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let err = ChunkWriter::new(2)
            .cancel(Some(&token))
            .write_stream(pieces(&[b"ab"]), &mut file, 0, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
    }
}
