use std::path::{Path, PathBuf};

use log::{info, warn};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::archive::{unpack_archive, zip_root_name, UnpackOptions};
use crate::config::default_headers;
use crate::downloader::{DownloadRequest, Fetcher};
use crate::error::{FetchError, Result};
use crate::limiter::{RateLimit, RequestGate};
use crate::utils::mkdir_full_perms;

/// One item of a `GET /repos/{user}/{repo}/contents/{dir}` listing.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentEntry {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub name: Option<String>,
    pub download_url: Option<String>,
}

impl ContentEntry {
    /// `(name, download_url)` for plain files passing the optional suffix filter.
    fn downloadable(&self, file_type: Option<&str>) -> Option<(&str, &str)> {
        let (kind, name, url) = (
            self.kind.as_deref()?,
            self.name.as_deref()?,
            self.download_url.as_deref()?,
        );
        if kind != "file" || file_type.map_or(false, |ext| !name.ends_with(ext)) {
            return None;
        }
        // Listing names are bare file names; anything else would escape the target dir.
        if name.contains('/') || name.contains('\\') || name == ".." {
            return None;
        }
        Some((name, url))
    }
}

/// The given header, or the default one, with `Authorization: token ...` when a token is set.
pub fn github_header(header: Option<HeaderMap>, token: Option<&str>) -> Result<HeaderMap> {
    let mut header = header.unwrap_or_else(default_headers);
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        let value = HeaderValue::from_str(&format!("token {}", token))
            .map_err(|e| FetchError::InvalidHeader(e.to_string()))?;
        header.insert(AUTHORIZATION, value);
    }
    Ok(header)
}

/// GitHub retrieval flows, gated by the GitHub quotas of the fetcher's registry.
#[derive(Clone)]
pub struct GitHub {
    fetcher: Fetcher,
    token: Option<String>,
}

impl GitHub {
    pub fn new(fetcher: Fetcher) -> Self {
        Self { fetcher, token: None }
    }

    /// Authenticates requests and moves them onto the authenticated quota.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    pub fn gate(&self) -> RequestGate {
        let config = self.fetcher.config();
        let limit = if self.is_authenticated() {
            RateLimit::github_authenticated()
        } else {
            RateLimit::github()
        };
        RequestGate::new(config.quotas.clone(), limit)
            .reschedule(config.reschedule)
            .retry(config.retry.clone())
    }

    fn header(&self, header: Option<HeaderMap>) -> Result<HeaderMap> {
        let header = header.or_else(|| Some(self.fetcher.config().headers.clone()));
        github_header(header, self.token.as_deref())
    }

    /// Fetches a JSON document (API response or raw data file).
    pub async fn get_data_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let header = self.header(None)?;
        self.gate()
            .run(|| async {
                let body = self.fetcher.get(url, header.clone()).await?.text().await?;
                Ok(serde_json::from_str::<T>(&body)?)
            })
            .await
    }

    /// Downloads one file through the quota gate.
    pub async fn download_file(&self, request: DownloadRequest) -> Result<PathBuf> {
        let header = self.header(request.headers.clone())?;
        let request = request.headers(header);
        self.gate()
            .run(|| self.fetcher.download_file(request.clone()))
            .await
    }

    /// Downloads `branch` of `user/repo` as a zip, unpacks it into `path` and
    /// returns the unpacked top-level directory.
    pub async fn download_repository(
        &self,
        user: &str,
        repo: &str,
        path: &Path,
        branch: &str,
    ) -> Result<PathBuf> {
        let url = format!(
            "{}/{}/{}/archive/refs/heads/{}.zip",
            self.fetcher.config().github_web.trim_end_matches('/'),
            user,
            repo,
            branch
        );
        let temp = path.join("temp.zip");
        self.download_file(DownloadRequest::new(url, &temp)).await?;

        let options = UnpackOptions {
            remove: true,
            ..self.fetcher.config().unpack.clone()
        };
        let root = tokio::task::spawn_blocking(move || {
            let root = zip_root_name(&temp)?;
            unpack_archive(&temp, &options)?;
            Ok::<_, FetchError>(root)
        })
        .await
        .map_err(|e| FetchError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        let root = root.unwrap_or_else(|| format!("{}-{}", repo, branch));
        let extracted = path.join(root);
        info!("{}/{}@{} unpacked to {}", user, repo, branch, extracted.display());
        Ok(extracted)
    }

    /// Downloads every file of `repo_dir` into `path`, optionally only names
    /// ending in `file_type`.
    ///
    /// Failures never propagate: a listing that can't be fetched yields an
    /// empty list and a file that can't be fetched is skipped.
    pub async fn download_directory_files(
        &self,
        user: &str,
        repo: &str,
        repo_dir: &str,
        path: &Path,
        file_type: Option<&str>,
    ) -> Vec<PathBuf> {
        let url = format!(
            "{}/repos/{}/{}/contents/{}",
            self.fetcher.config().github_api.trim_end_matches('/'),
            user,
            repo,
            repo_dir.trim_start_matches('/')
        );
        let mut files = Vec::new();

        if let Err(e) = mkdir_full_perms(path).await {
            warn!("Couldn't create {}: {}", path.display(), e);
            return files;
        }

        let entries: Vec<ContentEntry> = match self.get_data_json(&url).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Couldn't retrieve GitHub directory information! URL: {} ({})", url, e);
                return files;
            }
        };

        for entry in &entries {
            let Some((name, download_url)) = entry.downloadable(file_type) else {
                continue;
            };
            let request = DownloadRequest::new(download_url, path.join(name));
            match self.download_file(request).await {
                Ok(saved) => files.push(saved),
                Err(e) => warn!("Download failed: {} ({})", download_url, e),
            }
        }
        files
    }
}
