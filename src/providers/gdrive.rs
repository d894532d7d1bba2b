//! Google Drive downloads through the confirmation-page flow.
//!
//! Large or flagged files answer the first request with an HTML interstitial
//! instead of the bytes. The real link is scraped out of that page and
//! followed, hop after hop, until a response carries `Content-Disposition`.

use std::path::PathBuf;

use log::{debug, error, info};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_DISPOSITION, RANGE};
use reqwest::Response;
use serde::{Deserialize, Deserializer};
use tokio::fs;
use url::Url;

use crate::cookies::CookieJar;
use crate::downloader::{resume_offset, DownloadRequest, Fetcher};
use crate::error::{FetchError, Result};
use crate::utils::{decode_url, mkdir_full_perms, temporary_file};

const DOCS_HOST: &str = "https://docs.google.com";

static EXPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"href="(/uc\?export=download[^"]+)"#).expect("valid regex"));
static FORM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"id="download-form" action="(.+?)""#).expect("valid regex"));
static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""downloadUrl":"([^"]+)"#).expect("valid regex"));
static ERROR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<p class="uc-error-subcaption">(.*)</p>"#).expect("valid regex"));

/// Finds the real download link in a confirmation page.
///
/// Lines are scanned in order; on each line a Docs export link wins over
/// the download form, which wins over an embedded JSON `downloadUrl`. An
/// error caption met first ends the search with [`FetchError::AccessDenied`].
pub fn confirmation_url(contents: &str) -> Result<String> {
    for line in contents.lines() {
        if let Some(m) = EXPORT_RE.captures(line) {
            return Ok(decode_url(&format!("{}{}", DOCS_HOST, &m[1])));
        }
        if let Some(m) = FORM_RE.captures(line) {
            return Ok(decode_url(&m[1]));
        }
        if let Some(m) = URL_RE.captures(line) {
            return Ok(decode_url(&m[1]));
        }
        if let Some(m) = ERROR_RE.captures(line) {
            return Err(FetchError::AccessDenied(m[1].to_string()));
        }
    }
    Err(FetchError::AccessDenied(
        "Google Drive file has been made private or has reached its daily request limit."
            .to_string(),
    ))
}

/// The fields of a Drive v3 file resource this crate cares about.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GoogleDriveMetadata {
    #[serde(default)]
    pub description: Option<String>,
    pub name: String,
    #[serde(deserialize_with = "size_from_string_or_number")]
    pub size: u64,
}

// Drive serializes int64 fields as JSON strings.
fn size_from_string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Number(u64),
        Text(String),
    }
    match Size::deserialize(deserializer)? {
        Size::Number(n) => Ok(n),
        Size::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Clone)]
pub struct GoogleDrive {
    fetcher: Fetcher,
    cookies: Option<PathBuf>,
}

impl GoogleDrive {
    pub fn new(fetcher: Fetcher) -> Self {
        Self { fetcher, cookies: None }
    }

    /// Persists the session's cookies to `path` after every hop and loads them on start.
    pub fn with_cookies(mut self, path: Option<PathBuf>) -> Self {
        self.cookies = path;
        self
    }

    /// Follows confirmation pages from `url` until a direct download answers.
    ///
    /// Gives up with [`FetchError::TooManyHops`] after the configured number
    /// of requests, so a page linking to itself can't loop forever.
    pub async fn process_url(&self, url: &str, headers: &HeaderMap, jar: &mut CookieJar) -> Result<Response> {
        let max_hops = self.fetcher.config().max_hops.max(1);
        let mut current = url.to_string();

        for hop in 1..=max_hops {
            let mut hop_headers = headers.clone();
            jar.apply(&mut hop_headers)?;
            let response = self.fetcher.get(&current, hop_headers).await?;

            jar.absorb(response.headers());
            if let Some(path) = &self.cookies {
                jar.save(path).await?;
            }

            if response.headers().contains_key(CONTENT_DISPOSITION) {
                debug!("direct download reached after {} hop(s)", hop);
                return Ok(response);
            }

            let base = response.url().clone();
            let body = response.text().await?;
            let next = confirmation_url(&body)?;
            current = base.join(&next).map(String::from).unwrap_or(next);
            debug!("confirmation page {} points to {}", hop, current);
        }
        Err(FetchError::TooManyHops(max_hops))
    }

    /// Downloads a Drive file (ideally `https://drive.google.com/uc?id={file_id}`)
    /// to `request.path`, resuming a previous partial `.drive` file when allowed.
    pub async fn download_file(&self, request: DownloadRequest, allow_resume: bool) -> Result<PathBuf> {
        let path = request.path.clone();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                mkdir_full_perms(parent).await?;
            }
        }

        let temp = temporary_file(&path, ".drive", allow_resume).await?;
        let size = fs::metadata(&temp).await?.len();
        let mut headers = self.fetcher.headers_or_default(request.headers.clone());
        if size > 0 {
            let range = HeaderValue::from_str(&format!("bytes={}-", size))
                .map_err(|e| FetchError::InvalidHeader(e.to_string()))?;
            headers.insert(RANGE, range);
        }

        let mut jar = match &self.cookies {
            Some(path) => CookieJar::load(path).await?,
            None => CookieJar::new(),
        };

        let response = match self.process_url(&request.url, &headers, &mut jar).await {
            Ok(response) => response,
            Err(e) => {
                error!("Google Drive download failed! {} | {}: {}", name, request.url, e);
                return Err(e);
            }
        };

        let resume = resume_offset(&temp, &headers).await?;
        let temp_request = DownloadRequest {
            path: temp.clone(),
            ..request
        };
        self.fetcher
            .download_from_response(response, &temp_request, resume)
            .await?;

        if temp != path {
            fs::rename(&temp, &path).await?;
        }
        info!("Google Drive file saved to {}", path.display());
        Ok(path)
    }

    /// Name, size and description of a Drive file, `None` if the API won't tell.
    pub async fn get_metadata(&self, file_id: &str, api_key: &str) -> Option<GoogleDriveMetadata> {
        let base = self.fetcher.config().gdrive_api.trim_end_matches('/');
        let url = Url::parse_with_params(
            &format!("{}/files/{}", base, file_id),
            &[("alt", "json"), ("fields", "description,name,size"), ("key", api_key)],
        )
        .ok()?;

        let response = self
            .fetcher
            .client()
            .get(url)
            .headers(self.fetcher.config().headers.clone())
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            debug!("metadata request for {} returned {}", file_id, response.status());
            return None;
        }
        let body = response.text().await.ok()?;
        match serde_json::from_str::<GoogleDriveMetadata>(&body) {
            Ok(meta) => Some(meta),
            Err(e) => {
                debug!("unexpected metadata for {}: {}", file_id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_link_is_rebased_on_docs() {
        let page = r#"<a id="uc-download-link" href="/uc?export=download&amp;confirm=abc&amp;id=xyz">"#;
        assert_eq!(
            confirmation_url(page).unwrap(),
            "https://docs.google.com/uc?export=download&confirm=abc&id=xyz"
        );
    }

    #[test]
    fn form_action_is_used() {
        let page = "<html>\n<form id=\"download-form\" action=\"https://drive.usercontent.google.com/download?id=xyz&amp;confirm=t\" method=\"get\">\n</html>";
        assert_eq!(
            confirmation_url(page).unwrap(),
            "https://drive.usercontent.google.com/download?id=xyz&confirm=t"
        );
    }

    #[test]
    fn json_download_url_is_unescaped() {
        let page = r#"{"downloadUrl":"https:\/\/example.com\/file?id=abc&x=1"}"#;
        assert_eq!(confirmation_url(page).unwrap(), "https://example.com/file?id=abc&x=1");
    }

    #[test]
    fn earlier_line_wins_over_pattern_priority() {
        let page = "<p class=\"uc-error-subcaption\">Too many users have viewed or downloaded this file recently.</p>\n\
                    <a href=\"/uc?export=download&id=1\">";
        match confirmation_url(page) {
            Err(FetchError::AccessDenied(reason)) => {
                assert_eq!(reason, "Too many users have viewed or downloaded this file recently.")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_page_is_denied() {
        assert!(matches!(
            confirmation_url("<html>nothing here</html>"),
            Err(FetchError::AccessDenied(reason)) if reason.contains("private")
        ));
    }

    #[test]
    fn metadata_size_accepts_strings() {
        let meta: GoogleDriveMetadata =
            serde_json::from_str(r#"{"name": "a.psd", "size": "1024"}"#).unwrap();
        assert_eq!(meta.size, 1024);
        assert_eq!(meta.description, None);
        let meta: GoogleDriveMetadata =
            serde_json::from_str(r#"{"name": "a.psd", "size": 7, "description": "d"}"#).unwrap();
        assert_eq!(meta.size, 7);
        assert_eq!(meta.description.as_deref(), Some("d"));
    }
}
