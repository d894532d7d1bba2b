use std::collections::BTreeMap;
use std::path::Path;

use reqwest::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};
use tokio::fs;

use crate::error::{FetchError, Result};

/// Google Drive hands these out per confirmation page; they are useless on a later run.
const TRANSIENT_PREFIX: &str = "download_warning_";

/// Cookies carried across the hops of a Google Drive download.
///
/// Persisted as a JSON list of `[key, value]` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    entries: BTreeMap<String, String>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a jar from disk; a missing file yields an empty jar.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        let pairs: Vec<(String, String)> = serde_json::from_str(&content)?;
        Ok(Self {
            entries: pairs.into_iter().collect(),
        })
    }

    /// Writes every cookie except the transient `download_warning_` ones.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let pairs: Vec<(&String, &String)> = self
            .entries
            .iter()
            .filter(|(k, _)| !k.starts_with(TRANSIENT_PREFIX))
            .collect();
        fs::write(path, serde_json::to_string(&pairs)?).await?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records every `Set-Cookie` of a response.
    pub fn absorb(&mut self, headers: &HeaderMap) {
        for value in headers.get_all(SET_COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            let pair = raw.split(';').next().unwrap_or_default();
            if let Some((key, value)) = pair.split_once('=') {
                let key = key.trim();
                if !key.is_empty() {
                    self.entries.insert(key.to_string(), value.trim().to_string());
                }
            }
        }
    }

    /// Adds a `Cookie` header carrying the jar, replacing any existing one.
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let joined = self
            .entries
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ");
        let value = HeaderValue::from_str(&joined)
            .map_err(|e| FetchError::InvalidHeader(e.to_string()))?;
        headers.insert(COOKIE, value);
        Ok(())
    }
}
