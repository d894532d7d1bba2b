use std::path::{Path, PathBuf};

use reqwest::header::{HeaderMap, CONTENT_LENGTH};
use tokio::fs;
use url::Url;

use crate::error::Result;

pub fn get_filename_from_url(url_str: &str) -> Result<String> {
    let url = Url::parse(url_str)?;

    if let Some(segments) = url.path_segments() {
        if let Some(filename) = segments.last() {
            if !filename.is_empty() {
                return Ok(filename.to_string());
            }
        }
    }

    // Fallback if no filename found in path
    Ok(format!("download_{}", uuid::Uuid::new_v4()))
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

/// Best-effort size from the `Content-Length` header.
///
/// Non-digit characters are dropped before parsing and anything unusable
/// counts as zero, so a bogus header can never abort a download.
pub fn estimate_content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .map(|raw| raw.chars().filter(char::is_ascii_digit).collect::<String>())
        .and_then(|digits| digits.parse::<u64>().ok())
        .unwrap_or(0)
}

/// Creates `path` (and parents) with full permissions if it doesn't exist.
pub async fn mkdir_full_perms(path: &Path) -> Result<PathBuf> {
    if fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false) {
        return Ok(path.to_path_buf());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o777);
    builder.create(path).await?;
    Ok(path.to_path_buf())
}

/// Finds or creates the temporary file standing in for `path` while it downloads.
///
/// The temporary name is `path` with its extension swapped for `ext`, plus a
/// random suffix. With `allow_existing`, a previous temporary file for the
/// same destination is reused so its bytes can be resumed.
pub async fn temporary_file(path: &Path, ext: &str, allow_existing: bool) -> Result<PathBuf> {
    let temp = path.with_extension(ext.trim_start_matches('.'));
    let temp_name = temp
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    if allow_existing {
        let mut entries = fs::read_dir(&parent).await?;
        while let Some(entry) = entries.next_entry().await? {
            let candidate = entry.path();
            if entry.file_type().await?.is_dir() || candidate == path {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with(&temp_name) {
                return Ok(candidate);
            }
        }
    }

    let fresh = parent.join(format!("{}{}", temp_name, uuid::Uuid::new_v4().simple()));
    fs::File::create(&fresh).await?;
    Ok(fresh)
}

/// Turns a link scraped out of an HTML or JSON page into a usable URL string.
///
/// Undoes percent-encoding, HTML entities and `\uXXXX` / `\/` escapes.
pub fn decode_url(raw: &str) -> String {
    let unquoted = urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string());
    let unescaped = unescape_html(&unquoted);
    unescape_json(&unescaped)
}

fn unescape_html(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn unescape_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('/') => {
                chars.next();
                out.push('/');
            }
            Some('u') => {
                let hex: String = chars.clone().skip(1).take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) if hex.len() == 4 => {
                        for _ in 0..5 {
                            chars.next();
                        }
                        out.push(decoded);
                    }
                    _ => out.push(c),
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Parses a loose boolean ("yes", "off", "1", ...), `None` when unrecognized.
pub fn str_to_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "y" | "t" | "on" | "yes" | "true" => Some(true),
        "0" | "n" | "f" | "off" | "no" | "false" => Some(false),
        _ => None,
    }
}
