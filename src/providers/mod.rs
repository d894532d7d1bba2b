pub mod gdrive;
pub mod github;

use url::Url;

pub use gdrive::{GoogleDrive, GoogleDriveMetadata};
pub use github::{ContentEntry, GitHub};

/// Which retrieval flow a URL belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    GoogleDrive,
    GitHub,
    Direct,
}

impl Provider {
    pub fn from_url(url_str: &str) -> Provider {
        let host = Url::parse(url_str)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
            .unwrap_or_default();
        match host.as_str() {
            "drive.google.com" | "docs.google.com" | "drive.usercontent.google.com" => {
                Provider::GoogleDrive
            }
            "github.com" | "api.github.com" | "raw.githubusercontent.com" | "codeload.github.com" => {
                Provider::GitHub
            }
            _ => Provider::Direct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_from_host() {
        assert_eq!(
            Provider::from_url("https://drive.google.com/uc?id=abc"),
            Provider::GoogleDrive
        );
        assert_eq!(
            Provider::from_url("https://raw.githubusercontent.com/u/r/main/a.json"),
            Provider::GitHub
        );
        assert_eq!(Provider::from_url("https://example.com/f.zip"), Provider::Direct);
        assert_eq!(Provider::from_url("not a url"), Provider::Direct);
    }
}
