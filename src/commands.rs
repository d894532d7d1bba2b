use anyhow::{bail, Context, Result};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use omnifetch::downloader::DownloadRequest;
use omnifetch::utils::{get_filename_from_url, sanitize_filename};
use omnifetch::hashing::verify_sha256;
use omnifetch::{calculate_hash, unpack_archive_async, Fetcher, GitHub, GoogleDrive, Provider, UnpackOptions};
use reqwest::header::{HeaderValue, RANGE};
use std::path::{Path, PathBuf};
use tokio::fs;
use url::Url;

use crate::cli::GithubCommand;

fn progress_bar(name: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb.set_message(name.to_string());
    pb
}

/// Attaches a fresh progress bar to `request`; the bar is returned so the caller can finish it.
fn with_progress(request: DownloadRequest) -> (DownloadRequest, ProgressBar) {
    let name = request
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let pb = progress_bar(&name);
    let bar = pb.clone();
    let request = request.on_progress(move |current, total| {
        bar.set_length(total);
        bar.set_position(current);
    });
    (request, pb)
}

fn default_output(url: &str) -> Result<PathBuf> {
    let name = get_filename_from_url(url).context("Invalid URL")?;
    Ok(PathBuf::from(sanitize_filename(&name)))
}

async fn verify(path: &Path, expected: Option<String>) -> Result<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    if !verify_sha256(path, &expected).await? {
        let actual = calculate_hash(path).await?;
        bail!("Hash mismatch for {:?}: expected {}, got {}", path, expected, actual);
    }
    println!("Hash verified: {}", expected.trim());
    Ok(())
}

/// `id` query parameter, or the `/file/d/{id}/` path segment of a Drive link.
fn drive_file_id(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    if let Some((_, id)) = url.query_pairs().find(|(k, _)| k == "id") {
        return Some(id.into_owned());
    }
    let segments: Vec<&str> = url.path_segments()?.collect();
    segments
        .windows(2)
        .find(|pair| pair[0] == "d")
        .map(|pair| pair[1].to_string())
}

fn drive_url(file_id: &str) -> String {
    format!("https://drive.google.com/uc?id={}", file_id)
}

pub async fn get(
    fetcher: &Fetcher,
    token: Option<String>,
    url: String,
    output: Option<PathBuf>,
    resume: bool,
    sha256: Option<String>,
    unpack: bool,
) -> Result<()> {
    let provider = Provider::from_url(&url);
    let output = match output {
        Some(output) => output,
        None => default_output(&url)?,
    };

    let saved = match provider {
        Provider::GoogleDrive => {
            let id = drive_file_id(&url).context("No Google Drive file id in URL")?;
            let (request, pb) = with_progress(DownloadRequest::new(drive_url(&id), &output));
            let result = GoogleDrive::new(fetcher.clone()).download_file(request, resume).await;
            pb.finish();
            result?
        }
        Provider::GitHub | Provider::Direct => {
            let mut request = DownloadRequest::new(url.as_str(), &output);
            if resume {
                let existing = fs::metadata(&output).await.map(|m| m.len()).unwrap_or(0);
                if existing > 0 {
                    let mut headers = fetcher.config().headers.clone();
                    headers.insert(RANGE, HeaderValue::from_str(&format!("bytes={}-", existing))?);
                    request = request.headers(headers);
                }
            }
            let (request, pb) = with_progress(request);
            let result = if provider == Provider::GitHub {
                GitHub::new(fetcher.clone()).with_token(token).download_file(request).await
            } else {
                fetcher.download_file(request).await
            };
            pb.finish();
            result?
        }
    };

    let size = fs::metadata(&saved).await.map(|m| m.len()).unwrap_or(0);
    println!("Saved {:?} ({})", saved, HumanBytes(size));
    verify(&saved, sha256).await?;

    if unpack {
        let options = fetcher.config().unpack.clone();
        if let Some(out) = unpack_archive_async(saved, options).await? {
            println!("Unpacked into {:?}", out);
        }
    }
    Ok(())
}

fn split_repository(repository: &str) -> Result<(&str, &str)> {
    match repository.split_once('/') {
        Some((user, repo)) if !user.is_empty() && !repo.is_empty() => Ok((user, repo)),
        _ => bail!("Expected user/repo, got '{}'", repository),
    }
}

pub async fn github(fetcher: &Fetcher, token: Option<String>, command: GithubCommand) -> Result<()> {
    let github = GitHub::new(fetcher.clone()).with_token(token);
    match command {
        GithubCommand::File { url, output, sha256 } => {
            let output = match output {
                Some(output) => output,
                None => default_output(&url)?,
            };
            let (request, pb) = with_progress(DownloadRequest::new(url.as_str(), &output));
            let result = github.download_file(request).await;
            pb.finish();
            let saved = result?;
            println!("Saved {:?}", saved);
            verify(&saved, sha256).await
        }
        GithubCommand::Repo { repository, branch, dir } => {
            let (user, repo) = split_repository(&repository)?;
            let extracted = github
                .download_repository(user, repo, &dir, &branch)
                .await
                .with_context(|| format!("Failed to download {}@{}", repository, branch))?;
            println!("Repository unpacked into {:?}", extracted);
            Ok(())
        }
        GithubCommand::Dir {
            repository,
            path,
            dir,
            file_type,
        } => {
            let (user, repo) = split_repository(&repository)?;
            let files = github
                .download_directory_files(user, repo, &path, &dir, file_type.as_deref())
                .await;
            for file in &files {
                println!("{:?}", file);
            }
            println!("Downloaded {} file(s) from {}/{}", files.len(), repository, path);
            Ok(())
        }
    }
}

pub async fn gdrive(
    fetcher: &Fetcher,
    file_id: String,
    output: Option<PathBuf>,
    api_key: Option<String>,
    cookies: Option<PathBuf>,
    resume: bool,
    sha256: Option<String>,
) -> Result<()> {
    let drive = GoogleDrive::new(fetcher.clone()).with_cookies(cookies);

    let output = match output {
        Some(output) => output,
        None => {
            let metadata = match &api_key {
                Some(key) => drive.get_metadata(&file_id, key).await,
                None => None,
            };
            match metadata {
                Some(meta) => {
                    println!("{} ({})", meta.name, HumanBytes(meta.size));
                    PathBuf::from(sanitize_filename(&meta.name))
                }
                None => PathBuf::from(sanitize_filename(&file_id)),
            }
        }
    };

    let (request, pb) = with_progress(DownloadRequest::new(drive_url(&file_id), &output));
    let result = drive.download_file(request, resume).await;
    pb.finish();
    let saved = result.with_context(|| format!("Google Drive download of {} failed", file_id))?;
    println!("Saved {:?}", saved);
    verify(&saved, sha256).await
}

pub async fn unpack(fetcher: &Fetcher, path: PathBuf, keep: bool) -> Result<()> {
    let options = UnpackOptions {
        remove: !keep,
        ..fetcher.config().unpack.clone()
    };
    match unpack_archive_async(path.clone(), options).await? {
        Some(out) => println!("Unpacked {:?} into {:?}", path, out),
        None => println!("{:?} is not a recognised archive, nothing to do", path),
    }
    Ok(())
}
