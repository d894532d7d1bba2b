use std::path::PathBuf;

use clap::{Subcommand, ValueEnum};
use omnifetch::SevenZipBackend;

/// How `.7z` archives get extracted.
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum SevenZipMode {
    /// Native 7z binary when one is on PATH, else the built-in decoder
    Auto,
    /// Native 7z binary first
    Native,
    /// Built-in decoder only
    Library,
}

impl From<SevenZipMode> for SevenZipBackend {
    fn from(mode: SevenZipMode) -> Self {
        match mode {
            SevenZipMode::Auto => SevenZipBackend::Auto,
            SevenZipMode::Native => SevenZipBackend::Native,
            SevenZipMode::Library => SevenZipBackend::Library,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download a URL, routing Google Drive and GitHub links through their flows
    Get {
        url: String,

        /// Destination file (defaults to the URL's last path segment)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Resume from the bytes already in the destination file
        #[arg(short = 'c', long = "continue")]
        resume: bool,

        /// Expected SHA-256 of the finished file
        #[arg(long)]
        sha256: Option<String>,

        /// Unpack the file afterwards if it is a known archive
        #[arg(short = 'x', long)]
        unpack: bool,
    },

    /// GitHub retrieval: single files, whole repositories or directories
    #[command(subcommand)]
    Github(GithubCommand),

    /// Download a Google Drive file by id
    Gdrive {
        file_id: String,

        /// Destination file (defaults to the Drive file name when --api-key is given)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Drive API key, used to look up the file name
        #[arg(long, env = "GDRIVE_API_KEY")]
        api_key: Option<String>,

        /// Keep Drive cookies in this file between runs
        #[arg(long)]
        cookies: Option<PathBuf>,

        /// Start over instead of resuming a partial download
        #[arg(long)]
        no_resume: bool,

        /// Expected SHA-256 of the finished file
        #[arg(long)]
        sha256: Option<String>,
    },

    /// Unpack an archive next to itself
    Unpack {
        path: PathBuf,

        /// Keep the archive after extracting it
        #[arg(short = 'k', long)]
        keep: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum GithubCommand {
    /// Download a single file (usually a raw.githubusercontent.com URL)
    File {
        url: String,

        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        #[arg(long)]
        sha256: Option<String>,
    },

    /// Download and unpack a branch of a repository
    Repo {
        /// user/repo
        repository: String,

        #[arg(short = 'b', long, default_value = "main")]
        branch: String,

        /// Directory to unpack into
        #[arg(short = 'd', long = "dir", default_value = ".")]
        dir: PathBuf,
    },

    /// Download every file of a repository directory
    Dir {
        /// user/repo
        repository: String,

        /// Directory inside the repository
        path: String,

        /// Directory to save files into
        #[arg(short = 'd', long = "dir", default_value = ".")]
        dir: PathBuf,

        /// Only files whose names end with this (e.g. .json)
        #[arg(short = 't', long = "type")]
        file_type: Option<String>,
    },
}
