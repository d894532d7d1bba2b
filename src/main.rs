mod cli;
mod commands;

use std::num::NonZeroU32;

use anyhow::Result;
use clap::Parser;
use omnifetch::{FetchConfig, Fetcher};

use crate::cli::{Command, SevenZipMode};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// GitHub token; moves GitHub requests onto the authenticated quota
    #[arg(long, env = "GITHUB_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    /// Chunk size for writes, in bytes
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    /// Fail when a quota is exhausted instead of waiting for it
    #[arg(long, global = true)]
    no_wait: bool,

    /// Bandwidth cap in bytes per second
    #[arg(long, global = true)]
    rate_limit: Option<u32>,

    /// 7z extraction backend (overrides USE_7ZIP)
    #[arg(long = "seven-zip", value_enum, global = true)]
    seven_zip: Option<SevenZipMode>,
}

impl Args {
    fn config(&self) -> FetchConfig {
        let mut config = FetchConfig::default();
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size.max(1);
        }
        config.reschedule = !self.no_wait;
        config.bandwidth = self.rate_limit.and_then(NonZeroU32::new);
        if let Some(mode) = self.seven_zip {
            config.unpack.seven_zip = mode.into();
        }
        config
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let fetcher = Fetcher::new(args.config())?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        match args.command {
            Command::Get {
                url,
                output,
                resume,
                sha256,
                unpack,
            } => commands::get(&fetcher, args.token, url, output, resume, sha256, unpack).await,
            Command::Github(command) => commands::github(&fetcher, args.token, command).await,
            Command::Gdrive {
                file_id,
                output,
                api_key,
                cookies,
                no_resume,
                sha256,
            } => {
                commands::gdrive(&fetcher, file_id, output, api_key, cookies, !no_resume, sha256).await
            }
            Command::Unpack { path, keep } => commands::unpack(&fetcher, path, keep).await,
        }
    })
}
