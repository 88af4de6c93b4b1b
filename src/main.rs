// src/main.rs

use anyhow::{bail, Result};
use clap::Parser;
use segdl::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Segmented, resumable downloader.
#[derive(Debug, Parser)]
#[command(name = "segdl", version, about)]
struct Cli {
    /// URL to download
    url: String,

    /// Destination file or directory (defaults to the server-suggested name)
    destination: Option<PathBuf>,

    /// Number of parallel segments
    #[arg(long, default_value_t = 10)]
    segments: usize,

    /// Times a failed download is resumed before giving up
    #[arg(long, default_value_t = 0)]
    retries: usize,

    /// Expected SHA-256 of the finished file
    #[arg(long)]
    sha256: Option<String>,

    /// Extra request header, NAME:VALUE (repeatable)
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Connect and read timeout in seconds
    #[arg(long, default_value_t = 20)]
    timeout: u64,

    /// Proxy URL used for all requests
    #[arg(long)]
    proxy: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,
}

fn parse_header(header: &str) -> Result<(String, String), String> {
    let (name, value) = header
        .split_once(':')
        .ok_or_else(|| format!("header '{header}' is not NAME:VALUE"))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

impl Cli {
    fn options(&self) -> DownloadOptions {
        DownloadOptions {
            url: self.url.clone(),
            segments: self.segments,
            retries: self.retries,
            sha256: self.sha256.clone(),
            request: RequestOptions {
                headers: self.headers.iter().cloned().collect(),
                timeout: Duration::from_secs(self.timeout),
                proxy: self.proxy.clone(),
                verify_tls: !self.insecure,
            },
            ..Default::default()
        }
    }
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut options = cli.options();

    let info = Downloader::new(options.clone())?.probe().await?;
    options.destination = match cli.destination {
        Some(path) if path.is_dir() => path.join(&info.filename),
        Some(path) => path,
        None => PathBuf::from(&info.filename),
    };
    println!("Downloading {} -> {}", options.url, options.destination.display());

    let downloader = Arc::new(Downloader::new(options)?);
    let mut task = {
        let downloader = downloader.clone();
        tokio::spawn(async move { downloader.download(&info).await })
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let outcome = loop {
        tokio::select! {
            result = &mut task => break result??,
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping, partial data is kept for resume...");
                downloader.stop();
            }
            _ = ticker.tick() => {
                let done = downloader.downloaded().await;
                match downloader.progress().await {
                    Some(fraction) => println!(
                        "[PROGRESS] {:.2}% ({:.2}/{:.2} MB)",
                        fraction * 100.0,
                        mb(done),
                        mb(downloader.total_size())
                    ),
                    None => println!("[PROGRESS] {:.2} MB", mb(done)),
                }
            }
        }
    };

    match outcome {
        Outcome::Completed => {
            println!("Download complete.");
            Ok(())
        }
        Outcome::Cancelled => {
            println!("Download stopped. Run the same command again to resume.");
            Ok(())
        }
        Outcome::Failed => bail!("download failed, run again to resume"),
    }
}
