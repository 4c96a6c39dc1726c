mod fetcher;
mod links;
mod output;
mod parser;
mod scraper;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use fetcher::{ChromeFetcher, FetchOptions};
use output::WriteOptions;
use scraper::ScrapeOptions;
use settings::Settings;

#[derive(Parser)]
#[command(name = "tweet_scraper", about = "Scrape X post metadata via headless Chromium")]
struct Cli {
    /// Config file (default: ./tweet_scraper.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep only post links from a raw CSV and write them one per line
    Filter {
        #[command(flatten)]
        paths: PathArgs,
        /// Write each link once
        #[arg(long)]
        dedup: bool,
    },
    /// Scrape every link in the links file and write the results
    Scrape {
        #[command(flatten)]
        paths: PathArgs,
        #[command(flatten)]
        scrape: ScrapeArgs,
    },
    /// Filter + scrape in one go
    Run {
        #[command(flatten)]
        paths: PathArgs,
        #[command(flatten)]
        scrape: ScrapeArgs,
        /// Write each link once
        #[arg(long)]
        dedup: bool,
    },
    /// Summarize a results file
    Stats {
        /// Results file (default: configured output file)
        file: Option<PathBuf>,
    },
}

#[derive(Args)]
struct PathArgs {
    /// Raw CSV with candidate links
    #[arg(long)]
    input: Option<PathBuf>,
    /// Filtered links file
    #[arg(long)]
    links: Option<PathBuf>,
    /// Results file
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct ScrapeArgs {
    /// Pages visited at the same time
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,
    /// Per-page timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Write dates as RFC 3339
    #[arg(long)]
    iso_dates: bool,
    /// Show the browser window
    #[arg(long)]
    headful: bool,
    /// Run Chrome without its sandbox (needed in most root containers)
    #[arg(long)]
    no_sandbox: bool,
}

impl PathArgs {
    fn apply(&self, s: &mut Settings) {
        if let Some(p) = &self.input {
            s.input_csv = p.clone();
        }
        if let Some(p) = &self.links {
            s.links_file = p.clone();
        }
        if let Some(p) = &self.output {
            s.output_file = p.clone();
        }
    }
}

impl ScrapeArgs {
    fn apply(&self, s: &mut Settings) {
        if let Some(c) = self.concurrency {
            s.concurrency = c;
        }
        if let Some(t) = self.timeout {
            s.page_timeout_secs = t;
        }
        s.iso_dates |= self.iso_dates;
        if self.headful {
            s.headless = false;
        }
        if self.no_sandbox {
            s.sandbox = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Filter { paths, dedup } => {
            paths.apply(&mut settings);
            settings.dedup_links |= dedup;
            let kept = links::filter_links_file(
                &settings.input_csv,
                &settings.links_file,
                settings.dedup_links,
            )?;
            println!("Kept {} links -> {}", kept, settings.links_file.display());
            Ok(())
        }
        Commands::Scrape { paths, scrape } => {
            paths.apply(&mut settings);
            scrape.apply(&mut settings);
            settings.validate()?;
            scrape_links_file(&settings).await
        }
        Commands::Run {
            paths,
            scrape,
            dedup,
        } => {
            paths.apply(&mut settings);
            scrape.apply(&mut settings);
            settings.dedup_links |= dedup;
            settings.validate()?;

            let kept = links::filter_links_file(
                &settings.input_csv,
                &settings.links_file,
                settings.dedup_links,
            )?;
            println!("Pipeline: {} links after filtering", kept);
            scrape_links_file(&settings).await
        }
        Commands::Stats { file } => {
            let path = file.unwrap_or_else(|| settings.output_file.clone());
            let s = output::summarize(&path)?;
            println!("Rows:          {}", s.rows);
            println!("With text:     {}", s.with_text);
            println!("Not available: {}", s.not_available);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn scrape_links_file(settings: &Settings) -> Result<()> {
    let links = links::load_links(&settings.links_file)?;
    info!(
        "Scraping {} links with {} workers",
        links.len(),
        settings.concurrency
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling outstanding pages");
            let _ = cancel_tx.send(true);
        }
    });

    let fetcher = Arc::new(ChromeFetcher::new(FetchOptions::from(settings)));
    let (results, stats) =
        scraper::scrape_all(fetcher, links, &ScrapeOptions::from(settings), cancel_rx).await?;

    output::write_results(
        &settings.output_file,
        &results,
        WriteOptions {
            iso_dates: settings.iso_dates,
        },
    )?;

    println!(
        "Done: {} scraped ({} ok, {} without data, {} errors) -> {}",
        stats.total,
        stats.ok,
        stats.not_found,
        stats.errors,
        settings.output_file.display()
    );
    Ok(())
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_are_applied_before_validation() {
        let mut settings = Settings {
            concurrency: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let cli = Cli::parse_from(["tweet_scraper", "scrape", "-c", "4", "--no-sandbox"]);
        let Commands::Scrape { paths, scrape } = cli.command else {
            panic!("expected scrape command");
        };
        paths.apply(&mut settings);
        scrape.apply(&mut settings);

        assert_eq!(settings.concurrency, 4);
        assert!(!settings.sandbox);
        settings.validate().unwrap();
    }
}
