use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::parser::DEFAULT_ENDPOINT_MARKER;

const ENV_PREFIX: &str = "TWEET_SCRAPER";
const DEFAULT_CONFIG_NAME: &str = "tweet_scraper";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub input_csv: PathBuf,
    pub links_file: PathBuf,
    pub output_file: PathBuf,
    /// Pages visited at the same time.
    pub concurrency: usize,
    /// Upper bound on one full visit (launch, load, extract).
    pub page_timeout_secs: u64,
    /// How long to wait for `ready_selector` after navigation.
    pub ready_timeout_secs: u64,
    pub ready_selector: String,
    pub endpoint_marker: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub headless: bool,
    /// Chrome's sandbox. Containers running as root usually need it off.
    pub sandbox: bool,
    pub chrome_path: Option<PathBuf>,
    pub dedup_links: bool,
    pub iso_dates: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            input_csv: PathBuf::from("links.csv"),
            links_file: PathBuf::from("cleaned_links.txt"),
            output_file: PathBuf::from("tweet_metadata.csv"),
            concurrency: 5,
            page_timeout_secs: 90,
            ready_timeout_secs: 30,
            ready_selector: "[data-testid='tweet']".to_string(),
            endpoint_marker: DEFAULT_ENDPOINT_MARKER.to_string(),
            viewport_width: 1920,
            viewport_height: 1080,
            headless: true,
            sandbox: true,
            chrome_path: None,
            dedup_links: false,
            iso_dates: false,
        }
    }
}

impl Settings {
    /// Defaults, then the config file, then `TWEET_SCRAPER_*` variables.
    /// Call [`Settings::validate`] once command-line overrides are applied.
    ///
    /// Without an explicit path, `tweet_scraper.{toml,yaml,json}` in the
    /// working directory is used when present.
    pub fn load(config_file: Option<&Path>) -> Result<Settings> {
        Self::build(config_file, Environment::with_prefix(ENV_PREFIX))
    }

    fn build(config_file: Option<&Path>, env: Environment) -> Result<Settings> {
        let file = match config_file {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        let mut settings: Settings = Config::builder()
            .add_source(file)
            .add_source(env)
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        if settings.chrome_path.is_none() {
            settings.chrome_path = std::env::var_os("CHROME_BIN").map(PathBuf::from);
        }

        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.page_timeout_secs == 0 || self.ready_timeout_secs == 0 {
            bail!("timeouts must be greater than zero");
        }
        if self.endpoint_marker.is_empty() {
            bail!("endpoint_marker must not be empty");
        }
        if self.ready_selector.is_empty() {
            bail!("ready_selector must not be empty");
        }
        Ok(())
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}
