use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::apis::serper::SerperClient;
use crate::cache::LastResultStore;
use crate::generate::scenario::ScenarioApi;
use crate::generate::{AssetDelivery, GenerationClient, GenerationParams, PollPolicy};
use crate::http::HttpFetcher;
use crate::pipeline::{Pipeline, DEFAULT_IMAGE_CONCURRENCY};
use crate::scrape::{Scraper, DEFAULT_CONCURRENCY};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub serper_api_key: Option<String>,
    pub scenario_api_key: Option<String>,
    pub scenario_api_secret: String,
    /// When set, generated images are downloaded here instead of returned as URLs only.
    pub output_dir: Option<PathBuf>,
    pub scrape_concurrency: usize,
    pub scrape_timeout: Duration,
    pub poll_max_attempts: u32,
    /// Fixed poll interval; unset means the adaptive schedule.
    pub poll_interval: Option<Duration>,
    pub image_concurrency: usize,
    pub scenario_base_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        let data_dir = non_empty("PAPER_VISUALIZER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_or_default(&get).join(".paper-visualizer"));

        Self {
            data_dir,
            serper_api_key: non_empty("SERPER_API_KEY"),
            scenario_api_key: non_empty("SCENARIO_API_KEY"),
            scenario_api_secret: get("SCENARIO_API_SECRET").unwrap_or_default(),
            output_dir: non_empty("OUTPUT_DIR").map(PathBuf::from),
            scrape_concurrency: non_empty("SCRAPE_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_CONCURRENCY),
            scrape_timeout: non_empty("SCRAPE_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(crate::http::PAGE_TIMEOUT),
            poll_max_attempts: non_empty("POLL_MAX_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| PollPolicy::adaptive().max_attempts),
            poll_interval: non_empty("POLL_INTERVAL_SECS")
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            image_concurrency: non_empty("IMAGE_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_IMAGE_CONCURRENCY),
            scenario_base_url: non_empty("SCENARIO_BASE_URL"),
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        match self.poll_interval {
            Some(interval) => PollPolicy::fixed(interval, self.poll_max_attempts.max(1)),
            None => PollPolicy::adaptive().with_max_attempts(self.poll_max_attempts),
        }
    }

    pub fn delivery(&self) -> AssetDelivery {
        match &self.output_dir {
            Some(dir) => AssetDelivery::Download { dir: dir.clone() },
            None => AssetDelivery::Url,
        }
    }

    /// Build the pipeline and every client it owns.
    pub fn build_pipeline(&self) -> Result<Pipeline> {
        let fetcher = HttpFetcher::browser(self.scrape_timeout)
            .context("Failed to build page fetcher")?;
        let scraper = Scraper::new(Arc::new(fetcher)).with_concurrency(self.scrape_concurrency);

        let mut pipeline = Pipeline::new(scraper)
            .with_store(LastResultStore::new(&self.data_dir))
            .with_image_concurrency(self.image_concurrency);

        match &self.serper_api_key {
            Some(key) => {
                let client = SerperClient::new(key).context("Failed to build search client")?;
                pipeline = pipeline.with_search(Arc::new(client));
            }
            None => tracing::warn!("Search disabled: SERPER_API_KEY not set"),
        }

        match &self.scenario_api_key {
            Some(key) => {
                let mut api = ScenarioApi::new(key.clone(), self.scenario_api_secret.clone())
                    .context("Failed to build image generation client")?;
                if let Some(base_url) = &self.scenario_base_url {
                    api = api.with_base_url(base_url);
                }
                let generator = GenerationClient::new(Arc::new(api))
                    .with_poll_policy(self.poll_policy())
                    .with_delivery(self.delivery());
                pipeline = pipeline.with_generator(generator, GenerationParams::default());
            }
            None => tracing::warn!("Image generation disabled: SCENARIO_API_KEY not set"),
        }

        Ok(pipeline)
    }

    /// Return a list of service status descriptions.
    pub fn service_status(&self) -> Vec<ServiceStatus> {
        vec![
            ServiceStatus {
                name: "search".into(),
                enabled: self.serper_api_key.is_some(),
                note: if self.serper_api_key.is_some() {
                    "Serper API key set".into()
                } else {
                    "Disabled: SERPER_API_KEY not set".into()
                },
            },
            ServiceStatus {
                name: "scraper".into(),
                enabled: true,
                note: format!(
                    "{} concurrent fetches, {}s timeout",
                    self.scrape_concurrency,
                    self.scrape_timeout.as_secs()
                ),
            },
            ServiceStatus {
                name: "image_generation".into(),
                enabled: self.scenario_api_key.is_some(),
                note: match (&self.scenario_api_key, &self.output_dir) {
                    (None, _) => "Disabled: SCENARIO_API_KEY not set".into(),
                    (Some(_), Some(dir)) => format!("Downloading images to {}", dir.display()),
                    (Some(_), None) => "Returning image URLs".into(),
                },
            },
            ServiceStatus {
                name: "cache".into(),
                enabled: true,
                note: format!("Last result in {}", self.data_dir.display()),
            },
        ]
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub enabled: bool,
    pub note: String,
}

fn home_or_default(get: &impl Fn(&str) -> Option<String>) -> PathBuf {
    get("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}
