use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::apis::{PaperCandidate, PaperSearch, SearchError};
use crate::cache::LastResultStore;
use crate::generate::prompt::build_prompt;
use crate::generate::{
    GenerationClient, GenerationError, GenerationOverrides, GenerationParams, ImageAsset,
    ReferenceImage,
};
use crate::scrape::{AbstractSource, ScrapeResult, Scraper};

pub const DEFAULT_NUM_PAPERS: u32 = 5;
pub const MAX_NUM_PAPERS: u32 = 20;
pub const DEFAULT_IMAGE_CONCURRENCY: usize = 2;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Search is not configured (set SERPER_API_KEY)")]
    SearchUnavailable,
    #[error("Image generation is not configured (set SCENARIO_API_KEY)")]
    GenerationUnavailable,
    #[error("Search failed: {0}")]
    Search(#[from] SearchError),
    #[error("{0}")]
    InvalidReference(String),
}

/// One paper as reported to callers: search metadata, abstract, and images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedPaper {
    pub title: String,
    pub link: String,
    pub snippet: String,
    pub year: Option<u32>,
    #[serde(default)]
    pub authors: String,
    #[serde(default)]
    pub publication_info: String,
    #[serde(default)]
    pub cited_by: u32,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub abstract_source: AbstractSource,
    pub scrape_success: bool,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_paths: Vec<String>,
    /// `None` until generation has been attempted.
    #[serde(default)]
    pub image_success: Option<bool>,
}

impl ProcessedPaper {
    pub fn new(paper: PaperCandidate, scraped: ScrapeResult) -> Self {
        Self {
            title: paper.title,
            link: paper.link,
            snippet: paper.snippet,
            year: paper.year,
            authors: paper.authors,
            publication_info: paper.publication_info,
            cited_by: paper.cited_by,
            abstract_text: scraped.abstract_text,
            abstract_source: scraped.source,
            scrape_success: scraped.success,
            image_urls: Vec::new(),
            image_paths: Vec::new(),
            image_success: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub query: String,
    pub generated_at: DateTime<Utc>,
    pub papers: Vec<ProcessedPaper>,
}

impl PipelineResult {
    pub fn new(query: &str, papers: Vec<ProcessedPaper>) -> Self {
        Self { query: query.to_string(), generated_at: Utc::now(), papers }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedImage {
    pub image_urls: Vec<String>,
    /// Local files, when images are downloaded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_paths: Vec<String>,
    pub success: bool,
}

impl GeneratedImage {
    fn failed() -> Self {
        Self { image_urls: Vec::new(), image_paths: Vec::new(), success: false }
    }

    fn from_assets(assets: Vec<ImageAsset>) -> Self {
        Self {
            image_urls: assets.iter().map(|a| a.url.clone()).collect(),
            image_paths: assets
                .iter()
                .filter_map(|a| a.path.as_ref().map(|p| p.display().to_string()))
                .collect(),
            success: true,
        }
    }
}

pub fn clamp_num_papers(requested: Option<u32>) -> u32 {
    requested.unwrap_or(DEFAULT_NUM_PAPERS).clamp(1, MAX_NUM_PAPERS)
}

/// Search → scrape → (optionally) illustrate. Owns every client it uses.
pub struct Pipeline {
    search: Option<Arc<dyn PaperSearch>>,
    scraper: Scraper,
    generator: Option<GenerationClient>,
    params: GenerationParams,
    store: Option<LastResultStore>,
    image_concurrency: usize,
}

impl Pipeline {
    pub fn new(scraper: Scraper) -> Self {
        Self {
            search: None,
            scraper,
            generator: None,
            params: GenerationParams::default(),
            store: None,
            image_concurrency: DEFAULT_IMAGE_CONCURRENCY,
        }
    }

    pub fn with_search(mut self, search: Arc<dyn PaperSearch>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_generator(mut self, generator: GenerationClient, params: GenerationParams) -> Self {
        self.generator = Some(generator);
        self.params = params;
        self
    }

    pub fn with_store(mut self, store: LastResultStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_image_concurrency(mut self, concurrency: usize) -> Self {
        self.image_concurrency = concurrency.max(1);
        self
    }

    pub fn has_search(&self) -> bool {
        self.search.is_some()
    }

    pub fn has_generator(&self) -> bool {
        self.generator.is_some()
    }

    /// Search and scrape; images are left for `generate_image`.
    pub async fn process(
        &self,
        query: &str,
        num_papers: Option<u32>,
        date_range: Option<&str>,
    ) -> Result<PipelineResult, PipelineError> {
        let search = self.search.as_ref().ok_or(PipelineError::SearchUnavailable)?;
        let num = clamp_num_papers(num_papers);
        tracing::info!("Processing {:?}: up to {} papers via {}", query, num, search.name());

        let candidates = search.search(query, num, date_range).await?;
        let scraped = self.scraper.scrape(&candidates).await;
        let papers = candidates
            .into_iter()
            .zip(scraped)
            .map(|(paper, scrape)| ProcessedPaper::new(paper, scrape))
            .collect();

        let result = PipelineResult::new(query, papers);
        self.remember(&result).await;
        Ok(result)
    }

    /// Full run including an image per paper. Image failures are reported per
    /// paper and never fail the run.
    pub async fn process_with_images(
        &self,
        query: &str,
        num_papers: Option<u32>,
        date_range: Option<&str>,
    ) -> Result<PipelineResult, PipelineError> {
        if self.generator.is_none() {
            return Err(PipelineError::GenerationUnavailable);
        }
        let mut result = self.process(query, num_papers, date_range).await?;

        let requests: Vec<(String, String, Option<u32>)> = result
            .papers
            .iter()
            .map(|p| (p.title.clone(), p.abstract_text.clone(), p.year))
            .collect();
        let overrides = GenerationOverrides::default();
        let overrides = &overrides;

        let images: Vec<GeneratedImage> = stream::iter(requests)
            .map(move |(title, abstract_text, year)| async move {
                self.generate_image(&title, Some(&abstract_text), year, overrides)
                    .await
                    .unwrap_or_else(|_| GeneratedImage::failed())
            })
            .buffered(self.image_concurrency)
            .collect()
            .await;

        for (paper, image) in result.papers.iter_mut().zip(images) {
            paper.image_urls = image.image_urls;
            paper.image_paths = image.image_paths;
            paper.image_success = Some(image.success);
        }
        let illustrated = result.papers.iter().filter(|p| p.image_success == Some(true)).count();
        tracing::info!("Illustrated {}/{} papers", illustrated, result.papers.len());

        self.remember(&result).await;
        Ok(result)
    }

    /// Generate an illustration for one paper. Generation errors are logged
    /// and reported as `success: false`; only missing configuration is an error.
    pub async fn generate_image(
        &self,
        title: &str,
        abstract_text: Option<&str>,
        year: Option<u32>,
        overrides: &GenerationOverrides,
    ) -> Result<GeneratedImage, PipelineError> {
        let generator = self.generator.as_ref().ok_or(PipelineError::GenerationUnavailable)?;
        let prompt = build_prompt(title, abstract_text, year);
        tracing::debug!("Prompt for {:?} is {} chars", title, prompt.len());

        match generator.generate(&prompt, &overrides.apply(&self.params)).await {
            Ok(assets) => Ok(GeneratedImage::from_assets(assets)),
            Err(e) => {
                tracing::warn!("Image generation for {:?} failed: {}", title, e);
                Ok(GeneratedImage::failed())
            }
        }
    }

    /// Transform a local reference image. An unreadable or oversized reference
    /// is an error; generation failures are reported as `success: false`.
    pub async fn transform_image(
        &self,
        image_path: &Path,
        prompt: &str,
        strength: f32,
        overrides: &GenerationOverrides,
    ) -> Result<GeneratedImage, PipelineError> {
        let generator = self.generator.as_ref().ok_or(PipelineError::GenerationUnavailable)?;
        let reference = ReferenceImage::load(image_path).await.map_err(|e| match e {
            GenerationError::InvalidReference(msg) => PipelineError::InvalidReference(msg),
            other => PipelineError::InvalidReference(other.to_string()),
        })?;

        let params = overrides.apply(&self.params);
        match generator.generate_from_image(prompt, &reference, strength, &params).await {
            Ok(assets) => Ok(GeneratedImage::from_assets(assets)),
            Err(e) => {
                tracing::warn!("Transforming {} failed: {}", image_path.display(), e);
                Ok(GeneratedImage::failed())
            }
        }
    }

    pub async fn last_result(&self) -> Option<PipelineResult> {
        let store = self.store.clone()?;
        let loaded = tokio::task::spawn_blocking(move || {
            let loaded = store.load();
            (store, loaded)
        })
        .await;
        match loaded {
            Ok((_, Ok(result))) => result,
            Ok((store, Err(e))) => {
                tracing::warn!("Reading {} failed: {}", store.path().display(), e);
                None
            }
            Err(e) => {
                tracing::warn!("Cache read task failed: {}", e);
                None
            }
        }
    }

    /// Cache writes run on the blocking pool and never fail the run.
    async fn remember(&self, result: &PipelineResult) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let result = result.clone();
        let saved = tokio::task::spawn_blocking(move || {
            let saved = store.save(&result);
            (store, saved)
        })
        .await;
        match saved {
            Ok((_, Ok(()))) => {}
            Ok((store, Err(e))) => {
                tracing::warn!("Caching result to {} failed: {}", store.path().display(), e);
            }
            Err(e) => tracing::warn!("Cache write task failed: {}", e),
        }
    }
}
