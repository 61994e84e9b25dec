pub mod strategy;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::apis::PaperCandidate;
use crate::http::PageFetcher;
use strategy::StrategyRegistry;

/// Extracted text shorter than this is treated as a miss (a bare "Abstract"
/// heading, a journal tagline, …) and the search snippet is used instead.
pub const MIN_ABSTRACT_CHARS: usize = 50;
pub const DEFAULT_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AbstractSource {
    Scraped,
    Snippet,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapeResult {
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub source: AbstractSource,
    pub success: bool,
}

impl ScrapeResult {
    fn scraped(text: String) -> Self {
        Self { abstract_text: text, source: AbstractSource::Scraped, success: true }
    }

    fn snippet(snippet: &str) -> Self {
        Self {
            abstract_text: snippet.to_string(),
            source: AbstractSource::Snippet,
            success: false,
        }
    }
}

/// Fetches landing pages and pulls abstracts out of them, a bounded number
/// of papers at a time.
pub struct Scraper {
    fetcher: Arc<dyn PageFetcher>,
    registry: Arc<StrategyRegistry>,
    concurrency: usize,
}

impl Scraper {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            fetcher,
            registry: Arc::new(StrategyRegistry::default()),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Scrape a batch. Returns exactly one result per input, in input order.
    pub async fn scrape(&self, papers: &[PaperCandidate]) -> Vec<ScrapeResult> {
        tracing::info!(
            "Scraping {} papers (concurrency {})",
            papers.len(),
            self.concurrency
        );
        let permits = Arc::new(Semaphore::new(self.concurrency));

        let handles: Vec<_> = papers
            .iter()
            .map(|paper| {
                let fetcher = Arc::clone(&self.fetcher);
                let registry = Arc::clone(&self.registry);
                let permits = Arc::clone(&permits);
                let link = paper.link.clone();
                let snippet = paper.snippet.clone();
                tokio::spawn(async move {
                    // The semaphore is never closed; a failed acquire just runs unbounded.
                    let _permit = permits.acquire_owned().await.ok();
                    scrape_paper(fetcher.as_ref(), &registry, &link, &snippet).await
                })
            })
            .collect();

        // Handles are awaited in input order, so slot i always holds paper i
        // whatever order the tasks finish in.
        let mut results = Vec::with_capacity(papers.len());
        for (index, (handle, paper)) in handles.into_iter().zip(papers).enumerate() {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!("Scrape task for paper {} failed: {}", index + 1, e);
                    ScrapeResult::snippet(&paper.snippet)
                }
            };
            results.push(result);
        }

        let scraped = results.iter().filter(|r| r.success).count();
        tracing::info!("Scraped {}/{} abstracts", scraped, results.len());
        results
    }
}

async fn scrape_paper(
    fetcher: &dyn PageFetcher,
    registry: &StrategyRegistry,
    link: &str,
    snippet: &str,
) -> ScrapeResult {
    if link.trim().is_empty() {
        tracing::debug!("No link, using snippet");
        return ScrapeResult::snippet(snippet);
    }

    let strategy = registry.for_url(link);
    let markup = match fetcher.fetch_page(link).await {
        Ok(markup) => markup,
        Err(e) => {
            tracing::warn!("Fetching {} failed: {}; using snippet", link, e);
            return ScrapeResult::snippet(snippet);
        }
    };

    match strategy.extract(&markup) {
        Some(text) if text.chars().count() >= MIN_ABSTRACT_CHARS => {
            tracing::info!(
                "Scraped abstract from {} via {} ({} chars)",
                link,
                strategy.name(),
                text.len()
            );
            ScrapeResult::scraped(text)
        }
        Some(text) => {
            tracing::warn!(
                "Abstract from {} too short ({} chars); using snippet",
                link,
                text.chars().count()
            );
            ScrapeResult::snippet(snippet)
        }
        None => {
            tracing::warn!("No abstract found at {} via {}; using snippet", link, strategy.name());
            ScrapeResult::snippet(snippet)
        }
    }
}
