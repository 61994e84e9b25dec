pub mod serper;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::FetchError;

/// A search hit, before any scraping. Immutable input to the pipeline core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaperCandidate {
    pub title: String,
    pub link: String,
    pub snippet: String,
    pub year: Option<u32>,
    #[serde(default)]
    pub publication_info: String,
    #[serde(default)]
    pub authors: String,
    #[serde(default)]
    pub cited_by: u32,
}

#[cfg(test)]
impl PaperCandidate {
    pub fn new(title: &str, link: &str, snippet: &str) -> Self {
        Self {
            title: title.to_string(),
            link: link.to_string(),
            snippet: snippet.to_string(),
            year: None,
            publication_info: String::new(),
            authors: String::new(),
            cited_by: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Parse error: {0}")]
    Parse(String),
}

#[async_trait]
pub trait PaperSearch: Send + Sync {
    fn name(&self) -> &str;
    async fn search(
        &self,
        query: &str,
        num_results: u32,
        date_range: Option<&str>,
    ) -> Result<Vec<PaperCandidate>, SearchError>;
}
