use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;

use super::{PaperCandidate, PaperSearch, SearchError};
use crate::http::{HttpFetcher, API_TIMEOUT};

const BASE_URL: &str = "https://google.serper.dev/scholar";

/// Google Scholar search through the Serper API.
pub struct SerperClient {
    http: HttpFetcher,
}

impl SerperClient {
    pub fn new(api_key: &str) -> Result<Self, SearchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-API-KEY",
            HeaderValue::from_str(api_key)
                .map_err(|e| SearchError::Parse(format!("invalid API key header: {}", e)))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(Self {
            http: HttpFetcher::new(headers, API_TIMEOUT)?,
        })
    }
}

#[derive(Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperResult>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SerperResult {
    title: Option<String>,
    link: Option<String>,
    snippet: Option<String>,
    publication_info: Option<PublicationInfo>,
    #[serde(default)]
    inline_links: Vec<InlineLink>,
}

#[derive(Deserialize)]
struct PublicationInfo {
    summary: Option<String>,
}

#[derive(Deserialize)]
struct InlineLink {
    title: Option<String>,
}

fn date_filter(date_range: &str) -> Option<&'static str> {
    match date_range.to_lowercase().as_str() {
        "week" => Some("qdr:w"),
        "month" => Some("qdr:m"),
        "year" => Some("qdr:y"),
        _ => None,
    }
}

static YEAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:19|20)\d{2}\b").expect("valid regex"));

fn extract_year(summary: &str) -> Option<u32> {
    YEAR_PATTERN
        .find(summary)
        .and_then(|m| m.as_str().parse().ok())
}

/// Citation count from an inline link titled like "Cited by 123".
fn extract_cited_by(links: &[InlineLink]) -> u32 {
    links
        .iter()
        .filter_map(|l| l.title.as_deref())
        .find(|t| t.contains("Cited by"))
        .map(|t| {
            t.chars()
                .filter(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .unwrap_or(0)
        })
        .unwrap_or(0)
}

/// Authors precede the first dash in the publication summary.
fn extract_authors(summary: &str) -> String {
    summary.split('-').next().unwrap_or("").trim().to_string()
}

fn to_candidate(r: SerperResult) -> PaperCandidate {
    let summary = r
        .publication_info
        .and_then(|p| p.summary)
        .unwrap_or_default();
    PaperCandidate {
        title: r.title.unwrap_or_else(|| "N/A".to_string()),
        link: r.link.unwrap_or_default(),
        snippet: r.snippet.unwrap_or_default(),
        year: extract_year(&summary),
        authors: extract_authors(&summary),
        cited_by: extract_cited_by(&r.inline_links),
        publication_info: summary,
    }
}

fn parse_response(body: &[u8]) -> Result<Vec<PaperCandidate>, SearchError> {
    let resp: SerperResponse =
        serde_json::from_slice(body).map_err(|e| SearchError::Parse(e.to_string()))?;
    Ok(resp.organic.into_iter().map(to_candidate).collect())
}

#[async_trait]
impl PaperSearch for SerperClient {
    fn name(&self) -> &str {
        "serper"
    }

    async fn search(
        &self,
        query: &str,
        num_results: u32,
        date_range: Option<&str>,
    ) -> Result<Vec<PaperCandidate>, SearchError> {
        let mut payload = json!({ "q": query, "num": num_results });
        if let Some(tbs) = date_range.and_then(date_filter) {
            payload["tbs"] = json!(tbs);
        }
        tracing::info!("Searching scholar for {:?} ({} results)", query, num_results);
        let body = self
            .http
            .send(Method::POST, BASE_URL, Some(&payload))
            .await?;
        let papers = parse_response(&body)?;
        tracing::info!("Retrieved {} papers", papers.len());
        Ok(papers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
      "organic": [
        {
          "title": "Attention Is All You Need",
          "link": "https://arxiv.org/abs/1706.03762",
          "snippet": "The dominant sequence transduction models...",
          "publicationInfo": { "summary": "A Vaswani, N Shazeer - Advances in neural information, 2017 - proceedings.neurips.cc" },
          "inlineLinks": [ { "title": "Related articles" }, { "title": "Cited by 123456" } ]
        },
        { "snippet": "no title or link" }
      ]
    }"#;

    #[test]
    fn test_parse_response() {
        let papers = parse_response(SAMPLE.as_bytes()).unwrap();
        assert_eq!(papers.len(), 2);

        let p = &papers[0];
        assert_eq!(p.title, "Attention Is All You Need");
        assert_eq!(p.link, "https://arxiv.org/abs/1706.03762");
        assert_eq!(p.year, Some(2017));
        assert_eq!(p.cited_by, 123456);
        assert_eq!(p.authors, "A Vaswani, N Shazeer");

        let bare = &papers[1];
        assert_eq!(bare.title, "N/A");
        assert_eq!(bare.link, "");
        assert_eq!(bare.year, None);
        assert_eq!(bare.cited_by, 0);
    }

    #[test]
    fn test_missing_organic_is_empty() {
        assert!(parse_response(b"{}").unwrap().is_empty());
    }

    #[test]
    fn test_year_requires_word_boundary() {
        assert_eq!(extract_year("Journal 12019 vol 3"), None);
        assert_eq!(extract_year("Nature, 1998"), Some(1998));
        assert_eq!(extract_year("no year here"), None);
    }

    #[test]
    fn test_date_filter() {
        assert_eq!(date_filter("Week"), Some("qdr:w"));
        assert_eq!(date_filter("year"), Some("qdr:y"));
        assert_eq!(date_filter("decade"), None);
    }
}
