use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Method;
use serde_json::Value;

use super::{GenerationError, GenerationKind, JobApi};
use crate::http::{HttpFetcher, API_TIMEOUT};

const BASE_URL: &str = "https://api.cloud.scenario.com/v1";

/// Scenario.com REST API, authenticated with an API key/secret pair.
pub struct ScenarioApi {
    api: HttpFetcher,
    /// Asset download URLs are pre-signed and must not carry our credentials.
    downloads: HttpFetcher,
    base_url: String,
}

impl ScenarioApi {
    pub fn new(api_key: String, api_secret: String) -> Result<Self, GenerationError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        Ok(Self {
            api: HttpFetcher::new(headers, API_TIMEOUT)?.with_basic_auth(api_key, api_secret),
            downloads: HttpFetcher::new(HeaderMap::new(), API_TIMEOUT)?,
            base_url: BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Value, GenerationError> {
        let bytes = self.api.send(method, &self.url(endpoint), body).await?;
        parse_json(&bytes)
    }
}

fn parse_json(bytes: &[u8]) -> Result<Value, GenerationError> {
    serde_json::from_slice(bytes).map_err(|e| GenerationError::Malformed(e.to_string()))
}

#[async_trait]
impl JobApi for ScenarioApi {
    async fn submit(
        &self,
        kind: GenerationKind,
        payload: &Value,
    ) -> Result<Value, GenerationError> {
        self.request(Method::POST, kind.endpoint(), Some(payload)).await
    }

    async fn upload_asset(&self, payload: &Value) -> Result<Value, GenerationError> {
        self.request(Method::POST, "assets", Some(payload)).await
    }

    async fn job(&self, job_id: &str) -> Result<Value, GenerationError> {
        self.request(Method::GET, &format!("jobs/{}", job_id), None).await
    }

    async fn asset(&self, asset_id: &str) -> Result<Value, GenerationError> {
        self.request(Method::GET, &format!("assets/{}", asset_id), None).await
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, GenerationError> {
        Ok(self.downloads.fetch(url).await?)
    }
}
