pub mod prompt;
pub mod scenario;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::clock::{Sleeper, TokioSleeper};
use crate::http::FetchError;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("Job id missing from submit response")]
    MissingJobId,
    #[error("Job {job_id} failed: {message}")]
    RemoteFailure { job_id: String, message: String },
    #[error("Job {job_id} still unfinished after {attempts} polls")]
    Timeout {
        job_id: String,
        attempts: u32,
        last_error: Option<String>,
    },
    #[error("Job {job_id} finished without any usable assets")]
    NoAssets { job_id: String },
    #[error("Invalid reference image: {0}")]
    InvalidReference(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GenerationError {
    /// Whether polling should shrug this off and try again next tick.
    fn is_transient(&self) -> bool {
        match self {
            GenerationError::Fetch(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Image-generation request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub steps: u32,
    pub guidance: f32,
    pub negative_prompt: Option<String>,
    pub scheduler: String,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            model: "flux.1-dev".to_string(),
            width: 1024,
            height: 1024,
            samples: 1,
            steps: 28,
            guidance: 3.5,
            negative_prompt: None,
            scheduler: "EulerAncestralDiscreteScheduler".to_string(),
        }
    }
}

impl GenerationParams {
    fn payload(&self, prompt: &str) -> Value {
        let mut payload = json!({
            "modelId": self.model,
            "prompt": prompt,
            "numInferenceSteps": self.steps,
            "numSamples": self.samples,
            "guidance": self.guidance,
            "width": self.width,
            "height": self.height,
            "scheduler": self.scheduler,
        });
        if let Some(negative) = &self.negative_prompt {
            payload["negativePrompt"] = json!(negative);
        }
        payload
    }
}

/// Per-request tweaks layered over the configured `GenerationParams`.
#[derive(Debug, Clone, Default)]
pub struct GenerationOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub samples: Option<u32>,
    pub steps: Option<u32>,
    pub guidance: Option<f32>,
    pub negative_prompt: Option<String>,
}

impl GenerationOverrides {
    pub fn apply(&self, base: &GenerationParams) -> GenerationParams {
        let mut params = base.clone();
        if let Some(width) = self.width {
            params.width = width;
        }
        if let Some(height) = self.height {
            params.height = height;
        }
        if let Some(samples) = self.samples {
            params.samples = samples.max(1);
        }
        if let Some(steps) = self.steps {
            params.steps = steps.max(1);
        }
        if let Some(guidance) = self.guidance {
            params.guidance = guidance;
        }
        if let Some(negative) = self.negative_prompt.as_ref().filter(|n| !n.trim().is_empty()) {
            params.negative_prompt = Some(negative.clone());
        }
        params
    }
}

/// Which generation endpoint a job is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationKind {
    TextToImage,
    ImageToImage,
}

impl GenerationKind {
    pub fn endpoint(self) -> &'static str {
        match self {
            GenerationKind::TextToImage => "generate/txt2img",
            GenerationKind::ImageToImage => "generate/img2img",
        }
    }
}

/// Reference images above this size are rejected before upload.
pub const MAX_REFERENCE_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_STRENGTH: f32 = 0.8;

/// A local image to transform, already read into memory.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub name: String,
    pub mime_type: &'static str,
    pub bytes: Vec<u8>,
}

impl ReferenceImage {
    pub async fn load(path: &Path) -> Result<Self, GenerationError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            GenerationError::InvalidReference(format!("{}: {}", path.display(), e))
        })?;
        if bytes.len() > MAX_REFERENCE_BYTES {
            return Err(GenerationError::InvalidReference(format!(
                "{} is {:.1}MB (max 10MB)",
                path.display(),
                bytes.len() as f64 / (1024.0 * 1024.0)
            )));
        }
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("reference");
        Ok(Self { name: format!("{}_upload", stem), mime_type: mime_for(path), bytes })
    }

    fn base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }

    /// Inline form accepted by the generate endpoint when upload fails.
    fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64())
    }
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => "image/png",
    }
}

/// Where a job sits in its lifecycle, as far as this process knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Queued,
    InProgress,
    Success,
    Failure,
    Timeout,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Success | JobState::Failure | JobState::Timeout)
    }

    /// Unknown remote statuses keep the job pending.
    fn from_remote(status: &str) -> Option<Self> {
        match status {
            "queued" => Some(JobState::Queued),
            "in-progress" => Some(JobState::InProgress),
            "success" => Some(JobState::Success),
            "failure" => Some(JobState::Failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub id: String,
    pub state: JobState,
    pub progress: Option<f64>,
    pub error: Option<String>,
}

impl GenerationJob {
    fn new(id: String) -> Self {
        Self { id, state: JobState::Submitted, progress: None, error: None }
    }

    /// Fold a polled status into the job. Terminal jobs ignore updates.
    fn observe(&mut self, snapshot: &JobBody) -> JobState {
        if self.state.is_terminal() {
            return self.state;
        }
        if let Some(state) = JobState::from_remote(&snapshot.status) {
            self.state = state;
        }
        self.progress = snapshot.progress.map(|p| p.clamp(0.0, 1.0));
        if self.state == JobState::Failure {
            self.error = Some(snapshot.error_message());
        }
        self.state
    }

    fn time_out(&mut self) {
        if !self.state.is_terminal() {
            self.state = JobState::Timeout;
        }
    }
}

/// A generated image. `id` is absent for URLs returned inline by the job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageAsset {
    pub id: Option<String>,
    pub url: String,
    pub path: Option<PathBuf>,
}

/// How often to poll and when to give up.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// `(attempts, interval)` stages applied in order.
    pub stages: Vec<(u32, Duration)>,
    /// Interval once every stage is used up.
    pub tail_interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::adaptive()
    }
}

impl PollPolicy {
    /// 2s for the first 5 polls, 3s for the next 10, then 5s; 60 polls max.
    pub fn adaptive() -> Self {
        Self {
            stages: vec![(5, Duration::from_secs(2)), (10, Duration::from_secs(3))],
            tail_interval: Duration::from_secs(5),
            max_attempts: 60,
        }
    }

    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self { stages: Vec::new(), tail_interval: interval, max_attempts }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Wait after the `attempt`-th poll (1-based).
    pub fn interval_after(&self, attempt: u32) -> Duration {
        let mut upto = 0;
        for (count, interval) in &self.stages {
            upto += count;
            if attempt <= upto {
                return *interval;
            }
        }
        self.tail_interval
    }
}

/// What to hand back once assets resolve.
#[derive(Debug, Clone, PartialEq)]
pub enum AssetDelivery {
    Url,
    /// Also download each image into this directory.
    Download { dir: PathBuf },
}

/// Remote job service. Responses are raw JSON since the service uses
/// several shapes for the same data.
#[async_trait]
pub trait JobApi: Send + Sync {
    async fn submit(&self, kind: GenerationKind, payload: &Value)
        -> Result<Value, GenerationError>;
    async fn upload_asset(&self, payload: &Value) -> Result<Value, GenerationError>;
    async fn job(&self, job_id: &str) -> Result<Value, GenerationError>;
    async fn asset(&self, asset_id: &str) -> Result<Value, GenerationError>;
    async fn download(&self, url: &str) -> Result<Vec<u8>, GenerationError>;
}

#[derive(Deserialize)]
struct SubmitResponse {
    job: Option<SubmittedJob>,
    #[serde(rename = "jobId")]
    job_id: Option<String>,
    id: Option<String>,
}

#[derive(Deserialize)]
struct SubmittedJob {
    #[serde(rename = "jobId")]
    job_id: Option<String>,
}

/// The job service sends `null` for fields it has not filled in yet.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Deserialize, Default)]
struct JobEnvelope {
    #[serde(default, deserialize_with = "null_as_default")]
    job: JobBody,
}

#[derive(Deserialize, Default)]
struct JobBody {
    #[serde(default, deserialize_with = "null_as_default")]
    status: String,
    progress: Option<f64>,
    error: Option<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    metadata: JobMetadata,
    #[serde(default, deserialize_with = "null_as_default")]
    images: Vec<InlineImage>,
}

impl JobBody {
    fn error_message(&self) -> String {
        match &self.error {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(Value::String(_)) | Some(Value::Null) | None => "Unknown error".to_string(),
            Some(other) => other.to_string(),
        }
    }

    fn inline_assets(&self) -> Vec<ImageAsset> {
        let from_images = self.images.iter().filter_map(|img| match img {
            InlineImage::Url(url) => Some((None, url.clone())),
            InlineImage::Object { id, url } => url.clone().map(|u| (id.clone(), u)),
        });
        let from_metadata = self.metadata.image_urls.iter().map(|u| (None, u.clone()));
        from_images
            .chain(from_metadata)
            .filter(|(_, url)| !url.is_empty())
            .map(|(id, url)| ImageAsset { id, url, path: None })
            .collect()
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct JobMetadata {
    #[serde(default, deserialize_with = "null_as_default")]
    asset_ids: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    image_urls: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InlineImage {
    Url(String),
    Object { id: Option<String>, url: Option<String> },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetResponse {
    url: Option<String>,
    download_url: Option<String>,
    asset: Option<NestedAsset>,
}

#[derive(Deserialize)]
struct NestedAsset {
    url: Option<String>,
}

fn job_id_from(response: Value) -> Result<String, GenerationError> {
    let parsed: SubmitResponse =
        serde_json::from_value(response).map_err(|e| GenerationError::Malformed(e.to_string()))?;
    parsed
        .job
        .and_then(|j| j.job_id)
        .or(parsed.job_id)
        .or(parsed.id)
        .filter(|id| !id.is_empty())
        .ok_or(GenerationError::MissingJobId)
}

#[derive(Deserialize)]
struct UploadResponse {
    asset: Option<UploadedAsset>,
    #[serde(rename = "assetId")]
    asset_id: Option<String>,
    id: Option<String>,
}

#[derive(Deserialize)]
struct UploadedAsset {
    #[serde(rename = "assetId")]
    asset_id: Option<String>,
    id: Option<String>,
}

fn uploaded_asset_id(response: Value) -> Option<String> {
    let parsed: UploadResponse = serde_json::from_value(response).ok()?;
    parsed
        .asset
        .and_then(|a| a.asset_id.or(a.id))
        .or(parsed.asset_id)
        .or(parsed.id)
        .filter(|id| !id.is_empty())
}

fn asset_url_from(response: Value) -> Option<String> {
    let parsed: AssetResponse = serde_json::from_value(response).ok()?;
    parsed
        .url
        .or(parsed.download_url)
        .or(parsed.asset.and_then(|a| a.url))
        .filter(|u| !u.is_empty())
}

/// Drives one generation job from submission to usable images.
pub struct GenerationClient {
    api: Arc<dyn JobApi>,
    sleeper: Arc<dyn Sleeper>,
    policy: PollPolicy,
    delivery: AssetDelivery,
}

impl GenerationClient {
    pub fn new(api: Arc<dyn JobApi>) -> Self {
        Self {
            api,
            sleeper: Arc::new(TokioSleeper),
            policy: PollPolicy::default(),
            delivery: AssetDelivery::Url,
        }
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_delivery(mut self, delivery: AssetDelivery) -> Self {
        self.delivery = delivery;
        self
    }

    #[cfg(test)]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Submit, poll to completion, and resolve the resulting images.
    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Vec<ImageAsset>, GenerationError> {
        let job_id = self
            .submit(GenerationKind::TextToImage, prompt, &params.payload(prompt))
            .await?;
        self.complete(job_id).await
    }

    /// Transform a reference image guided by `prompt`. `strength` (0.1 subtle
    /// to 1.0 major changes) controls how far the result may drift.
    pub async fn generate_from_image(
        &self,
        prompt: &str,
        reference: &ReferenceImage,
        strength: f32,
        params: &GenerationParams,
    ) -> Result<Vec<ImageAsset>, GenerationError> {
        let image = self.upload_reference(reference).await;
        let mut payload = params.payload(prompt);
        payload["image"] = json!(image);
        payload["strength"] = json!(strength.clamp(0.1, 1.0));
        let job_id = self
            .submit(GenerationKind::ImageToImage, prompt, &payload)
            .await?;
        self.complete(job_id).await
    }

    /// Upload the reference and return its asset id, or a data URL when the
    /// upload is refused.
    async fn upload_reference(&self, reference: &ReferenceImage) -> String {
        tracing::info!(
            "Uploading reference image {} ({} bytes)",
            reference.name,
            reference.bytes.len()
        );
        let payload = json!({ "image": reference.base64(), "name": reference.name });
        match self.api.upload_asset(&payload).await.map(uploaded_asset_id) {
            Ok(Some(asset_id)) => {
                tracing::info!("Reference uploaded as asset {}", asset_id);
                asset_id
            }
            Ok(None) => {
                tracing::warn!("Upload response had no asset id; sending image inline");
                reference.data_url()
            }
            Err(e) => {
                tracing::warn!("Uploading reference failed: {}; sending image inline", e);
                reference.data_url()
            }
        }
    }

    async fn submit(
        &self,
        kind: GenerationKind,
        prompt: &str,
        payload: &Value,
    ) -> Result<String, GenerationError> {
        let preview: String = prompt.chars().take(50).collect();
        tracing::info!("Submitting {:?} job: {:?}...", kind, preview);
        let response = self.api.submit(kind, payload).await?;
        let job_id = job_id_from(response)?;
        tracing::info!("Job created: {}", job_id);
        Ok(job_id)
    }

    async fn complete(&self, job_id: String) -> Result<Vec<ImageAsset>, GenerationError> {
        let mut job = GenerationJob::new(job_id);
        let body = self.poll(&mut job).await?;
        self.resolve_assets(&job, &body).await
    }

    async fn poll(&self, job: &mut GenerationJob) -> Result<JobBody, GenerationError> {
        let max = self.policy.max_attempts;
        for attempt in 1..=max {
            let polled = match self.api.job(&job.id).await {
                Ok(value) => serde_json::from_value::<JobEnvelope>(value)
                    .map_err(|e| GenerationError::Malformed(e.to_string())),
                Err(e) => Err(e),
            };

            match polled {
                Ok(JobEnvelope { job: body }) => match job.observe(&body) {
                    JobState::Success => {
                        tracing::info!("Job {} succeeded after {} polls", job.id, attempt);
                        return Ok(body);
                    }
                    JobState::Failure => {
                        let message = job.error.clone().unwrap_or_default();
                        tracing::warn!("Job {} failed: {}", job.id, message);
                        return Err(GenerationError::RemoteFailure {
                            job_id: job.id.clone(),
                            message,
                        });
                    }
                    state => tracing::debug!(
                        "Job {} {:?} ({:.1}%) poll {}/{}",
                        job.id,
                        state,
                        job.progress.unwrap_or(0.0) * 100.0,
                        attempt,
                        max
                    ),
                },
                Err(e) if e.is_transient() && attempt < max => {
                    tracing::warn!("Polling job {} failed: {}; will retry", job.id, e);
                }
                Err(e) if e.is_transient() => {
                    job.time_out();
                    return Err(GenerationError::Timeout {
                        job_id: job.id.clone(),
                        attempts: max,
                        last_error: Some(e.to_string()),
                    });
                }
                Err(e) => return Err(e),
            }

            if attempt < max {
                self.sleeper.sleep(self.policy.interval_after(attempt)).await;
            }
        }

        job.time_out();
        tracing::warn!("Job {} timed out after {} polls", job.id, max);
        Err(GenerationError::Timeout {
            job_id: job.id.clone(),
            attempts: max,
            last_error: None,
        })
    }

    async fn resolve_assets(
        &self,
        job: &GenerationJob,
        body: &JobBody,
    ) -> Result<Vec<ImageAsset>, GenerationError> {
        let mut assets = body.inline_assets();
        if assets.is_empty() {
            for asset_id in &body.metadata.asset_ids {
                match self.api.asset(asset_id).await {
                    Ok(response) => match asset_url_from(response) {
                        Some(url) => assets.push(ImageAsset {
                            id: Some(asset_id.clone()),
                            url,
                            path: None,
                        }),
                        None => tracing::warn!("No download URL for asset {}", asset_id),
                    },
                    Err(e) => tracing::warn!("Looking up asset {} failed: {}", asset_id, e),
                }
            }
        } else {
            tracing::debug!("Job {} returned {} image URLs inline", job.id, assets.len());
        }

        if let AssetDelivery::Download { dir } = &self.delivery {
            assets = self.download_all(&job.id, assets, dir).await?;
        }

        if assets.is_empty() {
            return Err(GenerationError::NoAssets { job_id: job.id.clone() });
        }
        tracing::info!("Job {} resolved {} assets", job.id, assets.len());
        Ok(assets)
    }

    /// Download each asset into `dir`. Assets that fail to download are dropped.
    async fn download_all(
        &self,
        job_id: &str,
        assets: Vec<ImageAsset>,
        dir: &Path,
    ) -> Result<Vec<ImageAsset>, GenerationError> {
        tokio::fs::create_dir_all(dir).await?;
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut saved = Vec::with_capacity(assets.len());
        for (index, mut asset) in assets.into_iter().enumerate() {
            let path = dir.join(image_filename(&timestamp, job_id, index + 1));
            let bytes = match self.api.download(&asset.url).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("Downloading image {} failed: {}", index + 1, e);
                    continue;
                }
            };
            if let Err(e) = tokio::fs::write(&path, &bytes).await {
                tracing::warn!("Writing {} failed: {}", path.display(), e);
                continue;
            }
            tracing::info!("Downloaded {}", path.display());
            asset.path = Some(path);
            saved.push(asset);
        }
        Ok(saved)
    }
}

/// The job id keeps concurrent jobs finishing in the same second apart.
fn image_filename(timestamp: &str, job_id: &str, sequence: usize) -> String {
    let job: String = job_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("generated_image_{}_{}_{}.png", timestamp, job, sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RecordingSleeper;
    use reqwest::StatusCode;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Scripted job service: job polls pop from a queue (the last entry repeats).
    #[derive(Default)]
    struct FakeJobApi {
        submit_response: Value,
        polls: Mutex<VecDeque<Result<Value, StatusCode>>>,
        assets: HashMap<String, Result<Value, StatusCode>>,
        downloads: HashMap<String, Vec<u8>>,
        poll_count: Mutex<u32>,
        submitted: Mutex<Vec<(GenerationKind, Value)>>,
        upload_response: Option<Value>,
        uploaded: Mutex<Vec<Value>>,
    }

    fn http_error(status: StatusCode) -> GenerationError {
        GenerationError::Fetch(FetchError::Status { status, url: "fake".to_string() })
    }

    impl FakeJobApi {
        fn new(polls: Vec<Result<Value, StatusCode>>) -> Self {
            Self {
                submit_response: json!({ "job": { "jobId": "job-1" } }),
                polls: Mutex::new(polls.into()),
                ..Default::default()
            }
        }

        fn polls_made(&self) -> u32 {
            *self.poll_count.lock().unwrap()
        }
    }

    #[async_trait]
    impl JobApi for FakeJobApi {
        async fn submit(
            &self,
            kind: GenerationKind,
            payload: &Value,
        ) -> Result<Value, GenerationError> {
            self.submitted.lock().unwrap().push((kind, payload.clone()));
            Ok(self.submit_response.clone())
        }

        async fn upload_asset(&self, payload: &Value) -> Result<Value, GenerationError> {
            self.uploaded.lock().unwrap().push(payload.clone());
            self.upload_response
                .clone()
                .ok_or_else(|| http_error(StatusCode::BAD_REQUEST))
        }

        async fn job(&self, _job_id: &str) -> Result<Value, GenerationError> {
            *self.poll_count.lock().unwrap() += 1;
            let mut polls = self.polls.lock().unwrap();
            let next = if polls.len() > 1 { polls.pop_front() } else { polls.front().cloned() };
            match next.expect("no scripted polls") {
                Ok(value) => Ok(value),
                Err(status) => Err(http_error(status)),
            }
        }

        async fn asset(&self, asset_id: &str) -> Result<Value, GenerationError> {
            match self.assets.get(asset_id) {
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err(status)) => Err(http_error(*status)),
                None => Err(http_error(StatusCode::NOT_FOUND)),
            }
        }

        async fn download(&self, url: &str) -> Result<Vec<u8>, GenerationError> {
            self.downloads
                .get(url)
                .cloned()
                .ok_or_else(|| http_error(StatusCode::NOT_FOUND))
        }
    }

    fn status(s: &str) -> Result<Value, StatusCode> {
        Ok(json!({ "job": { "jobId": "job-1", "status": s, "progress": 0.5 } }))
    }

    fn success_with_assets(ids: &[&str]) -> Result<Value, StatusCode> {
        Ok(json!({ "job": { "status": "success", "metadata": { "assetIds": ids } } }))
    }

    fn client(api: Arc<FakeJobApi>, sleeper: Arc<RecordingSleeper>) -> GenerationClient {
        GenerationClient::new(api).with_sleeper(sleeper)
    }

    #[test]
    fn test_adaptive_schedule() {
        let policy = PollPolicy::adaptive();
        assert_eq!(policy.interval_after(1), Duration::from_secs(2));
        assert_eq!(policy.interval_after(5), Duration::from_secs(2));
        assert_eq!(policy.interval_after(6), Duration::from_secs(3));
        assert_eq!(policy.interval_after(15), Duration::from_secs(3));
        assert_eq!(policy.interval_after(16), Duration::from_secs(5));
        assert_eq!(policy.interval_after(59), Duration::from_secs(5));

        let fixed = PollPolicy::fixed(Duration::from_secs(5), 60);
        assert_eq!(fixed.interval_after(1), Duration::from_secs(5));
    }

    #[test]
    fn test_job_id_shapes() {
        assert_eq!(job_id_from(json!({ "job": { "jobId": "a" } })).unwrap(), "a");
        assert_eq!(job_id_from(json!({ "jobId": "b" })).unwrap(), "b");
        assert_eq!(job_id_from(json!({ "id": "c" })).unwrap(), "c");
        assert_eq!(job_id_from(json!({ "job": {}, "id": "d" })).unwrap(), "d");
        assert!(matches!(
            job_id_from(json!({ "job": { "status": "queued" } })),
            Err(GenerationError::MissingJobId)
        ));
    }

    #[test]
    fn test_asset_url_shapes() {
        assert_eq!(asset_url_from(json!({ "url": "u1" })).as_deref(), Some("u1"));
        assert_eq!(asset_url_from(json!({ "downloadUrl": "u2" })).as_deref(), Some("u2"));
        assert_eq!(asset_url_from(json!({ "asset": { "url": "u3" } })).as_deref(), Some("u3"));
        assert_eq!(asset_url_from(json!({ "asset": {} })), None);
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let mut job = GenerationJob::new("j".to_string());
        let failed = JobBody { status: "failure".into(), error: Some(json!("boom")), ..Default::default() };
        assert_eq!(job.observe(&failed), JobState::Failure);

        let later = JobBody { status: "success".into(), ..Default::default() };
        assert_eq!(job.observe(&later), JobState::Failure);
        job.time_out();
        assert_eq!(job.state, JobState::Failure);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_missing_job_id_fails_before_polling() {
        let mut api = FakeJobApi::new(vec![status("queued")]);
        api.submit_response = json!({ "message": "accepted" });
        let api = Arc::new(api);
        let result = client(api.clone(), Arc::default())
            .generate("prompt", &GenerationParams::default())
            .await;

        assert!(matches!(result, Err(GenerationError::MissingJobId)));
        assert_eq!(api.polls_made(), 0);
    }

    #[tokio::test]
    async fn test_success_resolves_assets_with_adaptive_waits() {
        let mut polls: Vec<_> = (0..6).map(|_| status("in-progress")).collect();
        polls.push(success_with_assets(&["a1"]));
        let mut api = FakeJobApi::new(polls);
        api.assets.insert("a1".into(), Ok(json!({ "url": "https://cdn/a1.png" })));
        let api = Arc::new(api);
        let sleeper = Arc::new(RecordingSleeper::default());

        let assets = client(api.clone(), sleeper.clone())
            .generate("prompt", &GenerationParams::default())
            .await
            .unwrap();

        assert_eq!(
            assets,
            vec![ImageAsset { id: Some("a1".into()), url: "https://cdn/a1.png".into(), path: None }]
        );
        assert_eq!(api.polls_made(), 7);
        let secs: Vec<u64> = sleeper.recorded().iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![2, 2, 2, 2, 2, 3]);
    }

    #[tokio::test]
    async fn test_submit_payload() {
        let api = Arc::new(FakeJobApi::new(vec![success_with_assets(&[])]));
        let params = GenerationParams {
            negative_prompt: Some("blurry".into()),
            ..Default::default()
        };
        let _ = client(api.clone(), Arc::default()).generate("a lab", &params).await;

        let (kind, payload) = api.submitted.lock().unwrap()[0].clone();
        assert_eq!(kind, GenerationKind::TextToImage);
        assert!(payload.get("strength").is_none());
        assert_eq!(payload["modelId"], "flux.1-dev");
        assert_eq!(payload["prompt"], "a lab");
        assert_eq!(payload["numInferenceSteps"], 28);
        assert_eq!(payload["numSamples"], 1);
        assert_eq!(payload["width"], 1024);
        assert_eq!(payload["scheduler"], "EulerAncestralDiscreteScheduler");
        assert_eq!(payload["negativePrompt"], "blurry");
    }

    #[tokio::test]
    async fn test_remote_failure_stops_polling() {
        let api = Arc::new(FakeJobApi::new(vec![
            status("queued"),
            Ok(json!({ "job": { "status": "failure", "error": "NSFW content detected" } })),
            status("success"),
        ]));
        let result = client(api.clone(), Arc::default())
            .generate("prompt", &GenerationParams::default())
            .await;

        match result {
            Err(GenerationError::RemoteFailure { job_id, message }) => {
                assert_eq!(job_id, "job-1");
                assert_eq!(message, "NSFW content detected");
            }
            other => panic!("expected remote failure, got {:?}", other),
        }
        assert_eq!(api.polls_made(), 2);
    }

    #[tokio::test]
    async fn test_timeout_after_max_attempts() {
        let api = Arc::new(FakeJobApi::new(vec![status("in-progress")]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let result = client(api.clone(), sleeper.clone())
            .generate("prompt", &GenerationParams::default())
            .await;

        assert!(matches!(
            result,
            Err(GenerationError::Timeout { attempts: 60, last_error: None, .. })
        ));
        assert_eq!(api.polls_made(), 60);
        let waited: Duration = sleeper.recorded().iter().sum();
        assert_eq!(waited, Duration::from_secs(5 * 2 + 10 * 3 + 44 * 5));
    }

    #[tokio::test]
    async fn test_transient_poll_errors_are_swallowed() {
        let mut api = FakeJobApi::new(vec![
            Err(StatusCode::BAD_GATEWAY),
            status("queued"),
            Err(StatusCode::SERVICE_UNAVAILABLE),
            success_with_assets(&["a1"]),
        ]);
        api.assets.insert("a1".into(), Ok(json!({ "downloadUrl": "https://cdn/a1.png" })));
        let api = Arc::new(api);

        let assets = client(api.clone(), Arc::default())
            .generate("prompt", &GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(assets.len(), 1);
        assert_eq!(api.polls_made(), 4);
    }

    #[tokio::test]
    async fn test_error_on_last_attempt_is_timeout() {
        let api = Arc::new(FakeJobApi::new(vec![status("queued"), Err(StatusCode::BAD_GATEWAY)]));
        let result = client(api.clone(), Arc::default())
            .with_poll_policy(PollPolicy::adaptive().with_max_attempts(3))
            .generate("prompt", &GenerationParams::default())
            .await;

        match result {
            Err(GenerationError::Timeout { attempts, last_error, .. }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.unwrap().contains("502"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_error_while_polling_fails_fast() {
        let api = Arc::new(FakeJobApi::new(vec![Err(StatusCode::UNAUTHORIZED)]));
        let result = client(api.clone(), Arc::default())
            .generate("prompt", &GenerationParams::default())
            .await;

        assert!(matches!(result, Err(GenerationError::Fetch(_))));
        assert_eq!(api.polls_made(), 1);
    }

    #[tokio::test]
    async fn test_partial_asset_resolution() {
        let mut api = FakeJobApi::new(vec![success_with_assets(&["a1", "a2", "a3"])]);
        api.assets.insert("a1".into(), Ok(json!({ "url": "https://cdn/a1.png" })));
        api.assets.insert("a2".into(), Err(StatusCode::INTERNAL_SERVER_ERROR));
        api.assets.insert("a3".into(), Ok(json!({ "asset": { "url": "https://cdn/a3.png" } })));
        let api = Arc::new(api);

        let assets = client(api, Arc::default())
            .generate("prompt", &GenerationParams::default())
            .await
            .unwrap();

        let urls: Vec<_> = assets.iter().map(|a| a.url.as_str()).collect();
        assert_eq!(urls, vec!["https://cdn/a1.png", "https://cdn/a3.png"]);
    }

    #[tokio::test]
    async fn test_success_without_assets_is_an_error() {
        let mut api = FakeJobApi::new(vec![success_with_assets(&["a1"])]);
        api.assets.insert("a1".into(), Ok(json!({ "name": "no url here" })));
        let result = client(Arc::new(api), Arc::default())
            .generate("prompt", &GenerationParams::default())
            .await;
        assert!(matches!(result, Err(GenerationError::NoAssets { .. })));

        let api = FakeJobApi::new(vec![Ok(json!({ "job": { "status": "success" } }))]);
        let result = client(Arc::new(api), Arc::default())
            .generate("prompt", &GenerationParams::default())
            .await;
        assert!(matches!(result, Err(GenerationError::NoAssets { .. })));
    }

    #[tokio::test]
    async fn test_inline_urls_skip_asset_lookup() {
        let api = Arc::new(FakeJobApi::new(vec![Ok(json!({
            "job": {
                "status": "success",
                "images": [ { "id": "i1", "url": "https://cdn/i1.png" }, "https://cdn/i2.png" ],
                "metadata": { "assetIds": ["never-looked-up"] }
            }
        }))]));

        let assets = client(api, Arc::default())
            .generate("prompt", &GenerationParams::default())
            .await
            .unwrap();

        assert_eq!(assets.len(), 2);
        assert_eq!(assets[0].id.as_deref(), Some("i1"));
        assert_eq!(assets[1].url, "https://cdn/i2.png");
    }

    #[tokio::test]
    async fn test_download_delivery_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = FakeJobApi::new(vec![Ok(json!({
            "job": { "status": "success", "metadata": { "imageUrls": ["https://cdn/1.png", "https://cdn/2.png"] } }
        }))]);
        api.downloads.insert("https://cdn/1.png".into(), b"png-one".to_vec());
        let api = Arc::new(api);

        let assets = client(api, Arc::default())
            .with_delivery(AssetDelivery::Download { dir: dir.path().to_path_buf() })
            .generate("prompt", &GenerationParams::default())
            .await
            .unwrap();

        assert_eq!(assets.len(), 1);
        let path = assets[0].path.clone().unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("generated_image_"));
        assert!(name.ends_with("_job-1_1.png"));
        assert_eq!(std::fs::read(path).unwrap(), b"png-one");
    }

    #[tokio::test]
    async fn test_concurrent_downloads_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let fake = |job_id: &str, body: &[u8]| {
            let mut api = FakeJobApi::new(vec![Ok(json!({
                "job": { "status": "success", "images": ["https://cdn/image.png"] }
            }))]);
            api.submit_response = json!({ "job": { "jobId": job_id } });
            api.downloads.insert("https://cdn/image.png".into(), body.to_vec());
            client(Arc::new(api), Arc::default())
                .with_delivery(AssetDelivery::Download { dir: dir.path().to_path_buf() })
        };
        let first = fake("job-a", b"paper-A");
        let second = fake("job/b", b"paper-B");
        let params = GenerationParams::default();

        let (a, b) = tokio::join!(
            first.generate("A", &params),
            second.generate("B", &params)
        );
        let a = a.unwrap()[0].path.clone().unwrap();
        let b = b.unwrap()[0].path.clone().unwrap();

        assert_ne!(a, b);
        assert_eq!(std::fs::read(&a).unwrap(), b"paper-A");
        assert_eq!(std::fs::read(&b).unwrap(), b"paper-B");
        assert!(b.file_name().unwrap().to_string_lossy().contains("job_b"));
    }

    #[tokio::test]
    async fn test_null_fields_keep_polling() {
        let mut api = FakeJobApi::new(vec![
            Ok(json!({ "job": { "status": "queued", "metadata": null, "images": null } })),
            Ok(json!({ "job": { "status": "in-progress", "metadata": { "assetIds": null } } })),
            Ok(json!({ "job": null })),
            Ok(json!({ "job": { "status": "success", "metadata": { "assetIds": ["a1"], "imageUrls": null } } })),
        ]);
        api.assets.insert("a1".into(), Ok(json!({ "url": "https://cdn/a1.png" })));
        let api = Arc::new(api);

        let assets = client(api.clone(), Arc::default())
            .generate("prompt", &GenerationParams::default())
            .await
            .unwrap();

        assert_eq!(assets.len(), 1);
        assert_eq!(api.polls_made(), 4);
    }

    #[tokio::test]
    async fn test_blank_remote_error_reads_unknown() {
        let api = Arc::new(FakeJobApi::new(vec![Ok(json!({
            "job": { "status": "failure", "error": "" }
        }))]));
        let result = client(api, Arc::default())
            .generate("prompt", &GenerationParams::default())
            .await;

        match result {
            Err(e @ GenerationError::RemoteFailure { .. }) => {
                assert_eq!(e.to_string(), "Job job-1 failed: Unknown error");
            }
            other => panic!("expected remote failure, got {:?}", other),
        }
    }

    #[test]
    fn test_overrides_layer_over_defaults() {
        let base = GenerationParams::default();
        let overrides = GenerationOverrides {
            width: Some(768),
            samples: Some(0),
            guidance: Some(7.0),
            negative_prompt: Some("  ".into()),
            ..Default::default()
        };
        let params = overrides.apply(&base);
        assert_eq!(params.width, 768);
        assert_eq!(params.height, 1024);
        assert_eq!(params.samples, 1);
        assert_eq!(params.steps, 28);
        assert_eq!(params.guidance, 7.0);
        assert_eq!(params.negative_prompt, None);
    }

    #[test]
    fn test_uploaded_asset_id_shapes() {
        assert_eq!(uploaded_asset_id(json!({ "asset": { "assetId": "a" } })).as_deref(), Some("a"));
        assert_eq!(uploaded_asset_id(json!({ "asset": { "id": "b" } })).as_deref(), Some("b"));
        assert_eq!(uploaded_asset_id(json!({ "assetId": "c" })).as_deref(), Some("c"));
        assert_eq!(uploaded_asset_id(json!({ "id": "d" })).as_deref(), Some("d"));
        assert_eq!(uploaded_asset_id(json!({ "asset": {} })), None);
    }

    fn reference() -> ReferenceImage {
        ReferenceImage { name: "sketch_upload".into(), mime_type: "image/jpeg", bytes: b"jpeg".to_vec() }
    }

    #[tokio::test]
    async fn test_image_to_image_uses_uploaded_asset() {
        let mut api = FakeJobApi::new(vec![Ok(json!({
            "job": { "status": "success", "images": ["https://cdn/out.png"] }
        }))]);
        api.upload_response = Some(json!({ "asset": { "assetId": "ref-1" } }));
        let api = Arc::new(api);

        let assets = client(api.clone(), Arc::default())
            .generate_from_image("ink style", &reference(), 3.0, &GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(assets[0].url, "https://cdn/out.png");

        let uploaded = api.uploaded.lock().unwrap()[0].clone();
        assert_eq!(uploaded["image"], "anBlZw==");
        assert_eq!(uploaded["name"], "sketch_upload");

        let (kind, payload) = api.submitted.lock().unwrap()[0].clone();
        assert_eq!(kind, GenerationKind::ImageToImage);
        assert_eq!(payload["image"], "ref-1");
        assert_eq!(payload["strength"], 1.0);
        assert_eq!(payload["prompt"], "ink style");
    }

    #[tokio::test]
    async fn test_failed_upload_falls_back_to_data_url() {
        let api = Arc::new(FakeJobApi::new(vec![success_with_assets(&["a1"])]));
        let _ = client(api.clone(), Arc::default())
            .generate_from_image("ink style", &reference(), 0.8, &GenerationParams::default())
            .await;

        let (_, payload) = api.submitted.lock().unwrap()[0].clone();
        assert_eq!(payload["image"], "data:image/jpeg;base64,anBlZw==");
        assert_eq!(api.polls_made(), 1);
    }

    #[tokio::test]
    async fn test_reference_image_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Figure 1.JPG");
        std::fs::write(&path, b"jpeg").unwrap();
        let loaded = ReferenceImage::load(&path).await.unwrap();
        assert_eq!(loaded.name, "Figure 1_upload");
        assert_eq!(loaded.mime_type, "image/jpeg");

        let missing = ReferenceImage::load(&dir.path().join("nope.png")).await;
        assert!(matches!(missing, Err(GenerationError::InvalidReference(_))));

        let big = dir.path().join("big.png");
        std::fs::write(&big, vec![0u8; MAX_REFERENCE_BYTES + 1]).unwrap();
        assert!(matches!(
            ReferenceImage::load(&big).await,
            Err(GenerationError::InvalidReference(_))
        ));
    }
}
