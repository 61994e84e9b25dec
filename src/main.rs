use std::sync::Arc;
use rmcp::{
    handler::server::tool::ToolRouter, handler::server::wrapper::Parameters,
    model::*, tool, tool_handler, tool_router,
    transport::stdio, ErrorData as McpError, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

mod apis;
mod cache;
mod clock;
mod config;
mod generate;
mod http;
mod pipeline;
mod scrape;

use config::Config;
use generate::{GenerationOverrides, DEFAULT_STRENGTH};
use pipeline::{Pipeline, PipelineError};

// ── Parameter structs ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct ProcessPapersParams {
    #[schemars(description = "Search query string")]
    query: String,
    #[schemars(description = "Number of papers to process (default 5, max 20)")]
    num_papers: Option<u32>,
    #[schemars(description = "Restrict results to the last 'week', 'month' or 'year'")]
    date_range: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GenerateImageParams {
    #[schemars(description = "Paper title")]
    title: String,
    #[serde(rename = "abstract")]
    #[schemars(description = "Paper abstract; long abstracts are truncated")]
    abstract_text: Option<String>,
    #[schemars(description = "Publication year")]
    year: Option<u32>,
    #[serde(flatten)]
    overrides: OverrideParams,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct TransformImageParams {
    #[schemars(description = "Path to a local reference image (max 10MB)")]
    image_path: String,
    #[schemars(description = "How the reference should be transformed")]
    prompt: String,
    #[schemars(description = "Transformation strength from 0.1 (subtle) to 1.0 (major changes), default 0.8")]
    strength: Option<f32>,
    #[serde(flatten)]
    overrides: OverrideParams,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct OverrideParams {
    #[schemars(description = "Image width in pixels (default 1024)")]
    width: Option<u32>,
    #[schemars(description = "Image height in pixels (default 1024)")]
    height: Option<u32>,
    #[schemars(description = "Number of images to generate (default 1)")]
    samples: Option<u32>,
    #[schemars(description = "Number of inference steps (default 28)")]
    steps: Option<u32>,
    #[schemars(description = "Guidance scale (default 3.5)")]
    guidance: Option<f32>,
    #[schemars(description = "Elements the image should avoid")]
    negative_prompt: Option<String>,
}

impl From<OverrideParams> for GenerationOverrides {
    fn from(p: OverrideParams) -> Self {
        GenerationOverrides {
            width: p.width,
            height: p.height,
            samples: p.samples,
            steps: p.steps,
            guidance: p.guidance,
            negative_prompt: p.negative_prompt,
        }
    }
}

// ── Server ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PaperVisualizerServer {
    tool_router: ToolRouter<Self>,
    config: Arc<Config>,
    pipeline: Arc<Pipeline>,
}

fn pipeline_error(e: PipelineError) -> McpError {
    match e {
        PipelineError::SearchUnavailable
        | PipelineError::GenerationUnavailable
        | PipelineError::InvalidReference(_) => {
            McpError::invalid_params(e.to_string(), None)
        }
        PipelineError::Search(_) => McpError::internal_error(format!("Pipeline error: {}", e), None),
    }
}

fn json_result<T: serde::Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("Serialization error: {}", e), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

#[tool_router]
impl PaperVisualizerServer {
    pub fn create() -> anyhow::Result<Self> {
        let config = Config::from_env();
        let pipeline = config.build_pipeline()?;

        tracing::info!(
            "Initialized pipeline (search={}, images={}), data_dir={}",
            pipeline.has_search(),
            pipeline.has_generator(),
            config.data_dir.display()
        );

        Ok(Self {
            tool_router: Self::tool_router(),
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
        })
    }

    #[tool(description = "Report service health and which backends are configured")]
    async fn health(&self) -> Result<CallToolResult, McpError> {
        json_result(&serde_json::json!({
            "status": "healthy",
            "service": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "services": self.config.service_status(),
        }))
    }

    #[tool(description = "Search scholarly papers and scrape their full abstracts (falls back to search snippets). Does not generate images.")]
    async fn process_papers(
        &self,
        Parameters(params): Parameters<ProcessPapersParams>,
    ) -> Result<CallToolResult, McpError> {
        let result = self
            .pipeline
            .process(&params.query, params.num_papers, params.date_range.as_deref())
            .await
            .map_err(pipeline_error)?;
        json_result(&result)
    }

    #[tool(description = "Search, scrape, and generate an illustration for every paper. Slow: each image is a remote job.")]
    async fn process_papers_with_images(
        &self,
        Parameters(params): Parameters<ProcessPapersParams>,
    ) -> Result<CallToolResult, McpError> {
        let result = self
            .pipeline
            .process_with_images(&params.query, params.num_papers, params.date_range.as_deref())
            .await
            .map_err(pipeline_error)?;
        json_result(&result)
    }

    #[tool(description = "Generate an illustration for a single paper from its title, abstract and year. Size, samples, steps, guidance and negative prompt can be overridden.")]
    async fn generate_image(
        &self,
        Parameters(params): Parameters<GenerateImageParams>,
    ) -> Result<CallToolResult, McpError> {
        let overrides = GenerationOverrides::from(params.overrides);
        let image = self
            .pipeline
            .generate_image(&params.title, params.abstract_text.as_deref(), params.year, &overrides)
            .await
            .map_err(pipeline_error)?;
        json_result(&image)
    }

    #[tool(description = "Transform a local reference image with a text prompt (image-to-image)")]
    async fn transform_image(
        &self,
        Parameters(params): Parameters<TransformImageParams>,
    ) -> Result<CallToolResult, McpError> {
        let overrides = GenerationOverrides::from(params.overrides);
        let image = self
            .pipeline
            .transform_image(
                std::path::Path::new(&params.image_path),
                &params.prompt,
                params.strength.unwrap_or(DEFAULT_STRENGTH),
                &overrides,
            )
            .await
            .map_err(pipeline_error)?;
        json_result(&image)
    }

    #[tool(description = "Return the most recent pipeline result, if any")]
    async fn last_result(&self) -> Result<CallToolResult, McpError> {
        match self.pipeline.last_result().await {
            Some(result) => json_result(&result),
            None => Ok(CallToolResult::success(vec![Content::text(
                "No results yet. Run process_papers first.",
            )])),
        }
    }
}

#[tool_handler]
impl ServerHandler for PaperVisualizerServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Find research papers on Google Scholar, recover full abstracts from \
                 publisher pages (arXiv, PubMed, IEEE, ACM, Springer, generic), and \
                 generate an illustrative image per paper."
                    .into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("Starting paper-visualizer MCP server");

    let server = PaperVisualizerServer::create()?;
    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    Ok(())
}
