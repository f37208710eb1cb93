use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Json, Query, State,
    },
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Router,
};
use hf_hub::api::tokio::Api;
use plume_core::{
    load_model, ArtifactWriter, DwtDctCodec, GenerationRequest, GenerationService, OutputManifest,
    Pipeline, PlumeError, PromptSource, SafetyClassifier, SafetyFilter, WatermarkStage,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

mod args;

pub use args::{Args, GenerateParams, GenerationDefaults};

/// Builds a fresh safety classifier for each model replica.
pub type ClassifierFactory = Box<dyn Fn() -> Box<dyn SafetyClassifier>>;

// Application state shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    service: Arc<GenerationService>,
    defaults: Arc<GenerationRequest>,
}

impl AppState {
    pub fn new(service: GenerationService, defaults: GenerationRequest) -> Self {
        Self {
            service: Arc::new(service),
            defaults: Arc::new(defaults),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/generate", post(generate_handler))
        .route("/txt2img", post(txt2img_handler))
        .with_state(state)
}

/// Error returned to HTTP clients as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<PlumeError> for ApiError {
    fn from(e: PlumeError) -> Self {
        let status = match &e {
            PlumeError::Configuration(_) => StatusCode::BAD_REQUEST,
            PlumeError::QueueFull | PlumeError::ServiceUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: rejection.body_text(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("request failed: {}", self.message);
        } else {
            warn!("request rejected: {}", self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(include_str!("../assets/index.html"))
}

async fn generate_handler(
    State(state): State<AppState>,
    body: Result<Json<GenerateParams>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(params) = body?;
    let request = params.into_request(&state.defaults)?;
    render(&state, request).await
}

#[derive(Deserialize)]
struct Txt2ImgQuery {
    prompt_text: String,
}

async fn txt2img_handler(
    State(state): State<AppState>,
    query: Result<Query<Txt2ImgQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query?;
    let request = GenerationRequest {
        prompt: PromptSource::Single(query.prompt_text),
        ..(*state.defaults).clone()
    };
    request.validate()?;
    render(&state, request).await
}

/// Runs `request` and answers with the PNG bytes of its primary artifact.
async fn render(state: &AppState, request: GenerationRequest) -> Result<Response, ApiError> {
    let manifest = state.service.generate(request).await?;
    let bytes = read_primary(&manifest).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response())
}

async fn read_primary(manifest: &OutputManifest) -> Result<Vec<u8>, PlumeError> {
    let record = manifest
        .primary()
        .ok_or_else(|| PlumeError::ArtifactMissing("no image was written".to_string()))?;
    tokio::fs::read(&record.file_path).await.map_err(|e| {
        PlumeError::ArtifactMissing(format!("{}: {e}", record.file_path.display()))
    })
}

/// Loads one model replica per device, starts the workers and serves HTTP until shutdown.
pub async fn run(args: Args, classifier: Option<ClassifierFactory>) -> anyhow::Result<()> {
    let defaults = args
        .defaults
        .to_request()
        .context("invalid generation defaults")?;
    let writer = Arc::new(
        ArtifactWriter::create(args.outdir.clone(), args.latest_pointer())
            .context("failed to prepare output directory")?,
    );
    let watermark = if args.no_watermark {
        WatermarkStage::disabled()
    } else {
        WatermarkStage::new(Arc::new(DwtDctCodec::default()), args.watermark.as_bytes())
    };
    if classifier.is_none() {
        warn!("no safety classifier configured, samples are written unscreened");
    }

    let api = Api::new()?;
    let mut pipelines = Vec::new();
    for device_map in args.device_maps() {
        let backend = load_model(&args.model, api.clone(), device_map)
            .await
            .with_context(|| format!("failed to load {} on device {device_map}", args.model))?;
        let safety = classifier
            .as_ref()
            .map(|make| SafetyFilter::new(make(), args.placeholder.clone()));
        pipelines.push(Pipeline::new(backend, safety, watermark.clone(), writer.clone()));
    }
    let service = GenerationService::start(pipelines, args.queue_capacity)?;

    let app = router(AppState::new(service, defaults));

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
