//! HTTP surface: `/verify`, `/register`, `/health`.
//!
//! Every `/verify` outcome is reported as HTTP 200; callers inspect
//! `verified`. Only `/register` uses an error status.

use crate::engine::{EngineError, EngineHandle};
use crate::payload;
use crate::resolver::{ImageResolver, Resolution};
use crate::scratch::ScratchDir;
use crate::store::VoterStore;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{body::Bytes, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::{self, TraceLayer};
use tracing::{Instrument, Level};

const VOTER_ID_KEYS: &[&str] = &["voter_id", "voterId", "voterID"];
const IMAGE_KEYS: &[&str] = &["image", "faceImage", "photo", "capture"];

/// Characters of the image payload shown in debug logs.
const PREVIEW_CHARS: usize = 50;

const MSG_VERIFIED: &str = "Identity verified";
const MSG_MISMATCH: &str = "Face does not match registered photo";
const MSG_NOT_FOUND: &str = "Voter ID not found or no registered image";
const MSG_REGISTER_DISABLED: &str =
    "Registration is disabled on this service; use the voter registration API.";

/// Dependencies shared by all handlers. Built once in `main`.
pub struct AppState {
    pub store: Arc<dyn VoterStore>,
    pub resolver: ImageResolver,
    pub engine: EngineHandle,
    pub scratch: ScratchDir,
    pub similarity_threshold: f32,
}

pub type SharedState = Arc<AppState>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("{0}")]
    Panicked(String),
    #[error("verification task failed: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub similarity: f32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
}

impl VerifyResponse {
    /// Negative verdict for a request that never reached comparison.
    fn rejected(message: impl Into<String>) -> Self {
        Self {
            verified: false,
            name: None,
            similarity: 0.0,
            message: message.into(),
            processing_time: None,
        }
    }

    fn failed(err: &PipelineError, started: Instant) -> Self {
        Self {
            processing_time: Some(started.elapsed().as_secs_f64()),
            ..Self::rejected(format!("Error: {err}"))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub mongodb: String,
    pub temp_directory: String,
    pub temp_dir_path: String,
    pub version: String,
    pub engine: String,
}

pub fn router(state: SharedState, max_body_bytes: usize, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/verify", post(verify))
        .route("/register", post(register))
        .route("/health", get(health))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(cors_layer(cors_origins))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Any origin when `origins` is empty, otherwise only the listed ones.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring unparsable CORS origin");
                None
            }
        })
        .collect();

    if allowed.is_empty() {
        if !origins.is_empty() {
            tracing::warn!("no usable CORS origins configured; allowing any origin");
        }
        return CorsLayer::permissive();
    }

    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
}

async fn verify(
    State(state): State<SharedState>,
    body: Result<Bytes, BytesRejection>,
) -> Json<VerifyResponse> {
    let started = Instant::now();
    let request_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!("verify", %request_id);

    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            tracing::warn!(parent: &span, error = %rejection, "cannot read request body");
            return Json(VerifyResponse::rejected(format!(
                "Error reading request body: {}",
                rejection.body_text()
            )));
        }
    };

    // The pipeline runs as its own task so a panic anywhere inside it is
    // reported to the caller like any other failure.
    let task = tokio::spawn(run_pipeline(state, body, started).instrument(span.clone()));
    let result = match task.await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => {
            Err(PipelineError::Panicked(panic_message(join_err.into_panic())))
        }
        Err(join_err) => Err(PipelineError::Aborted(join_err.to_string())),
    };

    let response = result.unwrap_or_else(|e| {
        tracing::error!(parent: &span, error = %e, "verification failed");
        VerifyResponse::failed(&e, started)
    });
    Json(response)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "verification panicked".to_string()
    }
}

async fn run_pipeline(
    state: SharedState,
    body: Bytes,
    started: Instant,
) -> Result<VerifyResponse, PipelineError> {
    let fields = match parse_body(&body) {
        Ok(fields) => fields,
        Err(message) => {
            tracing::warn!(%message, "rejecting request body");
            return Ok(VerifyResponse::rejected(message));
        }
    };
    tracing::info!(keys = ?fields.keys().collect::<Vec<_>>(), "request parsed");

    let Some(voter_id) = voter_id_field(&fields) else {
        let keys = python_list(fields.keys());
        tracing::warn!(%keys, "request has no voter id");
        return Ok(VerifyResponse::rejected(format!(
            "Missing voter_id. Available keys: {keys}"
        )));
    };
    let Some(image) = image_field(&fields) else {
        tracing::warn!(%voter_id, "request has no image data");
        return Ok(VerifyResponse::rejected("Missing image data"));
    };
    tracing::debug!(
        %voter_id,
        data_url = payload::is_data_url(image),
        preview = %image.chars().take(PREVIEW_CHARS).collect::<String>(),
        "image payload received"
    );

    let (registered, name) = match state.resolver.resolve(&voter_id).await {
        Resolution::Found { path, name, source } => {
            tracing::info!(%voter_id, path = %path.display(), ?source, "registered image resolved");
            (path, name)
        }
        unresolved => {
            tracing::warn!(%voter_id, name = unresolved.name(), "no registered image for voter");
            return Ok(VerifyResponse::rejected(MSG_NOT_FOUND));
        }
    };

    let capture = state.scratch.capture_path(&voter_id, chrono::Local::now());
    let guard = CaptureGuard(capture.clone());
    match payload::materialize(image, &capture).await {
        Ok(bytes) => tracing::info!(path = %capture.display(), bytes, "captured image saved"),
        Err(e) => {
            tracing::error!(%voter_id, error = %e, "cannot save captured image");
            return Ok(VerifyResponse::rejected(format!("Error processing image: {e}")));
        }
    }

    let outcome = state
        .engine
        .compare(registered, capture, state.similarity_threshold)
        .await?;
    drop(guard);

    let elapsed = started.elapsed().as_secs_f64();
    tracing::info!(
        %voter_id,
        verified = outcome.matched,
        similarity = outcome.similarity,
        model = outcome.model.as_deref().unwrap_or("none"),
        elapsed_secs = elapsed,
        "verification complete"
    );

    Ok(VerifyResponse {
        verified: outcome.matched,
        name: Some(name),
        similarity: outcome.similarity,
        message: if outcome.matched { MSG_VERIFIED } else { MSG_MISMATCH }.to_string(),
        processing_time: Some(elapsed),
    })
}

/// Removes the captured image when the request finishes, however it ends.
struct CaptureGuard(PathBuf);

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => tracing::debug!(path = %self.0.display(), "captured image removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.0.display(), error = %e, "cannot remove captured image"),
        }
    }
}

/// Parse the body into a JSON object, falling back to a lenient re-parse
/// of the text. The error is the client-facing message.
fn parse_body(body: &[u8]) -> Result<Map<String, Value>, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err("No data received".to_string());
    }

    let value = match serde_json::from_slice::<Value>(body) {
        Ok(value) => value,
        Err(strict) => {
            tracing::debug!(error = %strict, "strict JSON parse failed; retrying on text");
            let text = String::from_utf8_lossy(body);
            let text = text.trim_start_matches('\u{feff}').trim();
            serde_json::from_str::<Value>(text).map_err(|e| format!("Invalid JSON format: {e}"))?
        }
    };

    match value {
        Value::Object(fields) => Ok(fields),
        _ => Err("Invalid JSON format: expected a JSON object".to_string()),
    }
}

/// First non-empty candidate; numeric ids are accepted as their decimal text.
fn voter_id_field(fields: &Map<String, Value>) -> Option<String> {
    VOTER_ID_KEYS.iter().find_map(|key| match fields.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn image_field(fields: &Map<String, Value>) -> Option<&str> {
    IMAGE_KEYS.iter().find_map(|key| match fields.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.as_str()),
        _ => None,
    })
}

/// `['a', 'b']`
fn python_list<'a>(keys: impl Iterator<Item = &'a String>) -> String {
    let quoted: Vec<String> = keys.map(|k| format!("'{k}'")).collect();
    format!("[{}]", quoted.join(", "))
}

async fn register() -> impl IntoResponse {
    tracing::info!("registration requested on disabled endpoint");
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "success": false, "message": MSG_REGISTER_DISABLED })),
    )
}

async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let mongodb = match state.store.ping().await {
        Ok(()) => "connected".to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "voter store ping failed");
            format!("error: {e}")
        }
    };
    let temp_directory = if state.scratch.exists().await { "exists" } else { "missing" };

    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Local::now()
            .naive_local()
            .format("%Y-%m-%dT%H:%M:%S%.6f")
            .to_string(),
        mongodb,
        temp_directory: temp_directory.to_string(),
        temp_dir_path: state.scratch.root().display().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        engine: if state.engine.is_running() { "running" } else { "stopped" }.to_string(),
    })
}
