//! HTTP service: POST /generate
//!
//! Thin axum layer over [`GenerationSession`]. The handler deserializes
//! the request, assembles the instruction prompt, and hands off to the
//! session on a blocking thread; generation is CPU/GPU bound and must not
//! stall the async runtime.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{error, info};

use crate::dataset::{ASST_TAG, USER_TAG};
use crate::error::SteerError;
use crate::session::GenerationSession;

/// Per-axis steering weights, positive toward the first pole.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AxisWeights {
    pub happy_sad: f32,
    pub angry_calm: f32,
    pub disgusted_interested: f32,
}

impl AxisWeights {
    /// Weights in the bundle's declared axis order.
    pub fn as_vec(&self) -> Vec<f32> {
        vec![self.happy_sad, self.angry_calm, self.disgusted_interested]
    }
}

/// A /generate request. Persona fields default to the Gizmo character.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub weights: AxisWeights,
    #[serde(default = "default_persona")]
    pub persona: String,
    #[serde(default = "default_rules")]
    pub rules: String,
    #[serde(default = "default_task")]
    pub task: String,
}

fn default_persona() -> String {
    "you are roleplaying as Gizmo, a living digital cute sphere.".to_string()
}

fn default_rules() -> String {
    "IMPORTANT: use maximum 30 words. use lowercase. be concise and emotive.".to_string()
}

fn default_task() -> String {
    "you are Gizmo. answer the following message from your interlocutor:".to_string()
}

/// Assemble the single-turn instruction prompt the service decodes from.
pub fn service_prompt(persona: &str, rules: &str, task: &str, prompt: &str) -> String {
    format!("{USER_TAG} {persona} {rules} {task} {prompt} {ASST_TAG}")
}

/// Build the service router.
pub fn router(session: Arc<GenerationSession>) -> Router {
    Router::new()
        .route("/generate", post(generate_handler))
        .with_state(session)
}

/// Bind and serve until the process is stopped.
pub async fn serve(session: Arc<GenerationSession>, addr: SocketAddr) -> Result<()> {
    let app = router(session);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn generate_handler(
    State(session): State<Arc<GenerationSession>>,
    Json(request): Json<GenerateRequest>,
) -> Result<String, (StatusCode, String)> {
    let prompt = service_prompt(
        &request.persona,
        &request.rules,
        &request.task,
        &request.prompt,
    );
    let weights = request.weights.as_vec();

    let reply = tokio::task::spawn_blocking(move || session.generate(&prompt, &weights))
        .await
        .map_err(|e| {
            error!("Generation task panicked: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "generation task failed".to_string(),
            )
        })?
        .map_err(|e| {
            let status = match e.downcast_ref::<SteerError>() {
                Some(SteerError::BundleMismatch(_)) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error!("Generation failed: {e:#}");
            (status, format!("{e:#}"))
        })?;

    Ok(reply)
}
