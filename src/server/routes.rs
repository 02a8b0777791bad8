//! HTTP endpoints used outside the live turn flow

use super::{ApiError, AppState};
use crate::engine::{EngineKind, EngineStatus};
use crate::imaging::{
    CharacterType, ImageExplainer, ImageGenerator, ImageRequest, DEFAULT_EXPLAIN_PROMPT,
};
use crate::llm::prompts::compose_image_prompt;
use crate::llm::{strip_tags, ChatModel};
use crate::speech::audio::i16_to_pcm16le;
use crate::speech::{normalize_text_for_tts, Synthesizer};
use crate::utils::perf::LatencySummary;
use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

/// Portraits are square regardless of the scene image size
const PORTRAIT_SIZE: u32 = 512;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let interactive_loaded = [EngineKind::Stt, EngineKind::Tts, EngineKind::Llm]
        .iter()
        .all(|kind| state.engines.status(*kind).loaded);
    Json(json!({
        "status": "ok",
        "engines_initialized": interactive_loaded,
    }))
}

#[derive(Serialize)]
pub struct ModelStatus {
    engines: Vec<EngineStatus>,
    low_resource_mode: bool,
    loaded_memory_mb: u64,
    tts_engine: String,
    tts_engines: Vec<String>,
    active_sessions: usize,
    uptime_secs: u64,
    latency: LatencySummary,
}

pub async fn model_status(State(state): State<AppState>) -> Json<ModelStatus> {
    let engines = state.engines.snapshot();
    let loaded_memory_mb = engines
        .iter()
        .filter(|s| s.loaded)
        .map(|s| s.memory_estimate_mb)
        .sum();

    Json(ModelStatus {
        engines,
        low_resource_mode: state.engines.policy().low_resource(),
        loaded_memory_mb,
        tts_engine: state.engines.active_tts_engine(),
        tts_engines: state.engines.tts_engine_names(),
        active_sessions: state.active_sessions(),
        uptime_secs: state.uptime().as_secs(),
        latency: state.latency.lock().summary(),
    })
}

pub async fn load_engine(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<EngineStatus>, ApiError> {
    let kind: EngineKind = kind.parse()?;
    state.engines.preload(kind).await?;
    Ok(Json(state.engines.status(kind)))
}

pub async fn unload_engine(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let kind: EngineKind = kind.parse()?;
    let unloaded = state.engines.unload(kind).await?;
    Ok(Json(json!({
        "kind": kind,
        "unloaded": unloaded,
        "status": state.engines.status(kind),
    })))
}

#[derive(Deserialize)]
pub struct TtsRequest {
    text: String,
    #[serde(default)]
    voice: Option<String>,
}

/// Synthesize a stored message for replay. Returns raw PCM16LE.
pub async fn synthesize(
    State(state): State<AppState>,
    Json(req): Json<TtsRequest>,
) -> Result<Response, ApiError> {
    let text = normalize_text_for_tts(&strip_tags(&req.text));
    if !text.chars().any(char::is_alphanumeric) {
        return Err(ApiError::bad_request("Nothing to synthesize"));
    }

    let lease = state.engines.tts().acquire().await?;
    let result = lease.synthesize(&text, req.voice.as_deref()).await;
    lease.release().await;
    let audio = result?;

    info!("Synthesized {} samples for replay", audio.samples.len());
    let sample_rate = HeaderValue::from(audio.sample_rate);
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("audio/pcm")),
            (header::HeaderName::from_static("x-sample-rate"), sample_rate),
        ],
        i16_to_pcm16le(&audio.samples),
    )
        .into_response())
}

pub async fn voices(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let engine = state.engines.tts().engine()?;
    let voices = engine.voices().await?;
    Ok(Json(json!({
        "tts_engine": state.engines.active_tts_engine(),
        "voices": voices,
        "default": engine.default_voice(),
    })))
}

#[derive(Deserialize)]
pub struct ModelsQuery {
    #[serde(default)]
    host: Option<String>,
}

pub async fn llm_models(
    State(state): State<AppState>,
    Query(query): Query<ModelsQuery>,
) -> Result<Json<Value>, ApiError> {
    let host = query.host.filter(|h| !h.trim().is_empty());
    let models = state
        .engines
        .llm()
        .engine()?
        .list_models(host.as_deref())
        .await?;
    Ok(Json(json!({
        "host": host.unwrap_or_else(|| state.config.llm.host.clone()),
        "models": models,
    })))
}

#[derive(Deserialize)]
pub struct GenerateImageRequest {
    prompt: String,
    #[serde(default)]
    character_description: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
}

pub async fn generate_image(
    State(state): State<AppState>,
    Json(req): Json<GenerateImageRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt is required"));
    }
    let prompt = compose_image_prompt(req.character_description.as_deref(), &req.prompt);
    let settings = &state.config.image_generator;
    let request = ImageRequest::from_settings(prompt, settings).with_size(
        req.width.unwrap_or(settings.width),
        req.height.unwrap_or(settings.height),
    );

    let lease = state.engines.image_generator().acquire().await?;
    let result = lease.generate(&request).await;
    lease.release().await;
    let image = result?;

    Ok(Json(json!({
        "image": image.to_base64(),
        "prompt": image.prompt,
        "format": "png",
    })))
}

/// Collected multipart fields
#[derive(Default)]
struct UploadForm {
    file: Option<Vec<u8>>,
    fields: Vec<(String, String)>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = UploadForm::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed reading multipart field: {}", e)))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == "file" {
                let bytes = field.bytes().await.map_err(|e| {
                    ApiError::bad_request(format!("Failed reading multipart 'file' field: {}", e))
                })?;
                form.file = Some(bytes.to_vec());
            } else {
                let text = field.text().await.map_err(|e| {
                    let message = format!("Failed reading multipart '{}' field: {}", name, e);
                    ApiError::bad_request(message)
                })?;
                form.fields.push((name, text));
            }
        }
        Ok(form)
    }

    fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn take_file(&mut self) -> Result<Vec<u8>, ApiError> {
        self.file
            .take()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| ApiError::bad_request("A non-empty 'file' field is required"))
    }
}

pub async fn explain_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut form = UploadForm::read(multipart).await?;
    let image = form.take_file()?;
    let prompt = form
        .field("prompt")
        .filter(|p| !p.trim().is_empty())
        .unwrap_or(DEFAULT_EXPLAIN_PROMPT)
        .to_string();

    let lease = state.engines.image_explainer().acquire().await?;
    let result = lease.explain(&image, &prompt).await;
    lease.release().await;

    Ok(Json(json!({ "description": result? })))
}

pub async fn upload_character(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut form = UploadForm::read(multipart).await?;
    let kind: CharacterType = form
        .field("character_type")
        .ok_or_else(|| ApiError::bad_request("character_type is required"))?
        .parse()?;
    let bytes = form.take_file()?;

    let portrait = state.portraits.save_upload(kind, &bytes).await?;
    Ok(Json(json!({
        "success": true,
        "character_type": kind,
        "filename": portrait.filename,
        "path": portrait.path,
        "image": portrait.image,
    })))
}

#[derive(Deserialize)]
pub struct GenerateCharacterRequest {
    character_type: CharacterType,
    description: String,
}

pub async fn generate_character(
    State(state): State<AppState>,
    Json(req): Json<GenerateCharacterRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.description.trim().is_empty() {
        return Err(ApiError::bad_request("description is required"));
    }
    let prompt = format!("portrait, head and shoulders, {}", req.description.trim());
    let request = ImageRequest::from_settings(prompt, &state.config.image_generator)
        .with_size(PORTRAIT_SIZE, PORTRAIT_SIZE);

    let lease = state.engines.image_generator().acquire().await?;
    let result = lease.generate(&request).await;
    lease.release().await;
    let image = result?;

    let portrait = state
        .portraits
        .save_generated(req.character_type, &image.png)
        .await?;
    Ok(Json(json!({
        "success": true,
        "character_type": req.character_type,
        "filename": portrait.filename,
        "path": portrait.path,
        "image": portrait.image,
        "prompt": image.prompt,
    })))
}

pub async fn character_images(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let user = state.portraits.latest(CharacterType::User).await?;
    let assistant = state.portraits.latest(CharacterType::Assistant).await?;
    Ok(Json(json!({
        "user": user,
        "assistant": assistant,
    })))
}
