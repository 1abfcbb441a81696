//! `POST /api/analyze`: video plus instruction in, prompt out.
//!
//! Without any pipeline field the request runs a single generation and
//! answers `{prompt, runId}`. With at least one, it runs the consensus
//! pipeline and answers `{prompt, runId, meta}`, adding
//! `error: "No consensus"` (still 200) when the fallback text was used.

use axum::extract::{Multipart, State};
use axum::Json;
use consensus::{
    ActivityEvent, ActivityPhase, Decision, PipelineConfig, PipelineError, RunRequest,
    SourceArtifact,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::sanitize::sanitize_prompt;

const FAILURE_MESSAGE: &str = "Failed to analyze video";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    pub prompt: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

/// Raw multipart fields. Empty text fields count as absent.
#[derive(Debug, Default)]
struct AnalyzeForm {
    video: Option<SourceArtifact>,
    prompt_text: Option<String>,
    run_id: Option<String>,
    generators: Option<String>,
    deciders: Option<String>,
    generator_model: Option<String>,
    decider_model: Option<String>,
    temperature: Option<String>,
    max_output_tokens: Option<String>,
}

impl AnalyzeForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {e}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == "video" {
                let file_name = field.file_name().map(str::to_string);
                let mime_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read video: {e}")))?;
                let mut artifact = SourceArtifact::new(bytes.to_vec());
                artifact.file_name = file_name;
                artifact.mime_type = mime_type;
                form.video = Some(artifact);
                continue;
            }

            let slot = match name.as_str() {
                "promptText" => &mut form.prompt_text,
                "runId" => &mut form.run_id,
                "generators" => &mut form.generators,
                "deciders" => &mut form.deciders,
                "generatorModel" => &mut form.generator_model,
                "deciderModel" => &mut form.decider_model,
                "temperature" => &mut form.temperature,
                "maxOutputTokens" => &mut form.max_output_tokens,
                _ => continue,
            };
            let value = field
                .text()
                .await
                .map_err(|e| ApiError::bad_request(format!("Failed to read field {name}: {e}")))?;
            *slot = Some(value).filter(|v| !v.trim().is_empty());
        }
        Ok(form)
    }

    /// Any pipeline setting switches the request to consensus mode.
    fn wants_pipeline(&self) -> bool {
        [
            &self.generators,
            &self.deciders,
            &self.generator_model,
            &self.decider_model,
            &self.temperature,
            &self.max_output_tokens,
        ]
        .iter()
        .any(|field| field.is_some())
    }

    /// Overlay the request's settings on the service defaults. Only parsing
    /// happens here; range checks are left to the pipeline.
    fn pipeline_config(&self, defaults: &PipelineConfig) -> Result<PipelineConfig, String> {
        let mut config = defaults.clone();
        if let Some(n) = parse_field(&self.generators, "generators")? {
            config.generators = n;
        }
        if let Some(k) = parse_field(&self.deciders, "deciders")? {
            config.evaluators = k;
        }
        if let Some(model) = &self.generator_model {
            config.generator_model = model.trim().to_string();
        }
        if let Some(model) = &self.decider_model {
            config.evaluator_model = model.trim().to_string();
        }
        if let Some(t) = parse_field(&self.temperature, "temperature")? {
            config.temperature = t;
        }
        if let Some(tokens) = parse_field(&self.max_output_tokens, "maxOutputTokens")? {
            config.max_output_tokens = tokens;
        }
        Ok(config)
    }
}

fn parse_field<T: std::str::FromStr>(raw: &Option<String>, name: &str) -> Result<Option<T>, String> {
    raw.as_deref()
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|_| format!("Invalid {name}: {v}"))
        })
        .transpose()
}

pub async fn analyze(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let form = AnalyzeForm::read(multipart).await?;

    let video = form
        .video
        .clone()
        .ok_or_else(|| ApiError::bad_request("Missing video file"))?;
    let instruction = form
        .prompt_text
        .as_deref()
        .and_then(sanitize_prompt)
        .ok_or_else(|| ApiError::bad_request("Missing prompt text"))?;
    let run_id = form
        .run_id
        .as_deref()
        .map(str::trim)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let production = state.is_production();
    let pipeline = form.wants_pipeline();
    let config = match form.pipeline_config(&state.config.pipeline) {
        Ok(config) => config,
        Err(message) => {
            // Same terminal event the pipeline records for its own config errors.
            state.bus.append(
                &run_id,
                ActivityEvent::new(ActivityPhase::Error, "run_failed", message.as_str())
                    .with("reason", "invalid_config"),
            );
            return Err(ApiError::bad_request(message));
        }
    };
    let request = RunRequest::new(video, instruction)
        .with_run_id(run_id.clone())
        .with_config(config);
    info!(run_id = %run_id, pipeline, bytes = request.artifact.len(), "analyze request");

    // Dropping this handler (client disconnect) cancels the detached run,
    // which still appends its terminal event.
    let cancel = CancellationToken::new();
    let _disconnect = cancel.clone().drop_guard();
    let orchestrator = state.orchestrator.clone();

    if !pipeline {
        let handle =
            tokio::spawn(async move { orchestrator.generate_once(request, &cancel).await });
        let prompt = join(handle, production)
            .await?
            .map_err(|e| ApiError::from_pipeline(e, FAILURE_MESSAGE, production))?;
        return Ok(Json(AnalyzeResponse {
            prompt,
            run_id,
            meta: None,
            error: None,
        }));
    }

    let handle = tokio::spawn(async move { orchestrator.run(request, &cancel).await });
    let decision = join(handle, production)
        .await?
        .map_err(|e| ApiError::from_pipeline(e, FAILURE_MESSAGE, production))?;

    let error = (!decision.has_consensus()).then_some("No consensus");
    if error.is_some() {
        warn!(run_id = %run_id, reason = ?decision.reason, "returning fallback text");
    }
    Ok(Json(AnalyzeResponse {
        prompt: decision.text.clone(),
        run_id,
        meta: Some(decision),
        error,
    }))
}

async fn join<T>(
    handle: tokio::task::JoinHandle<Result<T, PipelineError>>,
    production: bool,
) -> Result<Result<T, PipelineError>, ApiError> {
    handle
        .await
        .map_err(|e| ApiError::internal(format!("analyze task failed: {e}"), FAILURE_MESSAGE, production))
}
