//! Gemini adapter for the consensus [`ContentBackend`].
//!
//! - `upload`: resumable Files API upload, then poll until the file is `ACTIVE`
//! - `generate`: `generateContent` with the uploaded file plus the instruction
//! - `evaluate`: `generateContent` over the rendered evaluator prompt
//!
//! Responses are reduced to the first text part of the first candidate.
//! Retries are the caller's job.

pub mod prompt;
pub mod types;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use consensus::{
    ArtifactRef, BackendError, BackendResult, ContentBackend, GenerationParams,
    PresentedCandidate, SourceArtifact,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::GeminiConfig;
use prompt::build_evaluator_prompt;
use types::{
    Content, FileData, FileState, GenerateContentRequest, GenerateContentResponse,
    GenerationConfig, Part, RemoteFile, StartUploadRequest, UploadFileMeta, UploadResponse,
};

const API_KEY_HEADER: &str = "x-goog-api-key";
const UPLOAD_URL_HEADER: &str = "x-goog-upload-url";
const OCTET_STREAM: &str = "application/octet-stream";
pub const DEFAULT_VIDEO_MIME: &str = "video/mp4";

/// MIME type implied by a file name's extension, for the video formats the
/// service accepts.
pub fn infer_mime_type(file_name: &str) -> Option<&'static str> {
    let ext = Path::new(file_name).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "mp4" => Some("video/mp4"),
        "mov" => Some("video/quicktime"),
        "webm" => Some("video/webm"),
        _ => None,
    }
}

/// Declared type unless missing or generic, else the extension, else mp4.
pub fn resolve_mime_type(declared: Option<&str>, file_name: Option<&str>) -> String {
    declared
        .map(str::trim)
        .filter(|m| !m.is_empty() && *m != OCTET_STREAM)
        .map(str::to_string)
        .or_else(|| file_name.and_then(infer_mime_type).map(str::to_string))
        .unwrap_or_else(|| DEFAULT_VIDEO_MIME.to_string())
}

/// Gemini REST client.
pub struct GeminiBackend {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    max_state_polls: u32,
    poll_interval: Duration,
}

impl GeminiBackend {
    pub fn new(api_key: impl Into<String>, config: &GeminiConfig) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| BackendError::RequestFailed(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            max_state_polls: config.max_state_polls.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> BackendResult<reqwest::Response> {
        let response = request
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| BackendError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, body });
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> BackendResult<T> {
        self.send(request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| BackendError::ParseError(e.to_string()))
    }

    /// Open a resumable upload session and return its upload URL.
    async fn start_upload(&self, artifact: &SourceArtifact, mime: &str) -> BackendResult<String> {
        let display_name = artifact.file_name.as_deref().unwrap_or("upload");
        let request = self
            .client
            .post(self.url("upload/v1beta/files"))
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", artifact.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime)
            .json(&StartUploadRequest {
                file: UploadFileMeta { display_name },
            });

        let response = self.send(request).await?;
        response
            .headers()
            .get(UPLOAD_URL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| BackendError::Upload("upload session returned no upload URL".into()))
    }

    async fn finish_upload(&self, upload_url: &str, artifact: &SourceArtifact) -> BackendResult<RemoteFile> {
        let request = self
            .client
            .post(upload_url)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(artifact.bytes.to_vec());
        let uploaded: UploadResponse = self.send_json(request).await?;
        Ok(uploaded.file)
    }

    async fn get_file(&self, name: &str) -> BackendResult<RemoteFile> {
        let request = self.client.get(self.url(&format!("v1beta/{name}")));
        self.send_json(request).await
    }

    /// Poll until the file is usable. Files without a name cannot be polled
    /// and are accepted as long as they carry a URI.
    async fn wait_until_active(&self, mut file: RemoteFile) -> BackendResult<RemoteFile> {
        let Some(name) = file.name.clone() else {
            return Ok(file);
        };

        for poll in 0..self.max_state_polls {
            let state = file.state;
            match state {
                Some(FileState::Active) if file.uri.is_some() => return Ok(file),
                Some(state @ (FileState::Failed | FileState::Deleted)) => {
                    return Err(BackendError::Upload(format!("file {name} entered state {state:?}")));
                }
                _ => {}
            }
            debug!(file = %name, poll, state = ?state, "waiting for uploaded file");
            tokio::time::sleep(self.poll_interval).await;

            let fetched = self.get_file(&name).await?;
            file = RemoteFile {
                name: fetched.name.or(file.name),
                uri: fetched.uri.or(file.uri),
                mime_type: fetched.mime_type.or(file.mime_type),
                state: fetched.state,
            };
        }

        let state = file.state;
        match state {
            Some(FileState::Active) if file.uri.is_some() => Ok(file),
            _ => Err(BackendError::Upload(format!(
                "file {name} not active after {} polls (state {state:?})",
                self.max_state_polls
            ))),
        }
    }

    async fn generate_content(
        &self,
        model: &str,
        body: &GenerateContentRequest<'_>,
    ) -> BackendResult<String> {
        let request = self
            .client
            .post(self.url(&format!("v1beta/models/{model}:generateContent")))
            .json(body);
        let response: GenerateContentResponse = self.send_json(request).await?;
        match response.first_text() {
            Some(text) if !text.trim().is_empty() => Ok(text.to_string()),
            _ => Err(BackendError::EmptyResponse),
        }
    }
}

fn generation_config(params: &GenerationParams) -> Option<GenerationConfig> {
    if params.temperature.is_none() && params.max_output_tokens.is_none() {
        return None;
    }
    Some(GenerationConfig {
        temperature: params.temperature,
        max_output_tokens: params.max_output_tokens,
    })
}

#[async_trait]
impl ContentBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn upload(&self, artifact: &SourceArtifact) -> BackendResult<ArtifactRef> {
        let declared = resolve_mime_type(artifact.mime_type.as_deref(), artifact.file_name.as_deref());
        let upload_url = self.start_upload(artifact, &declared).await?;
        let uploaded = self.finish_upload(&upload_url, artifact).await?;
        let file = self.wait_until_active(uploaded).await?;

        let uri = file
            .uri
            .ok_or_else(|| BackendError::Upload("uploaded file has no URI".into()))?;
        let mime_type = resolve_mime_type(
            file.mime_type.as_deref().or(Some(declared.as_str())),
            artifact.file_name.as_deref(),
        );
        info!(uri = %uri, mime_type = %mime_type, bytes = artifact.len(), "video uploaded");
        Ok(ArtifactRef { uri, mime_type })
    }

    async fn generate(
        &self,
        artifact: &ArtifactRef,
        instruction: &str,
        params: &GenerationParams,
    ) -> BackendResult<String> {
        let body = GenerateContentRequest {
            contents: vec![Content::user(vec![
                Part::File {
                    file_data: FileData {
                        file_uri: &artifact.uri,
                        mime_type: &artifact.mime_type,
                    },
                },
                Part::Text { text: instruction },
            ])],
            generation_config: generation_config(params),
        };
        self.generate_content(&params.model, &body).await
    }

    async fn evaluate(
        &self,
        instruction: &str,
        candidates: &[PresentedCandidate<'_>],
        params: &GenerationParams,
    ) -> BackendResult<String> {
        let prompt = build_evaluator_prompt(instruction, candidates);
        let body = GenerateContentRequest {
            contents: vec![Content::user(vec![Part::Text { text: &prompt }])],
            generation_config: generation_config(params),
        };
        let reply = self.generate_content(&params.model, &body).await;
        if let Err(e) = &reply {
            warn!(model = %params.model, error = %e, "evaluator call failed");
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_infer_mime_type() {
        assert_eq!(infer_mime_type("clip.MP4"), Some("video/mp4"));
        assert_eq!(infer_mime_type("a/b/clip.mov"), Some("video/quicktime"));
        assert_eq!(infer_mime_type("clip.webm"), Some("video/webm"));
        assert_eq!(infer_mime_type("clip.avi"), None);
        assert_eq!(infer_mime_type("clip"), None);
    }

    #[test]
    fn test_resolve_mime_type_prefers_specific_declared() {
        assert_eq!(resolve_mime_type(Some("video/webm"), Some("x.mp4")), "video/webm");
        assert_eq!(resolve_mime_type(Some(OCTET_STREAM), Some("x.mov")), "video/quicktime");
        assert_eq!(resolve_mime_type(Some(" "), None), DEFAULT_VIDEO_MIME);
        assert_eq!(resolve_mime_type(None, Some("x.bin")), DEFAULT_VIDEO_MIME);
    }

    #[test]
    fn test_generation_config_omitted_when_unset() {
        assert!(generation_config(&GenerationParams::new("m")).is_none());
        let config = generation_config(&GenerationParams::new("m").with_max_output_tokens(10)).unwrap();
        assert_eq!(config.max_output_tokens, Some(10));
        assert_eq!(config.temperature, None);
    }

    #[test]
    fn test_request_wire_shape() {
        let body = GenerateContentRequest {
            contents: vec![Content::user(vec![
                Part::File {
                    file_data: FileData {
                        file_uri: "files/abc",
                        mime_type: "video/mp4",
                    },
                },
                Part::Text { text: "describe" },
            ])],
            generation_config: generation_config(
                &GenerationParams::new("m").with_temperature(0.5).with_max_output_tokens(3000),
            ),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            json!({
                "contents": [{
                    "role": "user",
                    "parts": [
                        {"fileData": {"fileUri": "files/abc", "mimeType": "video/mp4"}},
                        {"text": "describe"}
                    ]
                }],
                "generationConfig": {"temperature": 0.5, "maxOutputTokens": 3000}
            })
        );
    }

    #[test]
    fn test_first_text_skips_non_text_parts() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [
                {"content": {"parts": [{"inlineData": {}}, {"text": "hello"}, {"text": "ignored"}]}},
                {"content": {"parts": [{"text": "second candidate"}]}}
            ]
        }))
        .unwrap();
        assert_eq!(response.first_text(), Some("hello"));

        let empty: GenerateContentResponse = serde_json::from_value(json!({})).unwrap();
        assert_eq!(empty.first_text(), None);
    }

    #[test]
    fn test_file_state_parsing() {
        let file: RemoteFile = serde_json::from_value(json!({
            "name": "files/abc",
            "uri": "https://example/files/abc",
            "mimeType": "video/mp4",
            "state": "ACTIVE"
        }))
        .unwrap();
        assert_eq!(file.state, Some(FileState::Active));

        let odd: RemoteFile = serde_json::from_value(json!({"state": "SOMETHING_NEW"})).unwrap();
        assert_eq!(odd.state, Some(FileState::Unknown));
    }
}
