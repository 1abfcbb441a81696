//! Content backend seam.
//!
//! The pipeline never talks to a model provider directly. Everything it
//! needs from the outside world goes through [`ContentBackend`]: one upload
//! per run, free-form generation against the uploaded artifact, and a
//! ranking reply for a presented candidate set. Concrete adapters normalize
//! whatever their provider returns into plain text before handing it back,
//! so nothing downstream branches on provider-specific response shapes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by a content backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Response parse error: {0}")]
    ParseError(String),

    #[error("Backend returned no text")]
    EmptyResponse,

    #[error("Uploaded artifact unusable: {0}")]
    Upload(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Shared reference to a backend implementation
pub type SharedBackend = Arc<dyn ContentBackend>;

/// Raw input artifact handed to the pipeline (a recorded video).
#[derive(Clone)]
pub struct SourceArtifact {
    /// Original file name, when the caller knows it.
    pub file_name: Option<String>,
    /// MIME type declared by the caller, if any.
    pub mime_type: Option<String>,
    pub bytes: Arc<[u8]>,
}

impl SourceArtifact {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            file_name: None,
            mime_type: None,
            bytes: bytes.into(),
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for SourceArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceArtifact")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Reference to an artifact already uploaded to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    pub uri: String,
    pub mime_type: String,
}

/// Per-call generation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationParams {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

impl GenerationParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_output_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }
}

/// One candidate as shown to an evaluator. The index is the canonical
/// fan-out index, regardless of where the candidate sits in the slice.
#[derive(Debug, Clone, Copy)]
pub struct PresentedCandidate<'a> {
    pub index: usize,
    pub text: &'a str,
}

/// Capabilities the pipeline consumes from a model provider.
#[async_trait]
pub trait ContentBackend: Send + Sync {
    /// Short provider label for logs.
    fn name(&self) -> &str;

    /// Upload the source artifact once; the returned reference is shared by
    /// every generation call of the run.
    async fn upload(&self, artifact: &SourceArtifact) -> BackendResult<ArtifactRef>;

    /// Produce free-form text for `instruction` grounded on the artifact.
    async fn generate(
        &self,
        artifact: &ArtifactRef,
        instruction: &str,
        params: &GenerationParams,
    ) -> BackendResult<String>;

    /// Ask the backend to rank the presented candidates. Returns the raw
    /// ranking reply text; decoding into a ballot happens in the pipeline.
    async fn evaluate(
        &self,
        instruction: &str,
        candidates: &[PresentedCandidate<'_>],
        params: &GenerationParams,
    ) -> BackendResult<String>;
}
