//! Pipeline limits and defaults.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::aggregate::AggregationPolicy;
use crate::backend::GenerationParams;
use crate::error::{PipelineError, PipelineResult};
use crate::retry::RetryPolicy;

/// Allowed generator fan-out.
pub const GENERATOR_BOUNDS: RangeInclusive<usize> = 1..=10;
/// Allowed evaluator fan-out.
pub const EVALUATOR_BOUNDS: RangeInclusive<usize> = 1..=7;

pub const DEFAULT_GENERATORS: usize = 5;
pub const DEFAULT_EVALUATORS: usize = 3;
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_TEMPERATURE: f32 = 0.45;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 3000;

/// Everything a run needs besides its inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Generator count N.
    pub generators: usize,
    /// Evaluator count K.
    pub evaluators: usize,
    pub generator_model: String,
    pub evaluator_model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Applied to the upload and to every generator and evaluator call.
    pub retry: RetryPolicy,
    pub aggregation: AggregationPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            generators: DEFAULT_GENERATORS,
            evaluators: DEFAULT_EVALUATORS,
            generator_model: DEFAULT_MODEL.to_string(),
            evaluator_model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            retry: RetryPolicy::default(),
            aggregation: AggregationPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn with_counts(mut self, generators: usize, evaluators: usize) -> Self {
        self.generators = generators;
        self.evaluators = evaluators;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reject out-of-range counts and unusable generation settings.
    pub fn validate(&self) -> PipelineResult<()> {
        if !GENERATOR_BOUNDS.contains(&self.generators) {
            return Err(PipelineError::InvalidConfig(format!(
                "generators must be in {}..={}, got {}",
                GENERATOR_BOUNDS.start(),
                GENERATOR_BOUNDS.end(),
                self.generators
            )));
        }
        if !EVALUATOR_BOUNDS.contains(&self.evaluators) {
            return Err(PipelineError::InvalidConfig(format!(
                "evaluators must be in {}..={}, got {}",
                EVALUATOR_BOUNDS.start(),
                EVALUATOR_BOUNDS.end(),
                self.evaluators
            )));
        }
        if self.generator_model.trim().is_empty() || self.evaluator_model.trim().is_empty() {
            return Err(PipelineError::InvalidConfig("model name must not be empty".into()));
        }
        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            return Err(PipelineError::InvalidConfig(format!(
                "temperature must be in 0.0..=2.0, got {}",
                self.temperature
            )));
        }
        if self.max_output_tokens == 0 {
            return Err(PipelineError::InvalidConfig("max_output_tokens must be positive".into()));
        }
        Ok(())
    }

    pub fn generator_params(&self) -> GenerationParams {
        GenerationParams::new(&self.generator_model)
            .with_temperature(self.temperature)
            .with_max_output_tokens(self.max_output_tokens)
    }

    /// Evaluators run with the backend's own sampling defaults.
    pub fn evaluator_params(&self) -> GenerationParams {
        GenerationParams::new(&self.evaluator_model)
    }
}
