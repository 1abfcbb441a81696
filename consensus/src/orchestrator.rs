//! Pipeline orchestrator.
//!
//! Sequences one run end to end and is the only component that writes to
//! the activity bus:
//!
//! ```text
//! validate ─▶ upload ─▶ GeneratorPool ─▶ EvaluatorPool ─▶ ConsensusAggregator ─▶ Decision
//!    │          │            │                 │                   │                 │
//!    └──────────┴────────────┴─── ActivityBus (side channel) ──────┴─────────────────┘
//! ```
//!
//! A run without a consensus winner still succeeds: the decision carries
//! every candidate concatenated in index order plus a [`NoConsensusReason`].

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregate::{average_ranks, AggregateDecision, ConsensusAggregator, DecisionBranch};
use crate::backend::{ArtifactRef, SharedBackend, SourceArtifact};
use crate::ballot::Ballot;
use crate::candidate::{concat_fallback, CandidateOutput};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult, PoolError};
use crate::events::{ActivityEvent, ActivityPhase, SharedActivityBus};
use crate::pools::{EvaluatorPool, GeneratorPool, PoolProgress};

// ── Request / result types ────────────────────────────────────────────────────

/// Inputs for one pipeline run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Scopes activity events. `None` or empty disables them.
    pub run_id: Option<String>,
    pub artifact: SourceArtifact,
    pub instruction: String,
    pub config: PipelineConfig,
}

impl RunRequest {
    pub fn new(artifact: SourceArtifact, instruction: impl Into<String>) -> Self {
        Self {
            run_id: None,
            artifact,
            instruction: instruction.into(),
            config: PipelineConfig::default(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    fn run_id(&self) -> &str {
        self.run_id.as_deref().unwrap_or("")
    }

    fn validate(&self) -> PipelineResult<()> {
        if self.instruction.trim().is_empty() {
            return Err(PipelineError::InvalidConfig("instruction must not be empty".into()));
        }
        if self.artifact.is_empty() {
            return Err(PipelineError::InvalidConfig("source artifact is empty".into()));
        }
        Ok(())
    }
}

/// Why a run ended without a winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoConsensusReason {
    #[serde(rename = "No acceptable candidates")]
    NothingAcceptable,
    #[serde(rename = "No consensus among eligible candidates")]
    BelowThreshold,
}

impl NoConsensusReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NothingAcceptable => "No acceptable candidates",
            Self::BelowThreshold => "No consensus among eligible candidates",
        }
    }
}

impl std::fmt::Display for NoConsensusReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Winning candidate text, or the concatenated fallback.
    pub text: String,
    pub chosen_index: Option<usize>,
    pub acceptable_counts: Vec<usize>,
    /// Each evaluator's ranking, in evaluator order.
    pub ballot_snapshots: Vec<Vec<usize>>,
    pub was_tie_broken: bool,
    pub all_candidates: Vec<CandidateOutput>,
    pub average_rank_per_candidate: Vec<Option<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<NoConsensusReason>,
    pub branch: DecisionBranch,
    pub rationale: Vec<String>,
}

impl Decision {
    pub fn has_consensus(&self) -> bool {
        self.chosen_index.is_some()
    }

    fn build(
        candidates: Vec<CandidateOutput>,
        ballots: &[Ballot],
        aggregate: AggregateDecision,
    ) -> Self {
        let average_rank_per_candidate = average_ranks(candidates.len(), ballots);
        let winner_text = aggregate.winner_index.and_then(|winner| {
            candidates
                .iter()
                .find(|c| c.index == winner)
                .map(|c| c.text.clone())
        });
        let (text, reason) = match winner_text {
            Some(text) => (text, None),
            None => {
                let reason = if aggregate.has_any_acceptable {
                    NoConsensusReason::BelowThreshold
                } else {
                    NoConsensusReason::NothingAcceptable
                };
                (concat_fallback(&candidates), Some(reason))
            }
        };

        Self {
            text,
            chosen_index: aggregate.winner_index.filter(|_| reason.is_none()),
            acceptable_counts: aggregate.acceptable_counts,
            ballot_snapshots: ballots.iter().map(|b| b.ranking.clone()).collect(),
            was_tie_broken: aggregate.was_tie_broken,
            all_candidates: candidates,
            average_rank_per_candidate,
            reason,
            branch: aggregate.branch,
            rationale: aggregate.rationale,
        }
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

/// Drives upload → generators → evaluators → aggregation.
pub struct Orchestrator {
    backend: SharedBackend,
    bus: Option<SharedActivityBus>,
}

impl Orchestrator {
    pub fn new(backend: SharedBackend) -> Self {
        Self { backend, bus: None }
    }

    pub fn with_bus(mut self, bus: SharedActivityBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    /// Run the full consensus pipeline.
    ///
    /// Cancelling `cancel` abandons in-flight backend calls and returns
    /// [`PipelineError::Cancelled`]; events emitted so far stay on the bus.
    pub async fn run(
        &self,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> PipelineResult<Decision> {
        let run_id = request.run_id().to_string();
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            result = self.execute(&run_id, &request) => result,
        };

        match &result {
            Ok(decision) => info!(
                run_id = %run_id,
                chosen = ?decision.chosen_index,
                branch = %decision.branch,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "run complete"
            ),
            Err(e) => self.fail(&run_id, e),
        }
        result
    }

    /// Upload once and return a single generation, without consensus.
    pub async fn generate_once(
        &self,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> PipelineResult<String> {
        let run_id = request.run_id().to_string();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            result = self.execute_once(&run_id, &request) => result,
        };
        if let Err(e) = &result {
            self.fail(&run_id, e);
        }
        result
    }

    async fn execute(&self, run_id: &str, request: &RunRequest) -> PipelineResult<Decision> {
        request.validate()?;
        let config = &request.config;
        config.validate()?;

        self.emit(
            run_id,
            ActivityEvent::new(ActivityPhase::Init, "pipeline_start", "Pipeline started").with_data(json!({
                "generators": config.generators,
                "evaluators": config.evaluators,
                "generatorModel": config.generator_model,
                "evaluatorModel": config.evaluator_model,
            })),
        );

        let artifact = self.upload(run_id, request).await?;
        let candidates = self
            .generate_candidates(run_id, &artifact, &request.instruction, config)
            .await?;
        let ballots = self
            .collect_ballots(run_id, &request.instruction, &candidates, config)
            .await;
        Ok(self.decide(run_id, candidates, &ballots, config))
    }

    async fn execute_once(&self, run_id: &str, request: &RunRequest) -> PipelineResult<String> {
        request.validate()?;
        request.config.validate()?;
        self.emit(
            run_id,
            ActivityEvent::new(ActivityPhase::Init, "single_shot_start", "Single generation started")
                .with("model", request.config.generator_model.clone()),
        );

        let artifact = self.upload(run_id, request).await?;
        let params = request.config.generator_params();
        let backend = &self.backend;
        let instruction = request.instruction.as_str();
        let (artifact_ref, params_ref) = (&artifact, &params);
        let text = request
            .config
            .retry
            .invoke("single generation", move || async move {
                backend.generate(artifact_ref, instruction, params_ref).await
            })
            .await
            .map_err(|source| PipelineError::Pool(PoolError::GeneratorFailed { index: 0, source }))?;

        self.emit(
            run_id,
            ActivityEvent::new(ActivityPhase::Result, "single_shot", "Single generation complete")
                .with("chars", text.chars().count()),
        );
        Ok(text)
    }

    // ── Stages ────────────────────────────────────────────────────────────

    async fn upload(&self, run_id: &str, request: &RunRequest) -> PipelineResult<ArtifactRef> {
        let source = &request.artifact;
        self.emit(
            run_id,
            ActivityEvent::new(ActivityPhase::Upload, "upload_start", "Uploading source video")
                .with("bytes", source.len())
                .with("fileName", source.file_name.clone().unwrap_or_default()),
        );

        let backend = &self.backend;
        let artifact = request
            .config
            .retry
            .invoke("upload", move || async move { backend.upload(source).await })
            .await
            .map_err(PipelineError::Upload)?;

        self.emit(
            run_id,
            ActivityEvent::new(ActivityPhase::Upload, "upload_complete", "Source video ready")
                .with("uri", artifact.uri.clone())
                .with("mimeType", artifact.mime_type.clone()),
        );
        Ok(artifact)
    }

    async fn generate_candidates(
        &self,
        run_id: &str,
        artifact: &ArtifactRef,
        instruction: &str,
        config: &PipelineConfig,
    ) -> PipelineResult<Vec<CandidateOutput>> {
        let started = Instant::now();
        self.emit(
            run_id,
            ActivityEvent::new(
                ActivityPhase::Generators,
                "pool_start",
                format!("Starting {} generators", config.generators),
            )
            .with("count", config.generators)
            .with("model", config.generator_model.clone()),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let pool = GeneratorPool::new(self.backend.clone(), config.retry.clone()).with_progress(tx);
        let params = config.generator_params();
        let work = async move {
            let result = pool.run(artifact, instruction, config.generators, &params).await;
            drop(pool);
            result
        };
        let (result, ()) = tokio::join!(work, self.drain_progress(run_id, rx));
        let candidates = result?;

        self.emit(
            run_id,
            ActivityEvent::new(ActivityPhase::Generators, "pool_complete", "All generators finished")
                .with("count", candidates.len())
                .with("elapsedMs", started.elapsed().as_millis() as u64),
        );
        Ok(candidates)
    }

    async fn collect_ballots(
        &self,
        run_id: &str,
        instruction: &str,
        candidates: &[CandidateOutput],
        config: &PipelineConfig,
    ) -> Vec<Ballot> {
        let started = Instant::now();
        self.emit(
            run_id,
            ActivityEvent::new(
                ActivityPhase::Evaluators,
                "pool_start",
                format!("Starting {} evaluators", config.evaluators),
            )
            .with("count", config.evaluators)
            .with("model", config.evaluator_model.clone()),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let pool = EvaluatorPool::new(self.backend.clone(), config.retry.clone()).with_progress(tx);
        let params = config.evaluator_params();
        let work = async move {
            let ballots = pool.run(instruction, candidates, config.evaluators, &params).await;
            drop(pool);
            ballots
        };
        let (ballots, ()) = tokio::join!(work, self.drain_progress(run_id, rx));

        let empty = ballots.iter().filter(|b| b.is_empty()).count();
        if ballots.len() < config.evaluators {
            warn!(run_id, requested = config.evaluators, collected = ballots.len(), "ballots missing");
        }
        self.emit(
            run_id,
            ActivityEvent::new(ActivityPhase::Evaluators, "pool_complete", "All evaluators finished")
                .with("count", ballots.len())
                .with("empty", empty)
                .with("elapsedMs", started.elapsed().as_millis() as u64),
        );
        ballots
    }

    fn decide(
        &self,
        run_id: &str,
        candidates: Vec<CandidateOutput>,
        ballots: &[Ballot],
        config: &PipelineConfig,
    ) -> Decision {
        let snapshots: Vec<Vec<usize>> = ballots.iter().map(|b| b.ranking.clone()).collect();
        self.emit(
            run_id,
            ActivityEvent::new(
                ActivityPhase::Aggregation,
                "ballots_collected",
                format!("Collected {} ballots", ballots.len()),
            )
            .with("ballots", json!(snapshots)),
        );

        let aggregate = ConsensusAggregator::new(config.aggregation).aggregate(&candidates, ballots);
        self.emit(
            run_id,
            ActivityEvent::new(ActivityPhase::Aggregation, "acceptable_counts", "Acceptability tallied")
                .with("acceptableCounts", json!(aggregate.acceptable_counts)),
        );
        self.emit(
            run_id,
            ActivityEvent::new(
                ActivityPhase::Aggregation,
                "decision",
                format!("Aggregation finished: {}", aggregate.branch),
            )
            .with_data(json!({
                "branch": aggregate.branch,
                "winnerIndex": aggregate.winner_index,
                "wasTieBroken": aggregate.was_tie_broken,
                "rationale": aggregate.rationale,
            })),
        );

        let decision = Decision::build(candidates, ballots, aggregate);
        self.emit(run_id, summary_event(&decision));
        let closing = match (decision.chosen_index, decision.reason) {
            (Some(index), _) => ActivityEvent::new(
                ActivityPhase::Result,
                "winner",
                format!("{} selected", CandidateOutput::label(index)),
            )
            .with("chosenIndex", index)
            .with("wasTieBroken", decision.was_tie_broken),
            (None, reason) => ActivityEvent::new(
                ActivityPhase::Result,
                "no_consensus",
                "No consensus, returning all candidates",
            )
            .with("reason", reason.map(|r| r.as_str()).unwrap_or_default()),
        };
        self.emit(run_id, closing);
        decision
    }

    // ── Bus plumbing ──────────────────────────────────────────────────────

    fn emit(&self, run_id: &str, event: ActivityEvent) {
        if let Some(bus) = &self.bus {
            bus.append(run_id, event);
        }
    }

    fn fail(&self, run_id: &str, err: &PipelineError) {
        error!(run_id, kind = err.kind(), error = %err, "run failed");
        let kind = match err {
            PipelineError::Cancelled => "cancelled",
            _ => "run_failed",
        };
        self.emit(
            run_id,
            ActivityEvent::new(ActivityPhase::Error, kind, err.to_string()).with("reason", err.kind()),
        );
    }

    async fn drain_progress(&self, run_id: &str, mut rx: mpsc::UnboundedReceiver<PoolProgress>) {
        while let Some(progress) = rx.recv().await {
            self.emit(run_id, progress_event(progress));
        }
    }
}

fn progress_event(progress: PoolProgress) -> ActivityEvent {
    match progress {
        PoolProgress::GeneratorComplete { index, chars } => ActivityEvent::new(
            ActivityPhase::Generators,
            "generator_complete",
            format!("Generator {index} finished ({chars} chars)"),
        )
        .with("index", index)
        .with("chars", chars),
        PoolProgress::GeneratorFailed { index, error } => ActivityEvent::new(
            ActivityPhase::Generators,
            "generator_failed",
            format!("Generator {index} failed"),
        )
        .with("index", index)
        .with("error", error),
        PoolProgress::EvaluatorComplete { index, ranking } => ActivityEvent::new(
            ActivityPhase::Evaluators,
            "evaluator_complete",
            format!("Evaluator {index} ranked {ranking:?}"),
        )
        .with("index", index)
        .with("ranking", json!(ranking)),
        PoolProgress::EvaluatorFailed { index, reason } => ActivityEvent::new(
            ActivityPhase::Evaluators,
            "evaluator_failed",
            format!("Evaluator {index} failed, counted as empty ballot"),
        )
        .with("index", index)
        .with("reason", reason),
    }
}

fn summary_event(decision: &Decision) -> ActivityEvent {
    let winner = decision
        .chosen_index
        .map(CandidateOutput::label)
        .unwrap_or_else(|| "none".to_string());
    let deciders: Vec<String> = decision
        .ballot_snapshots
        .iter()
        .enumerate()
        .map(|(i, ranking)| {
            if ranking.is_empty() {
                format!("Evaluator {i}: nothing acceptable")
            } else {
                let order: Vec<String> = ranking.iter().map(|idx| format!("[{idx}]")).collect();
                format!("Evaluator {i}: {}", order.join(" > "))
            }
        })
        .collect();
    let averages = decision
        .average_rank_per_candidate
        .iter()
        .enumerate()
        .map(|(i, avg)| match avg {
            Some(avg) => format!("[{i}]={avg:.2}"),
            None => format!("[{i}]=n/a"),
        })
        .collect::<Vec<_>>()
        .join(", ");

    ActivityEvent::new(ActivityPhase::Result, "summary", format!("Winner: {winner}")).with_data(json!({
        "winner": winner,
        "deciders": deciders,
        "averages": averages,
    }))
}
