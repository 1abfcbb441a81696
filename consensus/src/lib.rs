//! Consensus Pipeline Library
//!
//! Turns one source video into N generated candidates, has K evaluators rank
//! them, and picks a winner by instant-runoff vote.
//!
//! # Features
//!
//! ## Pipeline
//! - `GeneratorPool`: N concurrent generations, all-or-nothing
//! - `EvaluatorPool`: K concurrent rankings over a shuffled candidate order,
//!   failures downgraded to empty ballots
//! - `ConsensusAggregator`: pure instant-runoff with an acceptability threshold
//! - `Orchestrator`: upload → generate → evaluate → aggregate, with cancellation
//!
//! ## Plumbing
//! - `RetryPolicy`: the single retry/backoff wrapper for every backend call
//! - `ContentBackend`: the provider seam (upload, generate, evaluate)
//! - `ActivityBus`: per-run in-memory progress log with replay and live feed
//!
//! # Usage
//!
//! ```ignore
//! let bus = ActivityBus::new().shared();
//! let orchestrator = Orchestrator::new(backend).with_bus(bus.clone());
//! let request = RunRequest::new(SourceArtifact::new(bytes), "Describe the scene")
//!     .with_run_id("run-42");
//! let decision = orchestrator.run(request, &CancellationToken::new()).await?;
//! ```

pub mod aggregate;
pub mod backend;
pub mod ballot;
pub mod candidate;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod pools;
pub mod retry;

// Re-export commonly used types
pub use aggregate::{
    acceptable_counts, aggregate, average_ranks, AggregateDecision, AggregationPolicy,
    ConsensusAggregator, DecisionBranch,
};
pub use backend::{
    ArtifactRef, BackendError, BackendResult, ContentBackend, GenerationParams,
    PresentedCandidate, SharedBackend, SourceArtifact,
};
pub use ballot::{decode_ballot, Ballot, BallotError, CandidateDiagnostics};
pub use candidate::{concat_fallback, CandidateOutput, FALLBACK_DIVIDER};
pub use config::{PipelineConfig, EVALUATOR_BOUNDS, GENERATOR_BOUNDS};
pub use error::{PipelineError, PipelineResult, PoolError, PoolResult};
pub use events::{
    ActivityBus, ActivityBusConfig, ActivityEvent, ActivityPhase, SharedActivityBus, Subscription,
};
pub use orchestrator::{Decision, NoConsensusReason, Orchestrator, RunRequest};
pub use pools::{EvaluatorPool, GeneratorPool, PoolProgress};
pub use retry::RetryPolicy;
