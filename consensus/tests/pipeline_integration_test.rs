//! End-to-end pipeline runs against a scripted in-process backend.
//!
//! Covers the orchestrator contract: stage order on the activity bus,
//! evaluator failure absorption, generator failure abort, config
//! fast-fail, fallback output and cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use consensus::{
    ActivityBus, ActivityEvent, ActivityPhase, ArtifactRef, BackendError, BackendResult,
    ContentBackend, GenerationParams, NoConsensusReason, Orchestrator, PipelineConfig,
    PipelineError, PoolError, PresentedCandidate, RetryPolicy, RunRequest, SharedActivityBus,
    SourceArtifact, FALLBACK_DIVIDER,
};
use tokio_util::sync::CancellationToken;

// ── Scripted backend ───────────────────────────────────────────────

#[derive(Default)]
struct ScriptedBackend {
    /// Upload attempts that fail before one succeeds.
    upload_failures: usize,
    /// Every generation fails.
    generators_fail: bool,
    generate_delay: Option<Duration>,
    /// Evaluator replies, handed out in call order (cycled).
    evaluator_replies: Vec<String>,
    uploads: AtomicUsize,
    generations: AtomicUsize,
    evaluations: AtomicUsize,
}

impl ScriptedBackend {
    fn with_replies(replies: &[&str]) -> Self {
        Self {
            evaluator_replies: replies.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContentBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn upload(&self, artifact: &SourceArtifact) -> BackendResult<ArtifactRef> {
        let attempt = self.uploads.fetch_add(1, Ordering::SeqCst);
        if attempt < self.upload_failures {
            return Err(BackendError::Status {
                status: 503,
                body: "busy".into(),
            });
        }
        Ok(ArtifactRef {
            uri: format!("files/{}", artifact.len()),
            mime_type: artifact.mime_type.clone().unwrap_or_else(|| "video/mp4".into()),
        })
    }

    async fn generate(
        &self,
        artifact: &ArtifactRef,
        instruction: &str,
        _params: &GenerationParams,
    ) -> BackendResult<String> {
        let call = self.generations.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.generate_delay {
            tokio::time::sleep(delay).await;
        }
        if self.generators_fail {
            return Err(BackendError::RequestFailed("model overloaded".into()));
        }
        Ok(format!("{instruction} via {} #{call}", artifact.uri))
    }

    async fn evaluate(
        &self,
        _instruction: &str,
        _candidates: &[PresentedCandidate<'_>],
        _params: &GenerationParams,
    ) -> BackendResult<String> {
        let call = self.evaluations.fetch_add(1, Ordering::SeqCst);
        if self.evaluator_replies.is_empty() {
            return Err(BackendError::EmptyResponse);
        }
        Ok(self.evaluator_replies[call % self.evaluator_replies.len()].clone())
    }
}

fn request(n: usize, k: usize) -> RunRequest {
    let config = PipelineConfig::default()
        .with_counts(n, k)
        .with_retry(RetryPolicy::no_retry());
    RunRequest::new(SourceArtifact::new(vec![7u8; 64]), "Describe the clip")
        .with_run_id("run-1")
        .with_config(config)
}

fn setup(backend: ScriptedBackend) -> (Arc<ScriptedBackend>, SharedActivityBus, Orchestrator) {
    let backend = Arc::new(backend);
    let bus = ActivityBus::new().shared();
    let orchestrator = Orchestrator::new(backend.clone()).with_bus(bus.clone());
    (backend, bus, orchestrator)
}

fn kinds(events: &[ActivityEvent]) -> Vec<String> {
    events
        .iter()
        .map(|e| format!("{}/{}", e.phase, e.kind))
        .collect()
}

fn position(kinds: &[String], needle: &str) -> usize {
    kinds
        .iter()
        .position(|k| k == needle)
        .unwrap_or_else(|| panic!("missing event {needle} in {kinds:?}"))
}

// ── Successful runs ────────────────────────────────────────────────

#[tokio::test]
async fn test_consensus_run_emits_stages_in_order() {
    let (backend, bus, orchestrator) = setup(ScriptedBackend::with_replies(&[
        r#"{"ranking": [0, 1]}"#,
        r#"{"ranking": [0, 2]}"#,
        r#"```json
{"ranking": [0]}
```"#,
    ]));

    let decision = orchestrator
        .run(request(3, 3), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(decision.chosen_index, Some(0));
    assert_eq!(decision.text, decision.all_candidates[0].text);
    assert!(!decision.was_tie_broken);
    assert_eq!(decision.acceptable_counts, vec![3, 1, 1]);
    assert_eq!(decision.reason, None);
    assert_eq!(backend.uploads.load(Ordering::SeqCst), 1);
    assert_eq!(backend.generations.load(Ordering::SeqCst), 3);
    assert_eq!(backend.evaluations.load(Ordering::SeqCst), 3);

    let kinds = kinds(&bus.snapshot("run-1"));
    let stages = [
        "init/pipeline_start",
        "upload/upload_start",
        "upload/upload_complete",
        "generators/pool_start",
        "generators/pool_complete",
        "evaluators/pool_start",
        "evaluators/pool_complete",
        "aggregation/ballots_collected",
        "aggregation/acceptable_counts",
        "aggregation/decision",
        "result/summary",
        "result/winner",
    ];
    let positions: Vec<usize> = stages.iter().map(|s| position(&kinds, s)).collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{kinds:?}");

    let gen_done = kinds.iter().filter(|k| *k == "generators/generator_complete").count();
    let eval_done = kinds.iter().filter(|k| *k == "evaluators/evaluator_complete").count();
    assert_eq!((gen_done, eval_done), (3, 3));
    assert_eq!(kinds.last().map(String::as_str), Some("result/winner"));
}

#[tokio::test]
async fn test_malformed_evaluator_still_aggregates_two_ballots() {
    let (_, bus, orchestrator) = setup(ScriptedBackend::with_replies(&[
        r#"{"ranking": [1, 0]}"#,
        "Sorry, I cannot rank these.",
        r#"{"ranking": [1]}"#,
    ]));

    let decision = orchestrator
        .run(request(2, 3), &CancellationToken::new())
        .await
        .unwrap();

    let usable = decision
        .ballot_snapshots
        .iter()
        .filter(|b| !b.is_empty())
        .count();
    assert_eq!(decision.ballot_snapshots.len(), 3);
    assert_eq!(usable, 2);
    assert_eq!(decision.chosen_index, Some(1));

    let events = bus.snapshot("run-1");
    let failed: Vec<&ActivityEvent> = events
        .iter()
        .filter(|e| e.kind == "evaluator_failed")
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(events.iter().all(|e| e.phase != ActivityPhase::Error));
}

#[tokio::test]
async fn test_no_acceptable_returns_fallback() {
    let (_, bus, orchestrator) = setup(ScriptedBackend::with_replies(&[r#"{"ranking": []}"#]));

    let decision = orchestrator
        .run(request(3, 2), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!decision.has_consensus());
    assert_eq!(decision.reason, Some(NoConsensusReason::NothingAcceptable));
    assert_eq!(decision.text.matches(FALLBACK_DIVIDER).count(), 2);
    assert!(decision.text.starts_with("Candidate [0]\n\n"));
    assert!(decision.text.contains("Candidate [2]\n\n"));

    let last = bus.snapshot("run-1").pop().unwrap();
    assert_eq!(last.kind, "no_consensus");
    assert_eq!(
        last.data.unwrap()["reason"],
        "No acceptable candidates"
    );
}

#[tokio::test]
async fn test_below_threshold_reason() {
    let (_, _, orchestrator) = setup(ScriptedBackend::with_replies(&[
        r#"{"ranking": [0]}"#,
        r#"{"ranking": [1]}"#,
    ]));

    let decision = orchestrator
        .run(request(2, 2), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(decision.reason, Some(NoConsensusReason::BelowThreshold));
    assert_eq!(decision.acceptable_counts, vec![1, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_upload_retried_once() {
    let backend = ScriptedBackend {
        upload_failures: 1,
        ..ScriptedBackend::with_replies(&[r#"{"ranking": [0]}"#])
    };
    let (backend, _, orchestrator) = setup(backend);

    let mut req = request(1, 2);
    req.config.retry = RetryPolicy::default();
    let decision = orchestrator.run(req, &CancellationToken::new()).await.unwrap();

    assert_eq!(backend.uploads.load(Ordering::SeqCst), 2);
    assert_eq!(decision.chosen_index, Some(0));
}

#[tokio::test]
async fn test_runs_without_bus_or_run_id() {
    let backend = Arc::new(ScriptedBackend::with_replies(&[r#"{"ranking": [0]}"#]));
    let orchestrator = Orchestrator::new(backend);
    let mut req = request(1, 2);
    req.run_id = None;
    let decision = orchestrator.run(req, &CancellationToken::new()).await.unwrap();
    assert_eq!(decision.chosen_index, Some(0));
}

#[tokio::test]
async fn test_generate_once() {
    let (backend, bus, orchestrator) = setup(ScriptedBackend::default());
    let text = orchestrator
        .generate_once(request(5, 3), &CancellationToken::new())
        .await
        .unwrap();

    assert!(text.starts_with("Describe the clip via files/64"));
    assert_eq!(backend.generations.load(Ordering::SeqCst), 1);
    assert_eq!(backend.evaluations.load(Ordering::SeqCst), 0);
    let last = bus.snapshot("run-1").pop().unwrap();
    assert_eq!((last.phase, last.kind.as_str()), (ActivityPhase::Result, "single_shot"));
}

// ── Failing runs ───────────────────────────────────────────────────

#[tokio::test]
async fn test_generator_failure_aborts_run() {
    let (backend, bus, orchestrator) = setup(ScriptedBackend {
        generators_fail: true,
        ..ScriptedBackend::with_replies(&[r#"{"ranking": [0]}"#])
    });

    let err = orchestrator
        .run(request(3, 3), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Pool(PoolError::GeneratorFailed { .. })
    ));
    assert_eq!(backend.evaluations.load(Ordering::SeqCst), 0);

    let events = bus.snapshot("run-1");
    let errors: Vec<&ActivityEvent> = events
        .iter()
        .filter(|e| e.phase == ActivityPhase::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, "run_failed");
    assert!(events.iter().all(|e| e.phase != ActivityPhase::Result));
    assert_eq!(events.last().unwrap().phase, ActivityPhase::Error);
}

#[tokio::test]
async fn test_invalid_counts_rejected_before_backend() {
    for (n, k) in [(0, 3), (11, 3), (3, 0), (3, 8)] {
        let (backend, bus, orchestrator) = setup(ScriptedBackend::default());
        let err = orchestrator
            .run(request(n, k), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_client_error(), "n={n} k={k}");
        assert_eq!(backend.uploads.load(Ordering::SeqCst), 0);
        assert_eq!(backend.generations.load(Ordering::SeqCst), 0);
        let events = bus.snapshot("run-1");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].phase, ActivityPhase::Error);
    }
}

#[tokio::test]
async fn test_empty_instruction_rejected() {
    let (backend, _, orchestrator) = setup(ScriptedBackend::default());
    let mut req = request(2, 2);
    req.instruction = "   ".into();
    let err = orchestrator.run(req, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidConfig(_)));
    assert_eq!(backend.uploads.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_keeps_history() {
    let (backend, bus, orchestrator) = setup(ScriptedBackend {
        generate_delay: Some(Duration::from_secs(60)),
        ..ScriptedBackend::with_replies(&[r#"{"ranking": [0]}"#])
    });
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = orchestrator.run(request(3, 3), &cancel).await.unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
    assert_eq!(backend.evaluations.load(Ordering::SeqCst), 0);

    let kinds = kinds(&bus.snapshot("run-1"));
    assert_eq!(kinds.first().map(String::as_str), Some("init/pipeline_start"));
    assert!(kinds.contains(&"generators/pool_start".to_string()));
    assert_eq!(kinds.last().map(String::as_str), Some("error/cancelled"));
}
