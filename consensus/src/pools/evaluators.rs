//! Evaluator pool: K concurrent rankings of the full candidate set.
//!
//! Each evaluator sees the candidates in its own random order. Labels carry
//! the canonical index, so a reply refers to candidates by index no matter
//! where they were shown and no remapping is needed.

use std::sync::Arc;
use std::time::Instant;

use rand::seq::SliceRandom;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{report, PoolProgress, ProgressSender};
use crate::backend::{GenerationParams, PresentedCandidate, SharedBackend};
use crate::ballot::{decode_ballot, Ballot};
use crate::candidate::CandidateOutput;
use crate::retry::RetryPolicy;

/// Runs the evaluator fan-out.
pub struct EvaluatorPool {
    backend: SharedBackend,
    retry: RetryPolicy,
    progress: Option<ProgressSender>,
}

impl EvaluatorPool {
    pub fn new(backend: SharedBackend, retry: RetryPolicy) -> Self {
        Self {
            backend,
            retry,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Collect up to `count` ballots in evaluator order.
    ///
    /// A failed call or an undecodable reply yields an empty ballot in that
    /// evaluator's slot. Only a task that dies outright leaves no ballot.
    pub async fn run(
        &self,
        instruction: &str,
        candidates: &[CandidateOutput],
        count: usize,
        params: &GenerationParams,
    ) -> Vec<Ballot> {
        let started = Instant::now();
        let shared: Arc<Vec<CandidateOutput>> = Arc::new(candidates.to_vec());
        let instruction: Arc<str> = Arc::from(instruction);
        let mut join_set: JoinSet<(usize, Result<Ballot, String>)> = JoinSet::new();

        for index in 0..count {
            let mut order: Vec<usize> = (0..shared.len()).collect();
            order.shuffle(&mut rand::thread_rng());

            let backend = Arc::clone(&self.backend);
            let retry = self.retry.clone();
            let candidates = Arc::clone(&shared);
            let instruction = Arc::clone(&instruction);
            let params = params.clone();

            join_set.spawn(async move {
                let presented: Vec<PresentedCandidate<'_>> = order
                    .iter()
                    .map(|&slot| PresentedCandidate {
                        index: candidates[slot].index,
                        text: &candidates[slot].text,
                    })
                    .collect();
                let label = format!("evaluator {index}");
                let (backend, instruction, params, presented) =
                    (&backend, &instruction, &params, &presented);

                let reply = retry
                    .invoke(&label, move || async move {
                        backend.evaluate(instruction, presented, params).await
                    })
                    .await;

                let outcome = match reply {
                    Ok(raw) => decode_ballot(&raw, candidates.len())
                        .map_err(|e| format!("undecodable reply: {e}")),
                    Err(e) => Err(e.to_string()),
                };
                (index, outcome)
            });
        }

        let mut slots: Vec<Option<Ballot>> = vec![None; count];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok(ballot))) => {
                    debug!(index, ranking = ?ballot.ranking, "evaluator complete");
                    report(
                        &self.progress,
                        PoolProgress::EvaluatorComplete {
                            index,
                            ranking: ballot.ranking.clone(),
                        },
                    );
                    slots[index] = Some(ballot);
                }
                Ok((index, Err(reason))) => {
                    warn!(index, reason = %reason, "evaluator failed, counting as empty ballot");
                    report(
                        &self.progress,
                        PoolProgress::EvaluatorFailed {
                            index,
                            reason,
                        },
                    );
                    slots[index] = Some(Ballot::empty());
                }
                Err(e) => {
                    warn!(error = %e, "evaluator task did not finish, dropping its ballot");
                }
            }
        }

        let ballots: Vec<Ballot> = slots.into_iter().flatten().collect();
        info!(
            requested = count,
            collected = ballots.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "evaluator pool complete"
        );
        ballots
    }
}
