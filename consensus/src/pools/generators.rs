//! Generator pool: N concurrent generations against one uploaded artifact.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{report, PoolProgress, ProgressSender};
use crate::backend::{ArtifactRef, BackendError, BackendResult, GenerationParams, SharedBackend};
use crate::candidate::CandidateOutput;
use crate::error::{PoolError, PoolResult};
use crate::retry::RetryPolicy;

/// Runs the generator fan-out.
pub struct GeneratorPool {
    backend: SharedBackend,
    retry: RetryPolicy,
    progress: Option<ProgressSender>,
}

impl GeneratorPool {
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

    /// Generate `count` candidates. Output is sorted by index and covers
    /// `0..count` exactly, or the pool fails.
    pub async fn run(
        &self,
        artifact: &ArtifactRef,
        instruction: &str,
        count: usize,
        params: &GenerationParams,
    ) -> PoolResult<Vec<CandidateOutput>> {
        let started = Instant::now();
        let instruction: Arc<str> = Arc::from(instruction);
        let mut join_set: JoinSet<(usize, BackendResult<String>)> = JoinSet::new();

        for index in 0..count {
            let backend = Arc::clone(&self.backend);
            let retry = self.retry.clone();
            let artifact = artifact.clone();
            let instruction = Arc::clone(&instruction);
            let params = params.clone();

            join_set.spawn(async move {
                let label = format!("generator {index}");
                let (backend, artifact, instruction, params) =
                    (&backend, &artifact, &instruction, &params);
                let result = retry
                    .invoke(&label, move || async move {
                        let text = backend.generate(artifact, instruction, params).await?;
                        if text.trim().is_empty() {
                            return Err(BackendError::EmptyResponse);
                        }
                        Ok(text)
                    })
                    .await;
                (index, result)
            });
        }

        let mut outputs = Vec::with_capacity(count);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok(text))) => {
                    debug!(index, chars = text.chars().count(), "generator complete");
                    report(
                        &self.progress,
                        PoolProgress::GeneratorComplete {
                            index,
                            chars: text.chars().count(),
                        },
                    );
                    outputs.push(CandidateOutput::new(index, text));
                }
                Ok((index, Err(source))) => {
                    warn!(index, error = %source, "generator failed, aborting pool");
                    join_set.abort_all();
                    report(
                        &self.progress,
                        PoolProgress::GeneratorFailed {
                            index,
                            error: source.to_string(),
                        },
                    );
                    return Err(PoolError::GeneratorFailed { index, source });
                }
                Err(e) => {
                    warn!(error = %e, "generator task did not finish, aborting pool");
                    join_set.abort_all();
                    return Err(PoolError::TaskAborted(e.to_string()));
                }
            }
        }

        outputs.sort_by_key(|c| c.index);
        info!(
            count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generator pool complete"
        );
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ContentBackend, PresentedCandidate, SourceArtifact};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Replies "<instruction>-<call>" with a delay that makes completion order
    /// differ from index order; call numbers listed in `fail_calls` error.
    struct StaggeredBackend {
        calls: AtomicUsize,
        fail_calls: Vec<usize>,
    }

    impl StaggeredBackend {
        fn new(fail_calls: Vec<usize>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_calls,
            }
        }
    }

    #[async_trait]
    impl ContentBackend for StaggeredBackend {
        fn name(&self) -> &str {
            "staggered"
        }

        async fn upload(&self, _artifact: &SourceArtifact) -> BackendResult<ArtifactRef> {
            unreachable!("pool does not upload")
        }

        async fn generate(
            &self,
            _artifact: &ArtifactRef,
            instruction: &str,
            _params: &GenerationParams,
        ) -> BackendResult<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50 - (call as u64 % 5) * 10)).await;
            if self.fail_calls.contains(&call) {
                return Err(BackendError::RequestFailed(format!("call {call}")));
            }
            Ok(format!("{instruction}-{call}"))
        }

        async fn evaluate(
            &self,
            _instruction: &str,
            _candidates: &[PresentedCandidate<'_>],
            _params: &GenerationParams,
        ) -> BackendResult<String> {
            unreachable!("pool does not evaluate")
        }
    }

    fn artifact() -> ArtifactRef {
        ArtifactRef {
            uri: "files/abc".into(),
            mime_type: "video/mp4".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_indices_contiguous_regardless_of_completion_order() {
        for n in 1..=10 {
            let backend: SharedBackend = Arc::new(StaggeredBackend::new(vec![]));
            let pool = GeneratorPool::new(backend, RetryPolicy::no_retry());
            let out = pool
                .run(&artifact(), "ask", n, &GenerationParams::new("m"))
                .await
                .unwrap();
            let indices: Vec<usize> = out.iter().map(|c| c.index).collect();
            assert_eq!(indices, (0..n).collect::<Vec<_>>());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_absorbs_single_failure() {
        let backend: SharedBackend = Arc::new(StaggeredBackend::new(vec![1]));
        let pool = GeneratorPool::new(backend, RetryPolicy::default());
        let out = pool
            .run(&artifact(), "ask", 3, &GenerationParams::new("m"))
            .await
            .unwrap();
        assert_eq!(out.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_fails_pool_and_reports() {
        let backend: SharedBackend = Arc::new(StaggeredBackend::new(vec![2]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = GeneratorPool::new(backend, RetryPolicy::no_retry()).with_progress(tx);
        let err = pool
            .run(&artifact(), "ask", 4, &GenerationParams::new("m"))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::GeneratorFailed { .. }));

        let mut saw_failure = false;
        while let Ok(item) = rx.try_recv() {
            if matches!(item, PoolProgress::GeneratorFailed { .. }) {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_per_member() {
        let backend: SharedBackend = Arc::new(StaggeredBackend::new(vec![]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = GeneratorPool::new(backend, RetryPolicy::no_retry()).with_progress(tx);
        pool.run(&artifact(), "ask", 5, &GenerationParams::new("m"))
            .await
            .unwrap();
        drop(pool);

        let mut completed = Vec::new();
        while let Some(item) = rx.recv().await {
            if let PoolProgress::GeneratorComplete { index, chars } = item {
                assert!(chars > 0);
                completed.push(index);
            }
        }
        completed.sort_unstable();
        assert_eq!(completed, vec![0, 1, 2, 3, 4]);
    }
}
