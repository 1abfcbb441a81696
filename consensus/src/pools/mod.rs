//! Concurrent fan-out pools.
//!
//! Both pools spawn one task per member on a [`tokio::task::JoinSet`] and
//! settle only once every member has finished. They never touch the
//! activity bus: per-member completions go out on an optional
//! [`ProgressSender`] and the orchestrator turns them into events.
//!
//! Failure policy differs on purpose:
//!
//! - **Generators** are all-or-nothing. The first member to exhaust its
//!   retries aborts the rest and fails the pool.
//! - **Evaluators** are independent opinions. A member that fails or
//!   replies with something undecodable contributes an empty ballot.

pub mod evaluators;
pub mod generators;

use tokio::sync::mpsc;

pub use evaluators::EvaluatorPool;
pub use generators::GeneratorPool;

/// Per-member completion report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolProgress {
    GeneratorComplete { index: usize, chars: usize },
    GeneratorFailed { index: usize, error: String },
    EvaluatorComplete { index: usize, ranking: Vec<usize> },
    EvaluatorFailed { index: usize, reason: String },
}

/// Channel the pools report progress on.
pub type ProgressSender = mpsc::UnboundedSender<PoolProgress>;

fn report(progress: &Option<ProgressSender>, item: PoolProgress) {
    if let Some(tx) = progress {
        // Receiver gone only means nobody is watching.
        let _ = tx.send(item);
    }
}
