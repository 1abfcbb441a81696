//! Instant-runoff consensus over evaluator ballots.
//!
//! Pure and synchronous: the same candidates and ballots always produce the
//! same decision. Any randomness lives upstream in ballot generation.
//!
//! # Algorithm
//!
//! 1. `acceptable_counts[i]` = number of ballots ranking `i` anywhere.
//! 2. All counts zero → no acceptable candidate.
//! 3. Eligible set = candidates with count ≥ threshold (default 2). Empty →
//!    acceptable but below threshold.
//! 4. Instant-runoff restricted to the eligible set: tally first preferences
//!    among ballots that still rank a remaining candidate; a strict majority
//!    wins, otherwise the lowest tally is eliminated (lowest index on ties).
//! 5. When the final two remaining candidates tie, the lower index wins and
//!    the decision is marked tie-broken.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ballot::Ballot;
use crate::candidate::CandidateOutput;

/// Ballots that must rank a candidate before it may win.
pub const DEFAULT_MIN_ACCEPTABLE: usize = 2;

/// Which branch of the algorithm produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionBranch {
    /// No ballot ranked any candidate.
    NoAcceptable,
    /// Some candidates were ranked, none by enough ballots.
    BelowThreshold,
    /// Exactly one candidate cleared the threshold.
    SoleEligible,
    /// Strict majority of first preferences in the first round.
    Majority,
    /// Strict majority reached after one or more eliminations.
    Elimination,
    /// Final two candidates tied; lower index selected.
    TieBreak,
}

impl DecisionBranch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoAcceptable => "no_acceptable",
            Self::BelowThreshold => "below_threshold",
            Self::SoleEligible => "sole_eligible",
            Self::Majority => "majority",
            Self::Elimination => "elimination",
            Self::TieBreak => "tie_break",
        }
    }
}

impl fmt::Display for DecisionBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateDecision {
    pub has_any_acceptable: bool,
    /// Per candidate, the number of ballots that ranked it.
    pub acceptable_counts: Vec<usize>,
    /// Always a member of the eligible set when present.
    pub winner_index: Option<usize>,
    pub was_tie_broken: bool,
    pub branch: DecisionBranch,
    /// Branch code first, then round-by-round detail.
    pub rationale: Vec<String>,
}

impl AggregateDecision {
    fn without_winner(
        acceptable_counts: Vec<usize>,
        branch: DecisionBranch,
        detail: String,
    ) -> Self {
        Self {
            has_any_acceptable: branch != DecisionBranch::NoAcceptable,
            acceptable_counts,
            winner_index: None,
            was_tie_broken: false,
            branch,
            rationale: vec![branch.to_string(), detail],
        }
    }

    pub fn has_winner(&self) -> bool {
        self.winner_index.is_some()
    }
}

/// Tunable aggregation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationPolicy {
    /// Minimum acceptable-count for eligibility (values below 1 act as 1).
    pub min_acceptable: usize,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self {
            min_acceptable: DEFAULT_MIN_ACCEPTABLE,
        }
    }
}

/// Instant-runoff aggregator.
#[derive(Debug, Clone, Default)]
pub struct ConsensusAggregator {
    policy: AggregationPolicy,
}

impl ConsensusAggregator {
    pub fn new(policy: AggregationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &AggregationPolicy {
        &self.policy
    }

    /// Decide a winner among `candidates` from `ballots`.
    pub fn aggregate(&self, candidates: &[CandidateOutput], ballots: &[Ballot]) -> AggregateDecision {
        self.aggregate_indices(candidates.len(), ballots)
    }

    /// Same as [`aggregate`](Self::aggregate) when only the candidate count is known.
    pub fn aggregate_indices(&self, candidate_count: usize, ballots: &[Ballot]) -> AggregateDecision {
        let counts = acceptable_counts(candidate_count, ballots);

        if counts.iter().all(|&c| c == 0) {
            return AggregateDecision::without_winner(
                counts,
                DecisionBranch::NoAcceptable,
                format!("no ballot ranked any of {candidate_count} candidates"),
            );
        }

        let threshold = self.policy.min_acceptable.max(1);
        let eligible: BTreeSet<usize> = counts
            .iter()
            .enumerate()
            .filter(|(_, &c)| c >= threshold)
            .map(|(i, _)| i)
            .collect();

        if eligible.is_empty() {
            return AggregateDecision::without_winner(
                counts,
                DecisionBranch::BelowThreshold,
                format!("no candidate ranked by at least {threshold} ballots"),
            );
        }

        let mut rationale = vec![format!("eligible: {:?}", eligible)];

        if eligible.len() == 1 {
            let winner = *eligible.iter().next().unwrap_or(&0);
            rationale.insert(0, DecisionBranch::SoleEligible.to_string());
            return AggregateDecision {
                has_any_acceptable: true,
                acceptable_counts: counts,
                winner_index: Some(winner),
                was_tie_broken: false,
                branch: DecisionBranch::SoleEligible,
                rationale,
            };
        }

        let restricted: Vec<Vec<usize>> = ballots
            .iter()
            .map(|b| {
                b.ranking
                    .iter()
                    .copied()
                    .filter(|i| eligible.contains(i))
                    .collect()
            })
            .collect();

        let (winner, branch) = run_instant_runoff(eligible, &restricted, &mut rationale);
        rationale.insert(0, branch.to_string());
        debug!(winner, branch = %branch, "aggregation decided");

        AggregateDecision {
            has_any_acceptable: true,
            acceptable_counts: counts,
            winner_index: Some(winner),
            was_tie_broken: branch == DecisionBranch::TieBreak,
            branch,
            rationale,
        }
    }
}

/// Aggregate with the default policy.
pub fn aggregate(candidates: &[CandidateOutput], ballots: &[Ballot]) -> AggregateDecision {
    ConsensusAggregator::default().aggregate(candidates, ballots)
}

/// Count, per candidate, the ballots whose ranking contains it.
pub fn acceptable_counts(candidate_count: usize, ballots: &[Ballot]) -> Vec<usize> {
    (0..candidate_count)
        .map(|i| ballots.iter().filter(|b| b.contains(i)).count())
        .collect()
}

/// Mean 1-based position of each candidate over the ballots that ranked it.
pub fn average_ranks(candidate_count: usize, ballots: &[Ballot]) -> Vec<Option<f64>> {
    (0..candidate_count)
        .map(|i| {
            let positions: Vec<usize> = ballots.iter().filter_map(|b| b.position_of(i)).collect();
            if positions.is_empty() {
                None
            } else {
                Some(positions.iter().sum::<usize>() as f64 / positions.len() as f64)
            }
        })
        .collect()
}

/// Runoff over a remaining set of at least two candidates.
fn run_instant_runoff(
    mut remaining: BTreeSet<usize>,
    ballots: &[Vec<usize>],
    rationale: &mut Vec<String>,
) -> (usize, DecisionBranch) {
    let mut round = 1usize;
    loop {
        let mut tally: BTreeMap<usize, usize> = remaining.iter().map(|&i| (i, 0)).collect();
        for ballot in ballots {
            if let Some(first) = ballot.iter().find(|i| remaining.contains(i)) {
                if let Some(votes) = tally.get_mut(first) {
                    *votes += 1;
                }
            }
        }
        let total: usize = tally.values().sum();
        rationale.push(format!(
            "round {round}: {} of {total} first preferences",
            tally
                .iter()
                .map(|(i, v)| format!("{i}={v}"))
                .collect::<Vec<_>>()
                .join(", ")
        ));

        if let Some((&leader, _)) = tally.iter().find(|(_, &v)| v * 2 > total) {
            let branch = if round == 1 {
                DecisionBranch::Majority
            } else {
                DecisionBranch::Elimination
            };
            return (leader, branch);
        }

        // Two left without a majority means they split the vote evenly.
        if remaining.len() <= 2 {
            let lowest = *remaining.iter().next().unwrap_or(&0);
            rationale.push(format!("round {round}: tie, lowest index {lowest} selected"));
            return (lowest, DecisionBranch::TieBreak);
        }

        let min_votes = tally.values().copied().min().unwrap_or(0);
        let eliminated = tally
            .iter()
            .find(|(_, &v)| v == min_votes)
            .map(|(&i, _)| i)
            .unwrap_or(0);
        remaining.remove(&eliminated);
        rationale.push(format!(
            "round {round}: eliminated {eliminated} with {min_votes} first preferences"
        ));
        round += 1;
    }
}
