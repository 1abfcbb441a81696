//! IRV property tests: deterministic pseudo-random ballot sets checked
//! against invariants of the aggregator.
//!
//! Tests verify:
//! - acceptable counts match an independent recount
//! - any winner clears the acceptability threshold
//! - decisions are reproducible and independent of ballot order
//! - all-empty ballots never produce a winner
//! - a lone eligible candidate wins without a tie-break

use consensus::{
    acceptable_counts, AggregationPolicy, Ballot, ConsensusAggregator, DecisionBranch,
};

/// Minimal LCG so the generated inputs are stable across runs.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

/// Ballot set over `n` candidates from `k` evaluators.
fn random_ballots(rng: &mut Lcg, n: usize, k: usize) -> Vec<Ballot> {
    (0..k)
        .map(|_| {
            let len = rng.below(n + 1);
            let mut pool: Vec<usize> = (0..n).collect();
            let mut ranking = Vec::with_capacity(len);
            for _ in 0..len {
                let pick = rng.below(pool.len());
                ranking.push(pool.remove(pick));
            }
            Ballot::new(ranking)
        })
        .collect()
}

fn cases() -> impl Iterator<Item = (usize, Vec<Ballot>)> {
    let mut rng = Lcg(0x5eed);
    (0..400).map(move |_| {
        let n = 1 + rng.below(10);
        let k = 1 + rng.below(7);
        let ballots = random_ballots(&mut rng, n, k);
        (n, ballots)
    })
}

// ── Property: counts are a pure recount ────────────────────────────

#[test]
fn prop_acceptable_counts_match_recount() {
    let agg = ConsensusAggregator::default();
    for (n, ballots) in cases() {
        let decision = agg.aggregate_indices(n, &ballots);
        assert_eq!(decision.acceptable_counts.len(), n);
        for i in 0..n {
            let recount = ballots.iter().filter(|b| b.ranking.contains(&i)).count();
            assert_eq!(decision.acceptable_counts[i], recount);
        }
        assert_eq!(decision.acceptable_counts, acceptable_counts(n, &ballots));
    }
}

// ── Property: winners are eligible ─────────────────────────────────

#[test]
fn prop_winner_is_eligible() {
    for threshold in [1, 2, 3] {
        let agg = ConsensusAggregator::new(AggregationPolicy {
            min_acceptable: threshold,
        });
        for (n, ballots) in cases() {
            let decision = agg.aggregate_indices(n, &ballots);
            if let Some(winner) = decision.winner_index {
                assert!(winner < n);
                assert!(decision.acceptable_counts[winner] >= threshold);
            }
        }
    }
}

// ── Property: determinism and ballot-order independence ────────────

#[test]
fn prop_decision_reproducible_and_order_independent() {
    let agg = ConsensusAggregator::default();
    for (n, ballots) in cases() {
        let first = agg.aggregate_indices(n, &ballots);
        let again = agg.aggregate_indices(n, &ballots);
        assert_eq!(first, again);

        let mut reversed = ballots.clone();
        reversed.reverse();
        let flipped = agg.aggregate_indices(n, &reversed);
        assert_eq!(first.winner_index, flipped.winner_index);
        assert_eq!(first.was_tie_broken, flipped.was_tie_broken);
        assert_eq!(first.branch, flipped.branch);
    }
}

// ── Property: branch flags are consistent ──────────────────────────

#[test]
fn prop_branch_consistent_with_fields() {
    let agg = ConsensusAggregator::default();
    for (n, ballots) in cases() {
        let d = agg.aggregate_indices(n, &ballots);
        assert_eq!(d.rationale.first().map(String::as_str), Some(d.branch.as_str()));
        match d.branch {
            DecisionBranch::NoAcceptable => {
                assert!(!d.has_any_acceptable);
                assert!(d.winner_index.is_none());
                assert!(ballots.iter().all(Ballot::is_empty));
            }
            DecisionBranch::BelowThreshold => {
                assert!(d.has_any_acceptable);
                assert!(d.winner_index.is_none());
                assert!(d.acceptable_counts.iter().all(|&c| c < 2));
            }
            DecisionBranch::TieBreak => {
                assert!(d.was_tie_broken);
                assert!(d.winner_index.is_some());
            }
            DecisionBranch::SoleEligible
            | DecisionBranch::Majority
            | DecisionBranch::Elimination => {
                assert!(!d.was_tie_broken);
                assert!(d.winner_index.is_some());
            }
        }
    }
}

// ── Property: empty and lone-eligible edges ────────────────────────

#[test]
fn prop_all_empty_never_wins() {
    let agg = ConsensusAggregator::default();
    for n in 1..=10 {
        for k in 0..=7 {
            let ballots = vec![Ballot::empty(); k];
            let d = agg.aggregate_indices(n, &ballots);
            assert!(!d.has_any_acceptable);
            assert_eq!(d.winner_index, None);
        }
    }
}

#[test]
fn prop_lone_eligible_wins_cleanly() {
    let agg = ConsensusAggregator::default();
    for n in 2..=10 {
        for target in 0..n {
            // `target` on two ballots, every other candidate on at most one.
            let other = (target + 1) % n;
            let ballots = vec![
                Ballot::new([other, target]),
                Ballot::new([target]),
                Ballot::empty(),
            ];
            let d = agg.aggregate_indices(n, &ballots);
            assert_eq!(d.winner_index, Some(target));
            assert!(!d.was_tie_broken);
            assert_eq!(d.branch, DecisionBranch::SoleEligible);
        }
    }
}

#[test]
fn prop_final_pair_tie_goes_to_lower_index() {
    let agg = ConsensusAggregator::default();
    for n in 2..=10 {
        for a in 0..n {
            for b in (a + 1)..n {
                let ballots = vec![
                    Ballot::new([b, a]),
                    Ballot::new([a, b]),
                    Ballot::new([b, a]),
                    Ballot::new([a, b]),
                ];
                let d = agg.aggregate_indices(n, &ballots);
                assert_eq!(d.winner_index, Some(a));
                assert!(d.was_tie_broken);
            }
        }
    }
}
