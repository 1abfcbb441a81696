//! Generator output records.

use serde::{Deserialize, Serialize};

/// Divider placed between candidates in the no-consensus fallback text.
pub const FALLBACK_DIVIDER: &str = "\n\n==============================\n\n";

/// One generator's complete output, tagged with its fan-out index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateOutput {
    pub index: usize,
    pub text: String,
}

impl CandidateOutput {
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
        }
    }

    /// Label used in human-readable summaries.
    pub fn label(index: usize) -> String {
        format!("Candidate [{index}]")
    }
}

/// Concatenate every candidate in index order, separated by
/// [`FALLBACK_DIVIDER`], so a caller without a winner still gets usable text.
pub fn concat_fallback(candidates: &[CandidateOutput]) -> String {
    let mut ordered: Vec<&CandidateOutput> = candidates.iter().collect();
    ordered.sort_by_key(|c| c.index);
    ordered
        .iter()
        .map(|c| format!("{}\n\n{}", CandidateOutput::label(c.index), c.text))
        .collect::<Vec<_>>()
        .join(FALLBACK_DIVIDER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_fallback_orders_by_index() {
        let candidates = vec![
            CandidateOutput::new(2, "third"),
            CandidateOutput::new(0, "first"),
            CandidateOutput::new(1, "second"),
        ];
        let text = concat_fallback(&candidates);
        assert_eq!(
            text,
            "Candidate [0]\n\nfirst\n\n==============================\n\n\
             Candidate [1]\n\nsecond\n\n==============================\n\n\
             Candidate [2]\n\nthird"
        );
    }

    #[test]
    fn test_concat_fallback_single() {
        let text = concat_fallback(&[CandidateOutput::new(0, "only")]);
        assert_eq!(text, "Candidate [0]\n\nonly");
    }
}
