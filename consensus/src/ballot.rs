//! Evaluator ballots and the strict decode step for ranking replies.
//!
//! A ballot lists only the candidates its evaluator judged acceptable,
//! best first. Omission is a "not acceptable" vote. Decoding either yields a
//! sanitized [`Ballot`] or a typed [`BallotError`]; raw JSON never travels
//! past this module.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error type for ballot decoding
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BallotError {
    #[error("Reply contains no JSON object")]
    NoJson,

    #[error("Reply is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Reply has no `ranking` array")]
    MissingRanking,
}

/// Result type for ballot decoding
pub type BallotResult<T> = Result<T, BallotError>;

/// Per-candidate notes an evaluator may attach to its ballot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateDiagnostics {
    pub index: usize,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// One evaluator's ranking of acceptable candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    /// Candidate indices, best to worst. Strict: no duplicates, all in range.
    pub ranking: Vec<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<CandidateDiagnostics>,
}

impl Ballot {
    /// Build a ballot from a ranking, dropping repeats (first occurrence wins).
    pub fn new(ranking: impl IntoIterator<Item = usize>) -> Self {
        Self {
            ranking: dedup_preserving_order(ranking),
            diagnostics: Vec::new(),
        }
    }

    /// A ballot that found nothing acceptable.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranking.is_empty()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.ranking.contains(&index)
    }

    /// 1-based position of `index` in this ballot, if ranked.
    pub fn position_of(&self, index: usize) -> Option<usize> {
        self.ranking.iter().position(|&i| i == index).map(|p| p + 1)
    }
}

#[derive(Deserialize)]
struct RankingReply {
    ranking: Option<Vec<Value>>,
    #[serde(rename = "perCandidate", alias = "per_candidate", default)]
    per_candidate: Vec<Value>,
}

/// Decode a raw evaluator reply into a sanitized ballot.
///
/// Ranking values are filtered to non-negative integers below
/// `candidate_count`, then de-duplicated keeping first-seen order.
pub fn decode_ballot(raw: &str, candidate_count: usize) -> BallotResult<Ballot> {
    let json = extract_json_object(raw).ok_or(BallotError::NoJson)?;
    let reply: RankingReply =
        serde_json::from_str(json).map_err(|e| BallotError::InvalidJson(e.to_string()))?;
    let values = reply.ranking.ok_or(BallotError::MissingRanking)?;

    let ranking = dedup_preserving_order(
        values
            .iter()
            .filter_map(ranking_index)
            .filter(|&v| v < candidate_count),
    );

    let diagnostics = reply
        .per_candidate
        .iter()
        .filter_map(|entry| decode_diagnostics(entry, candidate_count))
        .collect();

    Ok(Ballot {
        ranking,
        diagnostics,
    })
}

/// A non-negative whole number, written either as `1` or `1.0`.
fn ranking_index(value: &Value) -> Option<usize> {
    if let Some(v) = value.as_u64() {
        return Some(v as usize);
    }
    let v = value.as_f64()?;
    (v >= 0.0 && v.fract() == 0.0 && v <= usize::MAX as f64).then_some(v as usize)
}

fn decode_diagnostics(entry: &Value, candidate_count: usize) -> Option<CandidateDiagnostics> {
    let index = entry.get("index")?.as_u64()? as usize;
    if index >= candidate_count {
        return None;
    }
    let strings = |key: &str| -> Vec<String> {
        entry
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };
    Some(CandidateDiagnostics {
        index,
        strengths: strings("strengths"),
        issues: strings("issues"),
    })
}

fn dedup_preserving_order(values: impl IntoIterator<Item = usize>) -> Vec<usize> {
    let mut seen = HashSet::new();
    values.into_iter().filter(|v| seen.insert(*v)).collect()
}

/// Locate the JSON object in a model reply: the whole reply, a fenced
/// ```json block, or the outermost `{...}` span, in that order.
fn extract_json_object(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map(|n| n + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            let fenced = body[..end].trim();
            if fenced.starts_with('{') {
                return Some(fenced);
            }
        }
    }

    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&trimmed[start..=end]),
        _ => None,
    }
}
