//! Evaluator prompt rendering.
//!
//! Evaluators never see the video. They get the instruction the generators
//! were given (the ASK) and the candidate texts, each tagged with its
//! canonical index, in whatever order the pool presents them.

use consensus::PresentedCandidate;

const EVALUATOR_PREAMBLE: &str = r#"You are an evaluator. You do NOT have access to the video. Judge several candidate outputs that were generated from the same video with the same instructions (the ASK).

Tasks:
1) Ranked ballot: list ONLY the acceptable candidates, best first, as a strict order without ties.
2) Diagnostics: for each candidate, give short strengths and issues that reference the ASK where useful.

Definitions:
- Acceptable: follows the ASK in substance, covers what the ASK emphasises, does not contradict the ASK or itself. Style differences do not matter.
- Unacceptable: misses an important requirement of the ASK, contradicts it, adds steps or constraints the ASK does not support, or is largely off-topic.
- When the ASK is ambiguous, prefer candidates that state a reasonable interpretation openly.

Cross-candidate checks:
- Compare candidates with the ASK and with each other. Exact agreement is not expected; ordering, naming and formatting differences are irrelevant.
- A material addition that the ASK does not support and most other candidates lack is likely fabricated: treat the candidate as unacceptable.
- A material omission of something the ASK requires, or that most other candidates include compatibly with the ASK, is a serious issue.
- Agreement between candidates is a reliability signal. The ASK remains the source of truth.

ASK (exact instructions given to the generators):
<<<ASK_START
"#;

const EVALUATOR_BETWEEN: &str = r#"
ASK_END>>>

Candidates (indices start at 0):
<<<CANDIDATES_START
"#;

const EVALUATOR_TRAILER: &str = r#"
CANDIDATES_END>>>

Voting rules:
- Never rank a candidate you consider unacceptable.
- Rank every acceptable candidate.
- An empty ranking means no candidate is acceptable.

Reply with STRICT JSON only, no prose or markdown outside it:
{
  "ranking": number[],
  "perCandidate": [{ "index": number, "strengths": string[], "issues": string[] }]
}"#;

/// One `[index]\ntext` block per candidate, blank-line separated, in the
/// given presentation order.
pub fn render_candidate_blocks(candidates: &[PresentedCandidate<'_>]) -> String {
    candidates
        .iter()
        .map(|c| format!("[{}]\n{}", c.index, c.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Full evaluator prompt for `instruction` over `candidates`.
pub fn build_evaluator_prompt(instruction: &str, candidates: &[PresentedCandidate<'_>]) -> String {
    let blocks = render_candidate_blocks(candidates);
    let mut prompt = String::with_capacity(
        EVALUATOR_PREAMBLE.len()
            + instruction.len()
            + EVALUATOR_BETWEEN.len()
            + blocks.len()
            + EVALUATOR_TRAILER.len(),
    );
    prompt.push_str(EVALUATOR_PREAMBLE);
    prompt.push_str(instruction);
    prompt.push_str(EVALUATOR_BETWEEN);
    prompt.push_str(&blocks);
    prompt.push_str(EVALUATOR_TRAILER);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presented<'a>(items: &[(usize, &'a str)]) -> Vec<PresentedCandidate<'a>> {
        items
            .iter()
            .map(|&(index, text)| PresentedCandidate { index, text })
            .collect()
    }

    #[test]
    fn test_blocks_keep_presentation_order_and_canonical_index() {
        let blocks = render_candidate_blocks(&presented(&[(2, "third"), (0, "first")]));
        assert_eq!(blocks, "[2]\nthird\n\n[0]\nfirst");
    }

    #[test]
    fn test_prompt_embeds_ask_and_candidates() {
        let prompt = build_evaluator_prompt(
            "List the clicks",
            &presented(&[(1, "click A"), (0, "click B")]),
        );
        assert!(prompt.contains("<<<ASK_START\nList the clicks\nASK_END>>>"));
        assert!(prompt.contains("<<<CANDIDATES_START\n[1]\nclick A\n\n[0]\nclick B\nCANDIDATES_END>>>"));
        assert!(prompt.contains("\"ranking\": number[]"));
        assert!(prompt.ends_with('}'));
    }

    #[test]
    fn test_ask_text_is_inserted_verbatim() {
        let prompt = build_evaluator_prompt("say {candidates}", &presented(&[(0, "x")]));
        assert!(prompt.contains("say {candidates}\nASK_END>>>"));
        assert!(prompt.contains("[0]\nx"));
    }
}
