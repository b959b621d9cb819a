//! Review feedback extraction.
//!
//! The reviewer agent's raw output is parsed twice: a regex picks up an
//! explicit `Score: X/10` marker, and the language model extracts the
//! structured fields. The model is instructed to faithfully extract, never
//! to re-grade; when it reports a zero score but the regex found a positive
//! one, the regex value wins (models sometimes drop the number while
//! summarizing).

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::llm::{self, LanguageModel, LlmError};
use crate::mission::ReviewFeedback;

/// Schema name passed to the model collaborator.
pub const REVIEW_SCHEMA: &str = "review_feedback";

const EXTRACT_SYSTEM_PROMPT: &str = "\
You are a review-report extractor. You will be given the raw output of a \
code reviewer. Extract, faithfully and without re-grading:\n\
- score: the integer 0-10 score the reviewer stated (0 if none stated)\n\
- summary: the reviewer's overall summary, one or two sentences\n\
- issues: the concrete problems the reviewer raised\n\
- suggestions: the improvements the reviewer proposed\n\
Respond with a single JSON object: \
{\"score\": <int>, \"summary\": <string>, \"issues\": [<string>], \
\"suggestions\": [<string>]}. Do not add fields, do not change the score.";

fn score_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)Score:\s*(\d+)\s*/\s*10").expect("valid regex"))
}

/// Extract an explicit `Score: X/10` marker from raw review text.
pub fn extract_score(raw: &str) -> Option<u8> {
    score_re()
        .captures(raw)
        .and_then(|c| c[1].parse::<u8>().ok())
        .filter(|s| *s <= 10)
}

#[derive(Debug, Deserialize)]
struct ReviewExtraction {
    #[serde(default)]
    score: u8,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    suggestions: Vec<String>,
}

/// Parse reviewer output into [`ReviewFeedback`].
///
/// Model faults propagate to the caller after the helper's single retry;
/// the enclosing graph node decides whether they fail the mission.
pub async fn parse_review_output(
    model: &dyn LanguageModel,
    task_id: &str,
    raw: &str,
    threshold: u8,
) -> Result<ReviewFeedback, LlmError> {
    let regex_score = extract_score(raw);

    let extraction: ReviewExtraction =
        llm::structured(model, EXTRACT_SYSTEM_PROMPT, raw, REVIEW_SCHEMA).await?;

    let mut score = extraction.score.min(10);
    if score == 0 {
        if let Some(rs) = regex_score {
            if rs > 0 {
                tracing::debug!(task_id, regex_score = rs, "substituting regex-extracted score");
                score = rs;
            }
        }
    }

    Ok(ReviewFeedback {
        task_id: task_id.to_string(),
        approved: score >= threshold,
        summary: extraction.summary,
        issues: extraction.issues,
        suggestions: extraction.suggestions,
        score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;

    #[test]
    fn score_marker_variants() {
        assert_eq!(extract_score("Score: 8/10"), Some(8));
        assert_eq!(extract_score("score: 10 / 10"), Some(10));
        assert_eq!(extract_score("Final verdict -- Score:7/10."), Some(7));
        assert_eq!(extract_score("no score here"), None);
        // Out-of-range markers are ignored.
        assert_eq!(extract_score("Score: 12/10"), None);
    }

    #[tokio::test]
    async fn model_extraction_is_used_directly() {
        let model = ScriptedModel::new(vec![serde_json::json!({
            "score": 9,
            "summary": "solid change",
            "issues": [],
            "suggestions": ["add a doc comment"],
        })]);

        let feedback = parse_review_output(&model, "t-1", "Score: 9/10 solid change", 7)
            .await
            .unwrap();
        assert_eq!(feedback.score, 9);
        assert!(feedback.approved);
        assert_eq!(feedback.suggestions.len(), 1);
    }

    #[tokio::test]
    async fn zero_model_score_falls_back_to_regex() {
        let model = ScriptedModel::new(vec![serde_json::json!({
            "score": 0,
            "summary": "looks fine",
            "issues": [],
            "suggestions": [],
        })]);

        let feedback = parse_review_output(&model, "t-1", "Overall Score: 8/10, looks fine", 7)
            .await
            .unwrap();
        assert_eq!(feedback.score, 8);
        assert!(feedback.approved);
    }

    #[tokio::test]
    async fn zero_score_without_marker_stays_zero() {
        let model = ScriptedModel::new(vec![serde_json::json!({
            "score": 0,
            "summary": "reviewer gave no score",
            "issues": ["missing tests"],
            "suggestions": [],
        })]);

        let feedback = parse_review_output(&model, "t-1", "reviewer gave no score", 7)
            .await
            .unwrap();
        assert_eq!(feedback.score, 0);
        assert!(!feedback.approved);
    }

    #[tokio::test]
    async fn approval_follows_threshold() {
        let model = ScriptedModel::new(vec![
            serde_json::json!({"score": 7, "summary": "", "issues": [], "suggestions": []}),
            serde_json::json!({"score": 6, "summary": "", "issues": [], "suggestions": []}),
        ]);

        let ok = parse_review_output(&model, "t", "x", 7).await.unwrap();
        assert!(ok.approved);
        let denied = parse_review_output(&model, "t", "x", 7).await.unwrap();
        assert!(!denied.approved);
    }

    #[tokio::test]
    async fn model_fault_propagates_after_retry() {
        let model = ScriptedModel::default();
        let result = parse_review_output(&model, "t", "x", 7).await;
        assert!(matches!(result, Err(LlmError::EmptyResponse)));
    }
}
