//! Language-model collaborator boundary.
//!
//! The graph treats the model as its only nondeterministic external
//! dependency: a synchronous-looking `structured_call` that returns JSON
//! matching a named schema, and may fail with `empty_response` or
//! `parse_error`. During replay the caller supplies a [`ScriptedModel`]
//! loaded with recorded responses, which is what makes checkpoint replay
//! deterministic.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Faults the model collaborator can raise.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The model returned null or blank content.
    #[error("empty_response: model returned no content")]
    EmptyResponse,

    /// The model's content did not match the requested schema.
    #[error("parse_error: {0}")]
    ParseError(String),
}

/// The model collaborator interface.
///
/// `schema` is the name of the response schema the caller expects; prompts
/// must instruct the model to emit matching JSON. Implementations never
/// stream.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn structured_call(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        schema: &str,
    ) -> Result<serde_json::Value, LlmError>;
}

/// Call the model and deserialize the response into `T`, retrying once on
/// either fault kind before giving up.
pub async fn structured<T: DeserializeOwned>(
    model: &dyn LanguageModel,
    system_prompt: &str,
    user_prompt: &str,
    schema: &str,
) -> Result<T, LlmError> {
    let mut last_err = None;
    for attempt in 0..2 {
        match model.structured_call(system_prompt, user_prompt, schema).await {
            Ok(value) => match serde_json::from_value::<T>(value) {
                Ok(parsed) => return Ok(parsed),
                Err(e) => {
                    tracing::warn!(schema, attempt, error = %e, "schema mismatch in model response");
                    last_err = Some(LlmError::ParseError(e.to_string()));
                }
            },
            Err(e) => {
                tracing::warn!(schema, attempt, error = %e, "model call failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or(LlmError::EmptyResponse))
}

/// A model that replays a fixed queue of responses.
///
/// Used for replaying recorded missions and in deterministic tests. Each
/// `structured_call` pops the next queued response; an exhausted queue is an
/// `empty_response` fault.
#[derive(Default)]
pub struct ScriptedModel {
    responses: Mutex<VecDeque<serde_json::Value>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<serde_json::Value>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }

    /// Append a response to the back of the queue.
    pub fn push(&self, response: serde_json::Value) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
    }

    /// Number of responses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn structured_call(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
        _schema: &str,
    ) -> Result<serde_json::Value, LlmError> {
        let next = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(value) if !value.is_null() => Ok(value),
            _ => Err(LlmError::EmptyResponse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Answer {
        verdict: String,
    }

    #[tokio::test]
    async fn scripted_model_replays_in_order() {
        let model = ScriptedModel::new(vec![
            serde_json::json!({"verdict": "first"}),
            serde_json::json!({"verdict": "second"}),
        ]);

        let a: Answer = structured(&model, "sys", "user", "answer").await.unwrap();
        let b: Answer = structured(&model, "sys", "user", "answer").await.unwrap();
        assert_eq!(a.verdict, "first");
        assert_eq!(b.verdict, "second");
        assert_eq!(model.remaining(), 0);
    }

    #[tokio::test]
    async fn exhausted_queue_is_empty_response() {
        let model = ScriptedModel::default();
        let result: Result<Answer, _> = structured(&model, "s", "u", "answer").await;
        assert!(matches!(result, Err(LlmError::EmptyResponse)));
    }

    #[tokio::test]
    async fn schema_mismatch_retries_then_parse_error() {
        // First response has the wrong shape; the retry consumes the second
        // (also wrong) and the helper reports a parse fault.
        let model = ScriptedModel::new(vec![
            serde_json::json!({"wrong": 1}),
            serde_json::json!({"wrong": 2}),
        ]);
        let result: Result<Answer, _> = structured(&model, "s", "u", "answer").await;
        assert!(matches!(result, Err(LlmError::ParseError(_))));
    }

    #[tokio::test]
    async fn retry_recovers_from_one_bad_response() {
        let model = ScriptedModel::new(vec![
            serde_json::json!({"wrong": 1}),
            serde_json::json!({"verdict": "ok"}),
        ]);
        let answer: Answer = structured(&model, "s", "u", "answer").await.unwrap();
        assert_eq!(answer.verdict, "ok");
    }

    #[tokio::test]
    async fn null_response_is_empty_fault() {
        let model = ScriptedModel::new(vec![serde_json::Value::Null]);
        let result = model.structured_call("s", "u", "answer").await;
        assert!(matches!(result, Err(LlmError::EmptyResponse)));
    }
}
