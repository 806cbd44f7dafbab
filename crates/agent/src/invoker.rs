//! Model invocation with per-candidate retry and ordered fallback.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::llm::{ChatTurn, ModelClient, ModelRequest, ModelResponse, ToolSpec};

#[derive(Clone, Debug)]
pub struct InvokerConfig {
    /// Models tried in order; the first to answer wins.
    pub candidates: Vec<String>,
    pub max_attempts_per_candidate: u32,
    pub backoff_base_ms: u64,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            candidates: vec!["llama3.1".to_string()],
            max_attempts_per_candidate: 3,
            backoff_base_ms: 500,
        }
    }
}

/// One attempt against one candidate, kept for turn observability.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttemptRecord {
    pub model: String,
    pub attempt: u32,
    pub error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct InvokerOutcome {
    pub response: ModelResponse,
    /// The candidate that actually answered.
    pub model: String,
    pub attempts: Vec<AttemptRecord>,
}

#[derive(Debug, Error)]
pub enum InvokerError {
    #[error("no model candidates configured")]
    NoCandidates,
    #[error("all {candidates} model candidates exhausted after {attempts} attempts")]
    Exhausted { candidates: usize, attempts: usize, records: Vec<AttemptRecord> },
}

pub struct RetryFallbackInvoker {
    client: Arc<dyn ModelClient>,
    config: InvokerConfig,
}

impl RetryFallbackInvoker {
    pub fn new(client: Arc<dyn ModelClient>, config: InvokerConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    /// Try each configured candidate in order. Transient failures retry
    /// the same candidate with doubling backoff up to the per-candidate
    /// cap; a fatal failure skips straight to the next candidate.
    pub async fn invoke(
        &self,
        turns: Vec<ChatTurn>,
        tools: Vec<ToolSpec>,
    ) -> Result<InvokerOutcome, InvokerError> {
        self.invoke_with_candidates(&[], turns, tools).await
    }

    /// Same retry and fallback behavior with the candidate chain
    /// overridden per call, for agents that carry their own chain. An
    /// empty override falls back to the configured chain.
    pub async fn invoke_with_candidates(
        &self,
        candidates: &[String],
        turns: Vec<ChatTurn>,
        tools: Vec<ToolSpec>,
    ) -> Result<InvokerOutcome, InvokerError> {
        let candidates =
            if candidates.is_empty() { self.config.candidates.as_slice() } else { candidates };
        if candidates.is_empty() {
            return Err(InvokerError::NoCandidates);
        }

        let mut records = Vec::new();
        for candidate in candidates {
            let request =
                ModelRequest { model: candidate.clone(), turns: turns.clone(), tools: tools.clone() };

            for attempt in 1..=self.config.max_attempts_per_candidate.max(1) {
                match self.client.complete(&request).await {
                    Ok(response) => {
                        records.push(AttemptRecord {
                            model: candidate.clone(),
                            attempt,
                            error: None,
                        });
                        return Ok(InvokerOutcome {
                            response,
                            model: candidate.clone(),
                            attempts: records,
                        });
                    }
                    Err(error) => {
                        warn!(
                            event_name = "model_attempt_failed",
                            model = %candidate,
                            attempt,
                            transient = error.is_transient(),
                            error = %error,
                        );
                        let transient = error.is_transient();
                        records.push(AttemptRecord {
                            model: candidate.clone(),
                            attempt,
                            error: Some(error.to_string()),
                        });

                        if !transient {
                            break;
                        }
                        if attempt < self.config.max_attempts_per_candidate {
                            tokio::time::sleep(self.backoff(attempt)).await;
                        }
                    }
                }
            }
        }

        Err(InvokerError::Exhausted {
            candidates: candidates.len(),
            attempts: records.len(),
            records,
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.config.backoff_base_ms << (attempt - 1).min(4))
    }
}
