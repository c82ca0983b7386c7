//! Tasks submitted to the scheduler and results flowing back.
//!
//! HTTP handlers build a [`Task`], post it to the task queue and then block
//! on the result queue for the task id. Streaming completions see a series
//! of `stop = false` results followed by exactly one `stop = true` result.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::metrics::MetricsSnapshot;
use crate::model::Token;
use crate::sampling::{SamplerSpec, TokenProb};
use crate::speculative::SpeculativeParams;

/// Task identifier. Monotonic per process; 0 is valid, -1 means "none".
pub type TaskId = i64;

pub const NO_TASK: TaskId = -1;

// ─── Prompt input ─────────────────────────────────────────────────────────

/// The prompt forms accepted by the completion endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    /// Plain text, tokenized by the backend.
    Text(String),
    /// Pre-tokenized input.
    Tokens(Vec<Token>),
    /// Interleaved text fragments and token runs.
    Mixed(Vec<PromptPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptPart {
    Text(String),
    Tokens(Vec<Token>),
    Token(Token),
}

impl PromptInput {
    /// The text form, when the prompt is a plain string. Used by
    /// prompt-similarity slot selection, which only ranks string prompts.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            _ => None,
        }
    }
}

// ─── Completion request payload ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionKind {
    Normal,
    Embedding,
    Rerank,
    Infill,
}

/// Per-request sampling overrides; `None` falls back to the server default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingOverrides {
    pub seed: Option<u32>,
    pub temperature: Option<f32>,
    pub top_k: Option<i32>,
    pub top_p: Option<f32>,
    pub min_p: Option<f32>,
    pub typical_p: Option<f32>,
    pub penalty_last_n: Option<i32>,
    pub penalty_repeat: Option<f32>,
    pub penalty_freq: Option<f32>,
    pub penalty_present: Option<f32>,
    pub min_keep: Option<usize>,
    pub n_probs: Option<usize>,
    pub grammar: Option<String>,
    pub json_schema: Option<serde_json::Value>,
    pub logit_bias: Option<Vec<(Token, f32)>>,
    pub ignore_eos: Option<bool>,
}

impl SamplingOverrides {
    /// Overlay these overrides on a base spec. `json_schema` is resolved to
    /// a grammar by the launch path before this is applied.
    pub fn apply(&self, base: &SamplerSpec) -> SamplerSpec {
        SamplerSpec {
            seed: self.seed.unwrap_or(base.seed),
            temperature: self.temperature.unwrap_or(base.temperature),
            top_k: self.top_k.unwrap_or(base.top_k),
            top_p: self.top_p.unwrap_or(base.top_p),
            min_p: self.min_p.unwrap_or(base.min_p),
            typical_p: self.typical_p.unwrap_or(base.typical_p),
            penalty_last_n: self.penalty_last_n.unwrap_or(base.penalty_last_n),
            penalty_repeat: self.penalty_repeat.unwrap_or(base.penalty_repeat),
            penalty_freq: self.penalty_freq.unwrap_or(base.penalty_freq),
            penalty_present: self.penalty_present.unwrap_or(base.penalty_present),
            min_keep: self.min_keep.unwrap_or(base.min_keep),
            n_probs: self.n_probs.unwrap_or(base.n_probs),
            grammar: self.grammar.clone().unwrap_or_else(|| base.grammar.clone()),
            logit_bias: self
                .logit_bias
                .clone()
                .unwrap_or_else(|| base.logit_bias.clone()),
            ignore_eos: self.ignore_eos.unwrap_or(base.ignore_eos),
        }
    }
}

/// Speculative overrides; `None` falls back to the server default.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SpeculativeOverrides {
    pub n_min: Option<usize>,
    pub n_max: Option<usize>,
    pub p_min: Option<f32>,
}

impl SpeculativeOverrides {
    pub fn apply(&self, base: &SpeculativeParams) -> SpeculativeParams {
        SpeculativeParams {
            n_min: self.n_min.unwrap_or(base.n_min),
            n_max: self.n_max.unwrap_or(base.n_max),
            p_min: self.p_min.unwrap_or(base.p_min),
        }
    }
}

/// Everything a completion-family task carries into the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequestData {
    pub kind: CompletionKind,
    pub prompt: PromptInput,
    /// Sub-index within a multi-prompt submission, echoed back in results.
    pub index: usize,
    /// Pin to a specific slot; otherwise similarity/LRU selection applies.
    pub id_slot: Option<usize>,
    pub stream: bool,
    pub cache_prompt: bool,
    pub n_predict: Option<i32>,
    pub n_keep: Option<i32>,
    pub n_discard: Option<i32>,
    /// Stop strings (antiprompts).
    pub stop: Vec<String>,
    /// Infill context halves.
    pub input_prefix: String,
    pub input_suffix: String,
    pub sampling: SamplingOverrides,
    pub speculative: SpeculativeOverrides,
}

impl CompletionRequestData {
    pub fn new(kind: CompletionKind, prompt: PromptInput) -> Self {
        Self {
            kind,
            prompt,
            index: 0,
            id_slot: None,
            stream: false,
            cache_prompt: false,
            n_predict: None,
            n_keep: None,
            n_discard: None,
            stop: Vec::new(),
            input_prefix: String::new(),
            input_suffix: String::new(),
            sampling: SamplingOverrides::default(),
            speculative: SpeculativeOverrides::default(),
        }
    }
}

// ─── Task ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAction {
    Save,
    Restore,
    Erase,
}

#[derive(Debug)]
pub enum TaskKind {
    Completion(Box<CompletionRequestData>),
    /// Cancel the task identified by `id_target`.
    Cancel { id_target: TaskId },
    /// Scheduler-iteration marker; processed as a no-op.
    NextResponse,
    /// Snapshot metrics; optionally zero the per-bucket counters.
    Metrics { reset_bucket: bool },
    SlotIo {
        slot_id: usize,
        action: SlotAction,
        filename: String,
    },
    SetLora { scales: Vec<(usize, f32)> },
}

#[derive(Debug)]
pub struct Task {
    /// Assigned by the queue on post when negative.
    pub id: TaskId,
    pub kind: TaskKind,
}

impl Task {
    pub fn new(kind: TaskKind) -> Self {
        Self { id: NO_TASK, kind }
    }

    pub fn with_id(id: TaskId, kind: TaskKind) -> Self {
        Self { id, kind }
    }
}

// ─── Results ──────────────────────────────────────────────────────────────

/// Wall-clock rates for one finished request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timings {
    pub prompt_n: usize,
    pub prompt_ms: f64,
    pub prompt_per_second: f64,
    pub predicted_n: usize,
    pub predicted_ms: f64,
    pub predicted_per_second: f64,
}

/// One token's reported probabilities (`n_probs`).
#[derive(Debug, Clone, Serialize)]
pub struct TokenProbs {
    pub token: Token,
    pub piece: String,
    pub probs: Vec<TokenProb>,
}

/// Streaming or final completion output for one slot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompletionOutput {
    pub content: String,
    pub index: usize,
    pub slot_id: usize,
    pub tokens_predicted: usize,
    pub tokens_evaluated: usize,
    /// Prompt tokens actually decoded this request (prefix reuse skips the rest).
    pub tokens_cached: usize,
    pub prompt_n: usize,
    pub truncated: bool,
    pub stopped_eos: bool,
    pub stopped_word: bool,
    pub stopped_limit: bool,
    pub stopping_word: String,
    pub seed: u32,
    pub probs: Vec<TokenProbs>,
    pub timings: Option<Timings>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingOutput {
    pub index: usize,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RerankOutput {
    pub index: usize,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotIoOutput {
    pub slot_id: usize,
    pub filename: String,
    pub n_tokens: usize,
    pub n_bytes: u64,
    pub t_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub enum ResultData {
    Completion(CompletionOutput),
    Embedding(EmbeddingOutput),
    Rerank(RerankOutput),
    Metrics(Box<MetricsSnapshot>),
    SlotIo(SlotIoOutput),
    Lora(Vec<crate::model::LoraAdapter>),
    Cancelled,
    Error(ErrorData),
    /// Acknowledgement with no payload (e.g. LoRA applied).
    Ok,
}

/// A unit delivered through the result queue.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub id: TaskId,
    /// Final result for this task id.
    pub stop: bool,
    pub error: bool,
    pub data: ResultData,
}

impl TaskResult {
    pub fn partial(id: TaskId, data: ResultData) -> Self {
        Self {
            id,
            stop: false,
            error: false,
            data,
        }
    }

    pub fn finished(id: TaskId, data: ResultData) -> Self {
        Self {
            id,
            stop: true,
            error: false,
            data,
        }
    }

    pub fn error(id: TaskId, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            stop: true,
            error: true,
            data: ResultData::Error(ErrorData {
                code,
                message: message.into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_fall_back_to_base() {
        let base = SamplerSpec {
            temperature: 0.3,
            top_k: 17,
            ..SamplerSpec::default()
        };
        let merged = SamplingOverrides::default().apply(&base);
        assert_eq!(merged.temperature, 0.3);
        assert_eq!(merged.top_k, 17);
    }

    #[test]
    fn overrides_win_over_base() {
        let base = SamplerSpec::default();
        let overrides = SamplingOverrides {
            temperature: Some(0.0),
            grammar: Some("root ::= \"x\"".into()),
            ..SamplingOverrides::default()
        };
        let merged = overrides.apply(&base);
        assert_eq!(merged.temperature, 0.0);
        assert_eq!(merged.grammar, "root ::= \"x\"");
        assert_eq!(merged.top_k, base.top_k);
    }

    #[test]
    fn speculative_overrides_merge() {
        let base = SpeculativeParams::default();
        let merged = SpeculativeOverrides {
            n_max: Some(4),
            ..SpeculativeOverrides::default()
        }
        .apply(&base);
        assert_eq!(merged.n_max, 4);
        assert_eq!(merged.n_min, base.n_min);
    }

    #[test]
    fn prompt_input_deserializes_untagged() {
        let text: PromptInput = serde_json::from_str("\"hello\"").unwrap();
        assert!(matches!(text, PromptInput::Text(_)));

        let tokens: PromptInput = serde_json::from_str("[1, 2, 3]").unwrap();
        assert!(matches!(tokens, PromptInput::Tokens(_)));

        let mixed: PromptInput = serde_json::from_str("[\"a\", [4, 5], 6]").unwrap();
        assert!(matches!(mixed, PromptInput::Mixed(_)));
    }

    #[test]
    fn result_constructors_set_flags() {
        let partial = TaskResult::partial(3, ResultData::Cancelled);
        assert!(!partial.stop && !partial.error);

        let finished = TaskResult::finished(3, ResultData::Cancelled);
        assert!(finished.stop && !finished.error);

        let error = TaskResult::error(3, ErrorCode::Server, "boom");
        assert!(error.stop && error.error);
    }
}
