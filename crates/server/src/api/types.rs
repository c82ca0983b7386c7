//! Wire types for the native and OpenAI-compatible endpoints.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use weft_core::model::{ChatMessage, Token};
use weft_core::task::{CompletionOutput, SamplingOverrides, SpeculativeOverrides};

pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ─── Shared request fragments ─────────────────────────────────────────────

/// Logit bias in either the llama.cpp array form `[[token, bias], ...]` or
/// the OpenAI map form `{"token": bias}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LogitBias {
    Pairs(Vec<(Token, f32)>),
    Map(std::collections::HashMap<String, f32>),
}

impl LogitBias {
    pub fn into_pairs(self) -> Vec<(Token, f32)> {
        match self {
            Self::Pairs(pairs) => pairs,
            Self::Map(map) => map
                .into_iter()
                .filter_map(|(k, v)| k.parse::<Token>().ok().map(|t| (t, v)))
                .collect(),
        }
    }
}

/// Stop strings: a single string or an array of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StopField {
    One(String),
    Many(Vec<String>),
}

impl StopField {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SpeculativeOptions {
    pub n_min: Option<usize>,
    pub n_max: Option<usize>,
    pub p_min: Option<f32>,
}

impl SpeculativeOptions {
    pub fn overrides(&self) -> SpeculativeOverrides {
        SpeculativeOverrides {
            n_min: self.n_min,
            n_max: self.n_max,
            p_min: self.p_min,
        }
    }
}

/// Completion request accepting both the native field names and their
/// OpenAI aliases.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionRequest {
    /// String, token array, or mixed array; also an array of those for
    /// multi-prompt submissions.
    pub prompt: Option<Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(alias = "max_tokens")]
    pub n_predict: Option<i32>,
    pub n_keep: Option<i32>,
    pub n_discard: Option<i32>,
    pub stop: Option<StopField>,
    #[serde(default)]
    pub cache_prompt: bool,
    pub id_slot: Option<usize>,

    // infill
    pub input_prefix: Option<String>,
    pub input_suffix: Option<String>,

    pub temperature: Option<f32>,
    pub top_k: Option<i32>,
    pub top_p: Option<f32>,
    pub min_p: Option<f32>,
    pub typical_p: Option<f32>,
    #[serde(alias = "repeat_penalty")]
    pub penalty_repeat: Option<f32>,
    #[serde(alias = "repeat_last_n")]
    pub penalty_last_n: Option<i32>,
    #[serde(alias = "frequency_penalty")]
    pub penalty_freq: Option<f32>,
    #[serde(alias = "presence_penalty")]
    pub penalty_present: Option<f32>,
    pub seed: Option<u32>,
    pub min_keep: Option<usize>,
    #[serde(alias = "logprobs")]
    pub n_probs: Option<usize>,
    pub ignore_eos: Option<bool>,
    pub grammar: Option<String>,
    pub json_schema: Option<Value>,
    pub logit_bias: Option<LogitBias>,
    pub speculative: Option<SpeculativeOptions>,

    pub model: Option<String>,
}

impl CompletionRequest {
    pub fn sampling_overrides(&self) -> SamplingOverrides {
        SamplingOverrides {
            seed: self.seed,
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            min_p: self.min_p,
            typical_p: self.typical_p,
            penalty_last_n: self.penalty_last_n,
            penalty_repeat: self.penalty_repeat,
            penalty_freq: self.penalty_freq,
            penalty_present: self.penalty_present,
            min_keep: self.min_keep,
            n_probs: self.n_probs,
            grammar: self.grammar.clone(),
            json_schema: self.json_schema.clone(),
            logit_bias: self.logit_bias.clone().map(LogitBias::into_pairs),
            ignore_eos: self.ignore_eos,
        }
    }
}

// ─── Chat ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    pub max_tokens: Option<i32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stop: Option<StopField>,
    pub seed: Option<u32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub logit_bias: Option<LogitBias>,
    pub model: Option<String>,
    pub n_probs: Option<usize>,
    pub json_schema: Option<Value>,
    pub grammar: Option<String>,
    pub response_format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseFormat {
    pub r#type: String,
    pub schema: Option<Value>,
    pub json_schema: Option<JsonSchemaFormat>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonSchemaFormat {
    pub schema: Option<Value>,
}

// ─── Native completion response ───────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct NativeCompletionResponse<'a> {
    pub model: &'a str,
    #[serde(flatten)]
    pub output: &'a CompletionOutput,
    pub stop: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<bool>,
}

// ─── OpenAI shapes ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CompletionChoice {
    pub text: String,
    pub index: usize,
    pub logprobs: Option<Value>,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct ChatMessageOut {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ChatChoice {
    pub index: usize,
    pub message: ChatMessageOut,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Default, Serialize)]
pub struct ChatDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatChunkChoice {
    pub index: usize,
    pub delta: ChatDelta,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChunkChoice>,
}

pub fn finish_reason(output: &CompletionOutput) -> &'static str {
    if output.stopped_eos || output.stopped_word {
        "stop"
    } else {
        "length"
    }
}

// ─── Embeddings / rerank ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EmbeddingRequest {
    /// OpenAI `input` or llama.cpp `content`.
    #[serde(alias = "content")]
    pub input: Value,
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingData {
    pub object: &'static str,
    pub embedding: Vec<f32>,
    pub index: usize,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingResponse {
    pub object: &'static str,
    pub data: Vec<EmbeddingData>,
    pub model: String,
    pub usage: Usage,
}

#[derive(Debug, Deserialize)]
pub struct RerankRequest {
    pub query: String,
    pub documents: Vec<String>,
    pub top_n: Option<usize>,
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RerankResult {
    pub index: usize,
    pub relevance_score: f32,
}

#[derive(Debug, Serialize)]
pub struct RerankResponse {
    pub model: String,
    pub object: &'static str,
    pub results: Vec<RerankResult>,
    pub usage: Usage,
}

// ─── Tokenize / detokenize ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TokenizeRequest {
    pub content: String,
    #[serde(default)]
    pub add_special: bool,
    #[serde(default)]
    pub with_pieces: bool,
}

#[derive(Debug, Serialize)]
pub struct TokenPiece {
    pub id: Token,
    pub piece: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum TokenizeResponse {
    Ids { tokens: Vec<Token> },
    Pieces { tokens: Vec<TokenPiece> },
}

#[derive(Debug, Deserialize)]
pub struct DetokenizeRequest {
    pub tokens: Vec<Token>,
}

#[derive(Debug, Serialize)]
pub struct DetokenizeResponse {
    pub content: String,
}

// ─── Admin / misc ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct PropsResponse {
    pub system_prompt: String,
    pub default_generation_settings: Value,
    pub total_slots: usize,
    pub chat_template: String,
}

#[derive(Debug, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub owned_by: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SlotActionQuery {
    pub action: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SlotFileRequest {
    pub filename: String,
}

#[derive(Debug, Deserialize)]
pub struct LoraScaleRequest {
    pub id: usize,
    pub scale: f32,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub task_id: i64,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub success: bool,
}
