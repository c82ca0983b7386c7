//! The seam between the scheduler and the tensor-level engine.
//!
//! The scheduler never touches tensors or KV indices directly. Everything
//! it needs from the model (the forward pass, KV sequence surgery, the
//! tokenizer, per-request sampler construction) goes through
//! [`ModelBackend`]. The production implementation drives llama.cpp; tests
//! use a scripted mock.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::EngineError;
use crate::sampling::{Sampler, SamplerSpec};

/// Vocabulary token id.
pub type Token = i32;

/// KV sequence id. Sequence 0 is reserved for the system prompt; slot `i`
/// owns sequence `i + 1`.
pub type SeqId = i32;

/// Position within a KV sequence.
pub type Pos = i32;

// ─── Batch ────────────────────────────────────────────────────────────────

/// A joint forward batch composed from many slots.
///
/// Column layout mirrors the engine's wire format: one token, position,
/// sequence id and logits flag per entry.
#[derive(Debug, Default)]
pub struct TokenBatch {
    tokens: Vec<Token>,
    pos: Vec<Pos>,
    seq_ids: Vec<SeqId>,
    logits: Vec<bool>,
}

impl TokenBatch {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(n),
            pos: Vec::with_capacity(n),
            seq_ids: Vec::with_capacity(n),
            logits: Vec::with_capacity(n),
        }
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
        self.pos.clear();
        self.seq_ids.clear();
        self.logits.clear();
    }

    pub fn add(&mut self, token: Token, pos: Pos, seq_id: SeqId, logits: bool) {
        self.tokens.push(token);
        self.pos.push(pos);
        self.seq_ids.push(seq_id);
        self.logits.push(logits);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Flip the logits flag on the most recently added entry.
    pub fn set_last_logits(&mut self, logits: bool) {
        if let Some(l) = self.logits.last_mut() {
            *l = logits;
        }
    }

    /// Borrow the sub-batch `[offset, offset + len)` for one decode call.
    pub fn view(&self, offset: usize, len: usize) -> BatchView<'_> {
        BatchView {
            tokens: &self.tokens[offset..offset + len],
            pos: &self.pos[offset..offset + len],
            seq_ids: &self.seq_ids[offset..offset + len],
            logits: &self.logits[offset..offset + len],
        }
    }
}

/// A contiguous chunk of a [`TokenBatch`] passed to one forward call.
#[derive(Debug, Clone, Copy)]
pub struct BatchView<'a> {
    pub tokens: &'a [Token],
    pub pos: &'a [Pos],
    pub seq_ids: &'a [SeqId],
    pub logits: &'a [bool],
}

impl BatchView<'_> {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

// ─── Backend error ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The KV cache could not fit the batch. Retryable with a smaller batch.
    #[error("could not find a KV slot for the batch")]
    NoKvSlot,

    /// Unrecoverable failure inside the forward pass.
    #[error("decode failed: {0}")]
    Fatal(String),
}

// ─── Chat / LoRA collaborator types ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoraAdapter {
    pub id: usize,
    pub path: String,
    pub scale: f32,
}

// ─── The backend trait ────────────────────────────────────────────────────

/// Narrow handle over the model, tokenizer and shared KV cache.
///
/// Only the scheduler thread ever holds one, which is what makes the
/// single-writer KV discipline hold by construction.
pub trait ModelBackend: Send {
    // Model metadata.
    fn n_ctx(&self) -> usize;
    fn n_ctx_train(&self) -> usize;
    fn n_embd(&self) -> usize;
    fn n_vocab(&self) -> usize;
    fn has_encoder(&self) -> bool;
    /// Whether the vocabulary wants a BOS token prepended to plain prompts.
    fn add_bos(&self) -> bool;

    // Forward pass. `embeddings` selects pooled-embedding extraction mode
    // for the whole call; a batch is either all-embedding or all-decoding.
    fn decode(&mut self, batch: BatchView<'_>, embeddings: bool) -> Result<(), DecodeError>;

    /// Logits row for entry `i` of the last decoded view. Only valid for
    /// entries submitted with `logits = true`.
    fn logits(&self, i: usize) -> Vec<f32>;

    /// Pooled embedding for a sequence after an embedding-mode decode.
    fn embedding(&self, seq_id: SeqId) -> Option<Vec<f32>>;

    // KV sequence surgery. Positions follow llama.cpp conventions:
    // `p1 = -1` means "to the end of the sequence".
    fn kv_clear(&mut self);
    fn kv_seq_rm(&mut self, seq_id: SeqId, p0: Pos, p1: Pos) -> bool;
    fn kv_seq_add(&mut self, seq_id: SeqId, p0: Pos, p1: Pos, delta: Pos);
    fn kv_seq_div(&mut self, seq_id: SeqId, p0: Pos, p1: Pos, d: i32);
    fn kv_seq_cp(&mut self, src: SeqId, dst: SeqId, p0: Pos, p1: Pos);
    /// Number of KV cells currently occupied, for metrics.
    fn kv_used_cells(&self) -> usize;

    // Tokenizer.
    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Vec<Token>;
    /// Detokenize a single token into its piece bytes. Byte-level tokens may
    /// carry a partial multi-byte sequence; the stop detector reassembles.
    fn token_piece(&self, token: Token) -> Vec<u8>;
    fn token_is_eog(&self, token: Token) -> bool;
    fn token_bos(&self) -> Token;
    fn token_eos(&self) -> Token;
    fn token_sep(&self) -> Token;
    /// Fill-in-the-middle markers, when the model defines them.
    fn token_fim_prefix(&self) -> Option<Token>;
    fn token_fim_suffix(&self) -> Option<Token>;
    fn token_fim_middle(&self) -> Option<Token>;

    /// Construct a per-request sampler from the merged spec. Fails on an
    /// unparseable grammar.
    fn new_sampler(&self, spec: &SamplerSpec) -> Result<Box<dyn Sampler>, EngineError>;

    /// Compile a JSON schema into a grammar string.
    fn json_schema_to_grammar(&self, schema: &serde_json::Value) -> Result<String, EngineError>;

    /// Render a chat conversation through the model's chat template.
    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<String, EngineError>;
    fn chat_template_name(&self) -> Option<String>;

    // Sequence state persistence for slot save/restore.
    fn seq_save_file(
        &mut self,
        seq_id: SeqId,
        path: &Path,
        tokens: &[Token],
    ) -> Result<u64, EngineError>;
    fn seq_load_file(
        &mut self,
        seq_id: SeqId,
        path: &Path,
    ) -> Result<(u64, Vec<Token>), EngineError>;

    // LoRA hotswap.
    fn lora_list(&self) -> Vec<LoraAdapter>;
    fn lora_set_scales(&mut self, scales: &[(usize, f32)]) -> Result<(), EngineError>;

    fn model_name(&self) -> String;
}

/// Length of the shared prefix of two token sequences.
pub fn common_prefix_len(a: &[Token], b: &[Token]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
