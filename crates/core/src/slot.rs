//! Execution slots.
//!
//! A slot is one of a fixed pool of decoding contexts bound to KV sequence
//! `slot_id + 1`. It carries everything one in-flight request needs: the
//! prompt and cache token vectors, the sampler, stop state, speculative and
//! group-attention bookkeeping, and timing.

use std::time::Instant;

use crate::metrics::SlotView;
use crate::model::Token;
use crate::sampling::Sampler;
use crate::speculative::SpeculativeParams;
use crate::stop::{find_full_stop, find_partial_stop};
use crate::task::{CompletionKind, CompletionRequestData, TaskId, TokenProbs, NO_TASK};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    ProcessingPrompt,
    DonePrompt,
    Generating,
}

impl SlotState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ProcessingPrompt => "processing_prompt",
            Self::DonePrompt => "done_prompt",
            Self::Generating => "generating",
        }
    }
}

/// Resolved per-request parameters, server defaults already merged in.
#[derive(Debug, Clone)]
pub struct SlotParams {
    pub stream: bool,
    pub cache_prompt: bool,
    /// Request token budget; -1 = unset.
    pub n_predict: i32,
    /// Prompt prefix preserved across context shifts; -1 = whole prompt.
    pub n_keep: i32,
    /// Tokens dropped per context shift; 0 = half of the freed span.
    pub n_discard: i32,
    /// Stop strings.
    pub antiprompt: Vec<String>,
    pub input_prefix: String,
    pub input_suffix: String,
    pub sampling: crate::sampling::SamplerSpec,
    pub speculative: SpeculativeParams,
}

impl Default for SlotParams {
    fn default() -> Self {
        Self {
            stream: false,
            cache_prompt: false,
            n_predict: -1,
            n_keep: 0,
            n_discard: 0,
            antiprompt: Vec::new(),
            input_prefix: String::new(),
            input_suffix: String::new(),
            sampling: crate::sampling::SamplerSpec::default(),
            speculative: SpeculativeParams { n_max: 0, ..SpeculativeParams::default() },
        }
    }
}

pub struct Slot {
    pub id: usize,
    /// Per-slot context budget.
    pub n_ctx: usize,

    pub state: SlotState,
    pub id_task: TaskId,
    pub kind: CompletionKind,
    /// Sub-index within a multi-prompt task, echoed in results.
    pub index: usize,
    pub params: SlotParams,

    /// Launched request awaiting prompt assembly; taken on first admission.
    pub request: Option<CompletionRequestData>,
    pub prompt_tokens: Vec<Token>,
    /// Last prompt in string form, for similarity-based slot selection.
    pub prompt_string: String,
    /// Tokens actually present in this slot's KV sequence.
    pub cache_tokens: Vec<Token>,

    pub n_past: usize,
    pub n_prompt_tokens: usize,
    pub n_prompt_tokens_processed: usize,
    pub n_decoded: usize,
    pub n_remaining: i64,
    /// Index of this slot's logits row within the composed batch; None when
    /// no row is pending.
    pub i_batch: Option<usize>,

    pub sampler: Option<Box<dyn Sampler>>,
    /// Last sampled token, fed back as the next single-token decode.
    pub sampled: Token,

    // Group attention (self-extend).
    pub ga_i: i32,
    pub ga_n: i32,
    pub ga_w: i32,
    pub n_past_se: i32,

    // Stop state.
    pub generated_text: String,
    /// Token-piece bytes withheld until they form complete UTF-8.
    pub pending_bytes: Vec<u8>,
    pub generated_probs: Vec<TokenProbs>,
    pub n_sent_text: usize,
    pub n_sent_token_probs: usize,
    pub has_next_token: bool,
    pub truncated: bool,
    pub stopped_eos: bool,
    pub stopped_word: bool,
    pub stopped_limit: bool,
    pub stopping_word: String,

    // Timing.
    pub t_start_process_prompt: Option<Instant>,
    pub t_start_generation: Option<Instant>,
    pub t_prompt_processing_ms: f64,
    pub t_token_generation_ms: f64,
    /// Microsecond timestamp of the last release, for LRU selection.
    pub t_last_used: i64,
}

impl Slot {
    pub fn new(id: usize, n_ctx: usize) -> Self {
        Self {
            id,
            n_ctx,
            state: SlotState::Idle,
            id_task: NO_TASK,
            kind: CompletionKind::Normal,
            index: 0,
            params: SlotParams::default(),
            request: None,
            prompt_tokens: Vec::new(),
            prompt_string: String::new(),
            cache_tokens: Vec::new(),
            n_past: 0,
            n_prompt_tokens: 0,
            n_prompt_tokens_processed: 0,
            n_decoded: 0,
            n_remaining: -1,
            i_batch: None,
            sampler: None,
            sampled: 0,
            ga_i: 0,
            ga_n: 1,
            ga_w: 512,
            n_past_se: 0,
            generated_text: String::new(),
            pending_bytes: Vec::new(),
            generated_probs: Vec::new(),
            n_sent_text: 0,
            n_sent_token_probs: 0,
            has_next_token: false,
            truncated: false,
            stopped_eos: false,
            stopped_word: false,
            stopped_limit: false,
            stopping_word: String::new(),
            t_start_process_prompt: None,
            t_start_generation: None,
            t_prompt_processing_ms: 0.0,
            t_token_generation_ms: 0.0,
            t_last_used: -1,
        }
    }

    /// Clear generation state ahead of a new task. Cache tokens survive so
    /// prefix reuse can compare against them.
    pub fn reset(&mut self) {
        self.request = None;
        self.prompt_tokens.clear();
        self.generated_text.clear();
        self.pending_bytes.clear();
        self.generated_probs.clear();
        self.n_past = 0;
        self.n_prompt_tokens = 0;
        self.n_prompt_tokens_processed = 0;
        self.n_decoded = 0;
        self.n_remaining = -1;
        self.n_sent_text = 0;
        self.n_sent_token_probs = 0;
        self.i_batch = None;
        self.has_next_token = true;
        self.truncated = false;
        self.stopped_eos = false;
        self.stopped_word = false;
        self.stopped_limit = false;
        self.stopping_word.clear();
        self.ga_i = 0;
        self.n_past_se = 0;
        self.t_start_process_prompt = None;
        self.t_start_generation = None;
        self.t_prompt_processing_ms = 0.0;
        self.t_token_generation_ms = 0.0;
    }

    pub fn is_idle(&self) -> bool {
        self.state == SlotState::Idle
    }

    pub fn is_processing(&self) -> bool {
        self.state != SlotState::Idle
    }

    /// KV sequence id: sequence 0 is reserved for the system prompt.
    pub fn seq_id(&self) -> i32 {
        self.id as i32 + 1
    }

    /// Whether the request (or the server-wide cap) still allows tokens.
    /// Updates `n_remaining` as a side effect.
    pub fn has_budget(&mut self, server_n_predict: i32) -> bool {
        if self.params.n_predict == -1 && server_n_predict == -1 {
            self.n_remaining = -1;
            return true;
        }
        self.n_remaining = if self.params.n_predict != -1 {
            i64::from(self.params.n_predict) - self.n_decoded as i64
        } else {
            i64::from(server_n_predict) - self.n_decoded as i64
        };
        self.n_remaining > 0
    }

    /// Find a stop string in `text` (the unsent part of the generation).
    ///
    /// A full match records the stop word and halts generation; a partial
    /// match only reports where emission must pause.
    pub fn find_stopping_strings(
        &mut self,
        text: &str,
        last_token_len: usize,
        full: bool,
    ) -> Option<usize> {
        if full {
            let antiprompt = std::mem::take(&mut self.params.antiprompt);
            let hit = find_full_stop(text, last_token_len, &antiprompt);
            if let Some((pos, word)) = hit {
                self.stopped_word = true;
                self.stopping_word = word.to_string();
                self.has_next_token = false;
                self.params.antiprompt = antiprompt;
                return Some(pos);
            }
            self.params.antiprompt = antiprompt;
            None
        } else {
            find_partial_stop(text, &self.params.antiprompt)
        }
    }

    /// Record one produced token for `n_probs` reporting.
    pub fn add_token(&mut self, probs: TokenProbs) {
        if self.params.sampling.n_probs > 0 {
            self.generated_probs.push(probs);
        }
    }

    pub fn can_speculate(&self, draft_available: bool) -> bool {
        draft_available && self.params.speculative.n_max > 0 && self.params.cache_prompt
    }

    pub fn view(&self) -> SlotView {
        SlotView {
            id: self.id,
            id_task: self.id_task,
            state: self.state.as_str().to_string(),
            n_ctx: self.n_ctx,
            n_past: self.n_past,
            n_decoded: self.n_decoded,
            cache_tokens: self.cache_tokens.len(),
            truncated: self.truncated,
        }
    }
}
