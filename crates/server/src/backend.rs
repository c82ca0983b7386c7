//! llama.cpp production backend.
//!
//! Implements the core's [`ModelBackend`], [`ApiTokenizer`] and
//! [`DraftModel`] seams over the `llama-cpp-2` bindings. Everything the
//! safe wrapper does not expose (KV position surgery, sequence state files,
//! embedding-mode toggling, grammar samplers) goes through `llama-cpp-sys-2`
//! on the raw context pointer.
//!
//! The model and context live for the whole process; handles are leaked to
//! `'static` so the scheduler thread can own contexts borrowing them.

use std::ffi::CString;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;
use tracing::{debug, info, warn};

use weft_core::error::EngineError;
use weft_core::model::{
    BatchView, ChatMessage, DecodeError, LoraAdapter, ModelBackend, Pos, SeqId, Token,
};
use weft_core::sampling::{ChainSampler, Constraint, Sampler, SamplerSpec};
use weft_core::speculative::{DraftModel, SpeculativeParams};

use crate::api::ApiTokenizer;

// ─── Loading ──────────────────────────────────────────────────────────────

pub struct LoadedModel {
    pub backend: &'static LlamaBackend,
    pub model: &'static LlamaModel,
    pub draft_model: Option<&'static LlamaModel>,
}

pub struct LoadOptions {
    pub model_path: PathBuf,
    pub draft_model_path: Option<PathBuf>,
    pub n_gpu_layers: u32,
}

/// Load the target (and optional draft) model. The handles are leaked: the
/// server keeps them until process exit and the contexts created on the
/// scheduler thread need a `'static` borrow.
pub fn load(options: &LoadOptions) -> anyhow::Result<LoadedModel> {
    let backend: &'static LlamaBackend = Box::leak(Box::new(LlamaBackend::init()?));

    let model_params = LlamaModelParams::default().with_n_gpu_layers(options.n_gpu_layers);
    info!(path = %options.model_path.display(), "loading model");
    let model: &'static LlamaModel = Box::leak(Box::new(LlamaModel::load_from_file(
        backend,
        &options.model_path,
        &model_params,
    )?));

    let draft_model = match &options.draft_model_path {
        Some(path) => {
            info!(path = %path.display(), "loading draft model");
            let draft = LlamaModel::load_from_file(backend, path, &model_params)?;
            Some(&*Box::leak(Box::new(draft)))
        }
        None => None,
    };

    Ok(LoadedModel {
        backend,
        model,
        draft_model,
    })
}

// ─── Context construction ─────────────────────────────────────────────────

pub struct ContextOptions {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_ubatch: u32,
    pub n_seq_max: u32,
    pub n_threads: Option<i32>,
    pub embeddings: bool,
}

fn new_context(
    backend: &'static LlamaBackend,
    model: &'static LlamaModel,
    options: &ContextOptions,
) -> anyhow::Result<LlamaContext<'static>> {
    let mut ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(options.n_ctx))
        .with_n_batch(options.n_batch)
        .with_embeddings(options.embeddings);
    ctx_params.context_params.n_ubatch = options.n_ubatch;
    ctx_params.context_params.n_seq_max = options.n_seq_max;
    if let Some(threads) = options.n_threads {
        ctx_params.context_params.n_threads = threads;
        ctx_params.context_params.n_threads_batch = threads;
    }
    Ok(model.new_context(backend, ctx_params)?)
}

// ─── The backend ──────────────────────────────────────────────────────────

pub struct LlamaCpp {
    model: &'static LlamaModel,
    ctx: LlamaContext<'static>,
    batch: LlamaBatch,
    batch_capacity: usize,
    lora: Vec<LoraAdapter>,
}

// Confined to the scheduler thread; the context is created there and never
// shared.
unsafe impl Send for LlamaCpp {}

impl LlamaCpp {
    pub fn new(
        backend: &'static LlamaBackend,
        model: &'static LlamaModel,
        options: &ContextOptions,
    ) -> anyhow::Result<Self> {
        let ctx = new_context(backend, model, options)?;
        let batch_capacity = options.n_batch as usize;
        Ok(Self {
            model,
            ctx,
            batch: LlamaBatch::new(batch_capacity, options.n_seq_max as i32),
            batch_capacity,
            lora: Vec::new(),
        })
    }

    fn ctx_ptr(&self) -> *mut llama_cpp_sys_2::llama_context {
        self.ctx.context.as_ptr()
    }

    fn model_ptr(&self) -> *const llama_cpp_sys_2::llama_model {
        unsafe { llama_cpp_sys_2::llama_get_model(self.ctx.context.as_ptr()) }
    }
}

impl ModelBackend for LlamaCpp {
    fn n_ctx(&self) -> usize {
        self.ctx.n_ctx() as usize
    }

    fn n_ctx_train(&self) -> usize {
        self.model.n_ctx_train() as usize
    }

    fn n_embd(&self) -> usize {
        self.model.n_embd() as usize
    }

    fn n_vocab(&self) -> usize {
        self.model.n_vocab() as usize
    }

    fn has_encoder(&self) -> bool {
        unsafe { llama_cpp_sys_2::llama_model_has_encoder(self.model_ptr()) }
    }

    fn add_bos(&self) -> bool {
        unsafe { llama_cpp_sys_2::llama_add_bos_token(self.model_ptr()) }
    }

    fn decode(&mut self, batch: BatchView<'_>, embeddings: bool) -> Result<(), DecodeError> {
        if batch.len() > self.batch_capacity {
            return Err(DecodeError::Fatal(format!(
                "batch of {} exceeds capacity {}",
                batch.len(),
                self.batch_capacity
            )));
        }
        unsafe { llama_cpp_sys_2::llama_set_embeddings(self.ctx_ptr(), embeddings) };

        self.batch.clear();
        for i in 0..batch.len() {
            self.batch
                .add(
                    LlamaToken(batch.tokens[i]),
                    batch.pos[i],
                    &[batch.seq_ids[i]],
                    batch.logits[i],
                )
                .map_err(|e| DecodeError::Fatal(e.to_string()))?;
        }

        match self.ctx.decode(&mut self.batch) {
            Ok(()) => Ok(()),
            Err(llama_cpp_2::DecodeError::NoKvCacheSlot) => Err(DecodeError::NoKvSlot),
            Err(e) => Err(DecodeError::Fatal(e.to_string())),
        }
    }

    fn logits(&self, i: usize) -> Vec<f32> {
        self.ctx.get_logits_ith(i as i32).to_vec()
    }

    fn embedding(&self, seq_id: SeqId) -> Option<Vec<f32>> {
        self.ctx
            .embeddings_seq_ith(seq_id)
            .ok()
            .map(|e| e.to_vec())
    }

    fn kv_clear(&mut self) {
        unsafe { llama_cpp_sys_2::llama_kv_cache_clear(self.ctx_ptr()) };
    }

    fn kv_seq_rm(&mut self, seq_id: SeqId, p0: Pos, p1: Pos) -> bool {
        unsafe { llama_cpp_sys_2::llama_kv_cache_seq_rm(self.ctx_ptr(), seq_id, p0, p1) }
    }

    fn kv_seq_add(&mut self, seq_id: SeqId, p0: Pos, p1: Pos, delta: Pos) {
        unsafe { llama_cpp_sys_2::llama_kv_cache_seq_add(self.ctx_ptr(), seq_id, p0, p1, delta) };
    }

    fn kv_seq_div(&mut self, seq_id: SeqId, p0: Pos, p1: Pos, d: i32) {
        unsafe { llama_cpp_sys_2::llama_kv_cache_seq_div(self.ctx_ptr(), seq_id, p0, p1, d) };
    }

    fn kv_seq_cp(&mut self, src: SeqId, dst: SeqId, p0: Pos, p1: Pos) {
        unsafe { llama_cpp_sys_2::llama_kv_cache_seq_cp(self.ctx_ptr(), src, dst, p0, p1) };
    }

    fn kv_used_cells(&self) -> usize {
        unsafe { llama_cpp_sys_2::llama_get_kv_cache_used_cells(self.ctx_ptr()) as usize }
    }

    fn tokenize(&self, text: &str, add_special: bool, _parse_special: bool) -> Vec<Token> {
        tokenize_with(self.model, text, add_special)
    }

    fn token_piece(&self, token: Token) -> Vec<u8> {
        self.model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .unwrap_or_default()
    }

    fn token_is_eog(&self, token: Token) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn token_bos(&self) -> Token {
        self.model.token_bos().0
    }

    fn token_eos(&self) -> Token {
        self.model.token_eos().0
    }

    fn token_sep(&self) -> Token {
        unsafe { llama_cpp_sys_2::llama_token_sep(self.model_ptr()) }
    }

    fn token_fim_prefix(&self) -> Option<Token> {
        positive(unsafe { llama_cpp_sys_2::llama_token_prefix(self.model_ptr()) })
    }

    fn token_fim_suffix(&self) -> Option<Token> {
        positive(unsafe { llama_cpp_sys_2::llama_token_suffix(self.model_ptr()) })
    }

    fn token_fim_middle(&self) -> Option<Token> {
        positive(unsafe { llama_cpp_sys_2::llama_token_middle(self.model_ptr()) })
    }

    fn new_sampler(&self, spec: &SamplerSpec) -> Result<Box<dyn Sampler>, EngineError> {
        let constraint: Option<Box<dyn Constraint>> = if spec.grammar.is_empty() {
            None
        } else {
            Some(Box::new(GrammarConstraint::new(
                self.model_ptr(),
                &spec.grammar,
                self.n_vocab(),
            )?))
        };
        Ok(Box::new(ChainSampler::new(spec.clone(), constraint)))
    }

    fn json_schema_to_grammar(&self, _schema: &serde_json::Value) -> Result<String, EngineError> {
        // schema compilation lives in llama.cpp's C++ common library, which
        // the C API does not export
        Err(EngineError::NotSupported(
            "json_schema is not supported by this backend, provide a grammar instead".into(),
        ))
    }

    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<String, EngineError> {
        apply_template(self.model, messages)
    }

    fn chat_template_name(&self) -> Option<String> {
        self.model.get_chat_template(4096).ok()
    }

    fn seq_save_file(
        &mut self,
        seq_id: SeqId,
        path: &Path,
        tokens: &[Token],
    ) -> Result<u64, EngineError> {
        let path = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| EngineError::InvalidRequest("invalid filename".into()))?;
        let written = unsafe {
            llama_cpp_sys_2::llama_state_seq_save_file(
                self.ctx_ptr(),
                path.as_ptr(),
                seq_id,
                tokens.as_ptr(),
                tokens.len(),
            )
        };
        Ok(written as u64)
    }

    fn seq_load_file(
        &mut self,
        seq_id: SeqId,
        path: &Path,
    ) -> Result<(u64, Vec<Token>), EngineError> {
        let c_path = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| EngineError::InvalidRequest("invalid filename".into()))?;
        let mut tokens: Vec<Token> = vec![0; self.n_ctx()];
        let mut n_tokens: usize = 0;
        let read = unsafe {
            llama_cpp_sys_2::llama_state_seq_load_file(
                self.ctx_ptr(),
                c_path.as_ptr(),
                seq_id,
                tokens.as_mut_ptr(),
                tokens.len(),
                &mut n_tokens,
            )
        };
        tokens.truncate(n_tokens);
        Ok((read as u64, tokens))
    }

    fn lora_list(&self) -> Vec<LoraAdapter> {
        self.lora.clone()
    }

    fn lora_set_scales(&mut self, scales: &[(usize, f32)]) -> Result<(), EngineError> {
        for &(id, scale) in scales {
            match self.lora.iter_mut().find(|a| a.id == id) {
                Some(adapter) => {
                    adapter.scale = scale;
                    debug!(id, scale, "lora scale updated");
                }
                None => return Err(EngineError::NotFound(format!("lora adapter {id}"))),
            }
        }
        Ok(())
    }

    fn model_name(&self) -> String {
        self.model
            .meta_val_str("general.name")
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

fn positive(token: Token) -> Option<Token> {
    (token >= 0).then_some(token)
}

fn tokenize_with(model: &LlamaModel, text: &str, add_special: bool) -> Vec<Token> {
    let add_bos = if add_special {
        AddBos::Always
    } else {
        AddBos::Never
    };
    model
        .str_to_token(text, add_bos)
        .map(|tokens| tokens.into_iter().map(|t| t.0).collect())
        .unwrap_or_else(|e| {
            warn!(error = %e, "tokenization failed");
            Vec::new()
        })
}

fn apply_template(model: &LlamaModel, messages: &[ChatMessage]) -> Result<String, EngineError> {
    let chat: Result<Vec<LlamaChatMessage>, _> = messages
        .iter()
        .map(|m| LlamaChatMessage::new(m.role.clone(), m.content.clone()))
        .collect();
    let chat = chat.map_err(|e| EngineError::InvalidRequest(format!("invalid message: {e}")))?;
    model
        .apply_chat_template(None, chat, true)
        .map_err(|e| EngineError::Server(format!("chat template failed: {e}")))
}

// ─── Grammar constraint ───────────────────────────────────────────────────

/// GBNF constraint over the native grammar sampler. Applied to logits as a
/// mask; state advances through `accept`.
struct GrammarConstraint {
    sampler: *mut llama_cpp_sys_2::llama_sampler,
    n_vocab: usize,
}

// Lives and dies on the scheduler thread.
unsafe impl Send for GrammarConstraint {}

impl GrammarConstraint {
    fn new(
        model: *const llama_cpp_sys_2::llama_model,
        grammar: &str,
        n_vocab: usize,
    ) -> Result<Self, EngineError> {
        let grammar_c = CString::new(grammar)
            .map_err(|_| EngineError::InvalidGrammar("grammar contains NUL".into()))?;
        let root = CString::new("root").expect("static string");
        let sampler = unsafe {
            llama_cpp_sys_2::llama_sampler_init_grammar(model, grammar_c.as_ptr(), root.as_ptr())
        };
        if sampler.is_null() {
            return Err(EngineError::InvalidGrammar(format!(
                "failed to parse grammar: {grammar}"
            )));
        }
        Ok(Self { sampler, n_vocab })
    }
}

impl Constraint for GrammarConstraint {
    fn apply(&mut self, logits: &mut [f32]) {
        let mut data: Vec<llama_cpp_sys_2::llama_token_data> = logits
            .iter()
            .enumerate()
            .take(self.n_vocab)
            .map(|(id, &logit)| llama_cpp_sys_2::llama_token_data {
                id: id as i32,
                logit,
                p: 0.0,
            })
            .collect();
        let mut array = llama_cpp_sys_2::llama_token_data_array {
            data: data.as_mut_ptr(),
            size: data.len(),
            selected: -1,
            sorted: false,
        };
        unsafe { llama_cpp_sys_2::llama_sampler_apply(self.sampler, &mut array) };
        for entry in &data {
            logits[entry.id as usize] = entry.logit;
        }
    }

    fn accept(&mut self, token: Token) {
        unsafe { llama_cpp_sys_2::llama_sampler_accept(self.sampler, token) };
    }

    fn reset(&mut self) {
        unsafe { llama_cpp_sys_2::llama_sampler_reset(self.sampler) };
    }
}

impl Drop for GrammarConstraint {
    fn drop(&mut self) {
        unsafe { llama_cpp_sys_2::llama_sampler_free(self.sampler) };
    }
}

// ─── Draft model ──────────────────────────────────────────────────────────

/// Greedy draft generation on a second, lighter model. The draft context
/// keeps its own KV and reuses the longest common prefix between calls.
pub struct LlamaDraft {
    ctx: LlamaContext<'static>,
    model: &'static LlamaModel,
    batch: LlamaBatch,
    /// Tokens currently decoded into the draft KV (sequence 0).
    kept: Vec<Token>,
}

// Confined to the scheduler thread.
unsafe impl Send for LlamaDraft {}

impl LlamaDraft {
    pub fn new(
        backend: &'static LlamaBackend,
        model: &'static LlamaModel,
        options: &ContextOptions,
    ) -> anyhow::Result<Self> {
        let ctx = new_context(backend, model, options)?;
        let batch = LlamaBatch::new(options.n_batch as usize, 1);
        Ok(Self {
            ctx,
            model,
            batch,
            kept: Vec::new(),
        })
    }

    fn decode_tokens(&mut self, tokens: &[Token], start_pos: usize) -> anyhow::Result<()> {
        self.batch.clear();
        for (i, &t) in tokens.iter().enumerate() {
            let last = i + 1 == tokens.len();
            self.batch
                .add(LlamaToken(t), (start_pos + i) as i32, &[0], last)?;
        }
        self.ctx.decode(&mut self.batch)?;
        Ok(())
    }

    fn greedy_with_prob(&self) -> (Token, f32) {
        let logits = self.ctx.get_logits_ith(-1);
        let mut best = 0usize;
        for (i, &l) in logits.iter().enumerate() {
            if l > logits[best] {
                best = i;
            }
        }
        // softmax probability of the argmax, for the p_min gate
        let max = logits[best];
        let denom: f32 = logits.iter().map(|&l| (l - max).exp()).sum();
        (best as Token, 1.0 / denom.max(1e-9))
    }
}

impl DraftModel for LlamaDraft {
    fn gen_draft(
        &mut self,
        params: &SpeculativeParams,
        prompt: &[Token],
        last: Token,
    ) -> Vec<Token> {
        let mut target: Vec<Token> = Vec::with_capacity(prompt.len() + 1);
        target.extend_from_slice(prompt);
        target.push(last);

        // reuse the shared prefix already in the draft KV
        let common = self
            .kept
            .iter()
            .zip(target.iter())
            .take_while(|(a, b)| a == b)
            .count();
        if common < self.kept.len() {
            unsafe {
                llama_cpp_sys_2::llama_kv_cache_seq_rm(
                    self.ctx.context.as_ptr(),
                    0,
                    common as i32,
                    -1,
                );
            }
            self.kept.truncate(common);
        }

        let fresh = &target[common..];
        if !fresh.is_empty() {
            if let Err(e) = self.decode_tokens(&fresh.to_vec(), common) {
                warn!(error = %e, "draft prefill failed");
                return Vec::new();
            }
            self.kept.extend_from_slice(fresh);
        }

        let mut draft = Vec::with_capacity(params.n_max);
        for _ in 0..params.n_max {
            let (token, prob) = self.greedy_with_prob();
            if prob < params.p_min {
                break;
            }
            if self.model.is_eog_token(LlamaToken(token)) {
                draft.push(token);
                break;
            }
            draft.push(token);

            let pos = self.kept.len();
            if self.decode_tokens(&[token], pos).is_err() {
                break;
            }
            self.kept.push(token);
        }
        draft
    }

    fn name(&self) -> &str {
        "llama-draft"
    }
}

// ─── Tokenizer for the HTTP layer ─────────────────────────────────────────

/// Read-only tokenizer facade shared with handler tasks.
pub struct LlamaTokenizer {
    model: &'static LlamaModel,
}

impl LlamaTokenizer {
    pub fn new(model: &'static LlamaModel) -> Arc<Self> {
        Arc::new(Self { model })
    }
}

impl ApiTokenizer for LlamaTokenizer {
    fn tokenize(&self, text: &str, add_special: bool, _parse_special: bool) -> Vec<Token> {
        tokenize_with(self.model, text, add_special)
    }

    fn token_piece(&self, token: Token) -> Vec<u8> {
        self.model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .unwrap_or_default()
    }

    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<String, EngineError> {
        apply_template(self.model, messages)
    }
}
