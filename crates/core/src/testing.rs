//! Scripted model backend for driving the scheduler in tests.
//!
//! Character-level tokenizer (one token per char, printable ASCII and
//! beyond), a real per-sequence KV store honoring the sequence operations,
//! and a pluggable next-token script. Enabled for downstream crates through
//! the `test-utils` feature.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::EngineError;
use crate::model::{
    BatchView, ChatMessage, DecodeError, LoraAdapter, ModelBackend, Pos, SeqId, Token,
};
use crate::sampling::{ChainSampler, Sampler, SamplerSpec};

pub const BOS: Token = 1;
pub const EOS: Token = 2;
pub const SEP: Token = 3;
pub const FIM_PRE: Token = 4;
pub const FIM_SUF: Token = 5;
pub const FIM_MID: Token = 6;

const VOCAB: usize = 1024;

type NextFn = dyn Fn(&[Token]) -> Token + Send;

/// Scripted in-memory backend.
pub struct MockBackend {
    n_ctx: usize,
    n_ctx_train: usize,
    n_embd: usize,
    add_bos: bool,
    has_encoder: bool,
    fim_tokens: bool,
    /// Produces the "model's" next token from a sequence history.
    next_fn: Box<NextFn>,
    /// Pending scripted decode failures (KV-full simulation).
    fail_decodes: usize,
    /// Sleep per decode call, for tests that need to race the scheduler.
    decode_delay: Option<std::time::Duration>,

    kv: HashMap<SeqId, BTreeMap<Pos, Token>>,
    last_rows: Vec<Option<Vec<f32>>>,
    last_embeddings: HashMap<SeqId, Vec<f32>>,
    /// Decode call counter, for assertions on batching behavior.
    pub n_decode_calls: Arc<Mutex<usize>>,
    lora: Vec<LoraAdapter>,
}

impl MockBackend {
    pub fn new(n_ctx: usize) -> Self {
        Self {
            n_ctx,
            n_ctx_train: n_ctx,
            n_embd: 4,
            add_bos: true,
            has_encoder: false,
            fim_tokens: true,
            // default script: next token cycles the alphabet
            next_fn: Box::new(|history| {
                let last = history.last().copied().unwrap_or(BOS);
                if (b'a' as Token..=b'z' as Token).contains(&last) {
                    if last == b'z' as Token {
                        b'a' as Token
                    } else {
                        last + 1
                    }
                } else {
                    b'a' as Token
                }
            }),
            fail_decodes: 0,
            decode_delay: None,
            kv: HashMap::new(),
            last_rows: Vec::new(),
            last_embeddings: HashMap::new(),
            n_decode_calls: Arc::new(Mutex::new(0)),
            lora: vec![LoraAdapter {
                id: 0,
                path: "adapters/base.gguf".into(),
                scale: 0.0,
            }],
        }
    }

    pub fn with_next_fn(mut self, f: impl Fn(&[Token]) -> Token + Send + 'static) -> Self {
        self.next_fn = Box::new(f);
        self
    }

    /// Emit `text` then EOS, regardless of the prompt.
    pub fn with_script(self, prompt_len: usize, text: &str) -> Self {
        let scripted: Vec<Token> = text.chars().map(|c| c as Token).collect();
        self.with_next_fn(move |history| {
            let generated = history.len().saturating_sub(prompt_len);
            scripted.get(generated).copied().unwrap_or(EOS)
        })
    }

    pub fn with_fail_decodes(mut self, n: usize) -> Self {
        self.fail_decodes = n;
        self
    }

    pub fn with_decode_delay(mut self, delay: std::time::Duration) -> Self {
        self.decode_delay = Some(delay);
        self
    }

    pub fn with_ctx_train(mut self, n: usize) -> Self {
        self.n_ctx_train = n;
        self
    }

    pub fn with_encoder(mut self, has_encoder: bool) -> Self {
        self.has_encoder = has_encoder;
        self
    }

    pub fn without_fim(mut self) -> Self {
        self.fim_tokens = false;
        self
    }

    /// Sequence contents ordered by position, for invariant checks.
    pub fn seq_tokens(&self, seq_id: SeqId) -> Vec<Token> {
        self.kv
            .get(&seq_id)
            .map(|m| m.values().copied().collect())
            .unwrap_or_default()
    }

    fn history_up_to(&self, seq_id: SeqId, pos: Pos) -> Vec<Token> {
        self.kv
            .get(&seq_id)
            .map(|m| {
                m.range(..=pos)
                    .map(|(_, &t)| t)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn one_hot(&self, winner: Token) -> Vec<f32> {
        let mut row = vec![0.0f32; VOCAB];
        if (winner as usize) < VOCAB {
            row[winner as usize] = 100.0;
        }
        row
    }
}

impl ModelBackend for MockBackend {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn n_ctx_train(&self) -> usize {
        self.n_ctx_train
    }

    fn n_embd(&self) -> usize {
        self.n_embd
    }

    fn n_vocab(&self) -> usize {
        VOCAB
    }

    fn has_encoder(&self) -> bool {
        self.has_encoder
    }

    fn add_bos(&self) -> bool {
        self.add_bos
    }

    fn decode(&mut self, batch: BatchView<'_>, embeddings: bool) -> Result<(), DecodeError> {
        *self.n_decode_calls.lock().expect("decode counter") += 1;

        if let Some(delay) = self.decode_delay {
            std::thread::sleep(delay);
        }
        if self.fail_decodes > 0 {
            self.fail_decodes -= 1;
            return Err(DecodeError::NoKvSlot);
        }
        if self.kv_used_cells() + batch.len() > self.n_ctx {
            return Err(DecodeError::NoKvSlot);
        }

        for i in 0..batch.len() {
            self.kv
                .entry(batch.seq_ids[i])
                .or_default()
                .insert(batch.pos[i], batch.tokens[i]);
        }

        self.last_rows = vec![None; batch.len()];
        if embeddings {
            for i in 0..batch.len() {
                let seq = batch.seq_ids[i];
                let tokens = self.seq_tokens(seq);
                let sum: i64 = tokens.iter().map(|&t| i64::from(t)).sum();
                let mut embedding = vec![0.0f32; self.n_embd];
                embedding[0] = sum as f32;
                embedding[1] = tokens.len() as f32;
                embedding[2] = tokens.last().copied().unwrap_or(0) as f32;
                embedding[3] = 1.0;
                self.last_embeddings.insert(seq, embedding);
            }
        } else {
            for i in 0..batch.len() {
                if batch.logits[i] {
                    let history = self.history_up_to(batch.seq_ids[i], batch.pos[i]);
                    let winner = (self.next_fn)(&history);
                    self.last_rows[i] = Some(self.one_hot(winner));
                }
            }
        }
        Ok(())
    }

    fn logits(&self, i: usize) -> Vec<f32> {
        self.last_rows
            .get(i)
            .and_then(|r| r.clone())
            .unwrap_or_else(|| vec![0.0; VOCAB])
    }

    fn embedding(&self, seq_id: SeqId) -> Option<Vec<f32>> {
        self.last_embeddings.get(&seq_id).cloned()
    }

    fn kv_clear(&mut self) {
        self.kv.clear();
    }

    fn kv_seq_rm(&mut self, seq_id: SeqId, p0: Pos, p1: Pos) -> bool {
        let p1 = if p1 < 0 { Pos::MAX } else { p1 };
        if seq_id < 0 {
            for map in self.kv.values_mut() {
                map.retain(|&pos, _| pos < p0 || pos >= p1);
            }
            return true;
        }
        if let Some(map) = self.kv.get_mut(&seq_id) {
            map.retain(|&pos, _| pos < p0 || pos >= p1);
        }
        true
    }

    fn kv_seq_add(&mut self, seq_id: SeqId, p0: Pos, p1: Pos, delta: Pos) {
        let p1 = if p1 < 0 { Pos::MAX } else { p1 };
        if let Some(map) = self.kv.get_mut(&seq_id) {
            let moved: Vec<(Pos, Token)> = map
                .range(p0..p1)
                .map(|(&pos, &t)| (pos, t))
                .collect();
            for (pos, _) in &moved {
                map.remove(pos);
            }
            for (pos, t) in moved {
                let new_pos = pos + delta;
                if new_pos >= 0 {
                    map.insert(new_pos, t);
                }
            }
        }
    }

    fn kv_seq_div(&mut self, seq_id: SeqId, p0: Pos, p1: Pos, d: i32) {
        let p1 = if p1 < 0 { Pos::MAX } else { p1 };
        if d <= 1 {
            return;
        }
        if let Some(map) = self.kv.get_mut(&seq_id) {
            let moved: Vec<(Pos, Token)> = map
                .range(p0..p1)
                .map(|(&pos, &t)| (pos, t))
                .collect();
            for (pos, _) in &moved {
                map.remove(pos);
            }
            for (pos, t) in moved {
                map.insert(pos / d, t);
            }
        }
    }

    fn kv_seq_cp(&mut self, src: SeqId, dst: SeqId, p0: Pos, p1: Pos) {
        let p1 = if p1 < 0 { Pos::MAX } else { p1 };
        let copied: Vec<(Pos, Token)> = self
            .kv
            .get(&src)
            .map(|m| m.range(p0..p1).map(|(&pos, &t)| (pos, t)).collect())
            .unwrap_or_default();
        let target = self.kv.entry(dst).or_default();
        for (pos, t) in copied {
            target.insert(pos, t);
        }
    }

    fn kv_used_cells(&self) -> usize {
        self.kv.values().map(BTreeMap::len).sum()
    }

    fn tokenize(&self, text: &str, add_special: bool, _parse_special: bool) -> Vec<Token> {
        let mut out = Vec::new();
        if add_special && self.add_bos {
            out.push(BOS);
        }
        out.extend(text.chars().map(|c| c as Token));
        out
    }

    fn token_piece(&self, token: Token) -> Vec<u8> {
        match token {
            BOS | EOS | SEP | FIM_PRE | FIM_SUF | FIM_MID => Vec::new(),
            t => char::from_u32(t as u32)
                .map(|c| c.to_string().into_bytes())
                .unwrap_or_default(),
        }
    }

    fn token_is_eog(&self, token: Token) -> bool {
        token == EOS
    }

    fn token_bos(&self) -> Token {
        BOS
    }

    fn token_eos(&self) -> Token {
        EOS
    }

    fn token_sep(&self) -> Token {
        SEP
    }

    fn token_fim_prefix(&self) -> Option<Token> {
        self.fim_tokens.then_some(FIM_PRE)
    }

    fn token_fim_suffix(&self) -> Option<Token> {
        self.fim_tokens.then_some(FIM_SUF)
    }

    fn token_fim_middle(&self) -> Option<Token> {
        self.fim_tokens.then_some(FIM_MID)
    }

    fn new_sampler(&self, spec: &SamplerSpec) -> Result<Box<dyn Sampler>, EngineError> {
        if !spec.grammar.is_empty() && !spec.grammar.trim_start().starts_with("root") {
            return Err(EngineError::InvalidGrammar(format!(
                "no root rule in grammar: {}",
                spec.grammar
            )));
        }
        Ok(Box::new(ChainSampler::new(spec.clone(), None)))
    }

    fn json_schema_to_grammar(&self, _schema: &serde_json::Value) -> Result<String, EngineError> {
        Ok("root ::= object".into())
    }

    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<String, EngineError> {
        let mut out = String::new();
        for m in messages {
            out.push_str(&format!("<|{}|>{}\n", m.role, m.content));
        }
        out.push_str("<|assistant|>");
        Ok(out)
    }

    fn chat_template_name(&self) -> Option<String> {
        Some("mock".into())
    }

    fn seq_save_file(
        &mut self,
        seq_id: SeqId,
        path: &Path,
        tokens: &[Token],
    ) -> Result<u64, EngineError> {
        let mut bytes = Vec::with_capacity(4 + tokens.len() * 4);
        bytes.extend((tokens.len() as u32).to_le_bytes());
        for &t in tokens {
            bytes.extend(t.to_le_bytes());
        }
        std::fs::write(path, &bytes)
            .map_err(|e| EngineError::Server(format!("slot save failed: {e}")))?;
        let _ = seq_id;
        Ok(bytes.len() as u64)
    }

    fn seq_load_file(
        &mut self,
        seq_id: SeqId,
        path: &Path,
    ) -> Result<(u64, Vec<Token>), EngineError> {
        let bytes = std::fs::read(path)
            .map_err(|e| EngineError::Server(format!("slot restore failed: {e}")))?;
        if bytes.len() < 4 {
            return Ok((0, Vec::new()));
        }
        let count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if bytes.len() < 4 + count * 4 {
            return Ok((0, Vec::new()));
        }
        let mut tokens = Vec::with_capacity(count);
        for i in 0..count {
            let at = 4 + i * 4;
            tokens.push(Token::from_le_bytes([
                bytes[at],
                bytes[at + 1],
                bytes[at + 2],
                bytes[at + 3],
            ]));
        }
        let map = self.kv.entry(seq_id).or_default();
        map.clear();
        for (pos, &t) in tokens.iter().enumerate() {
            map.insert(pos as Pos, t);
        }
        Ok((bytes.len() as u64, tokens))
    }

    fn lora_list(&self) -> Vec<LoraAdapter> {
        self.lora.clone()
    }

    fn lora_set_scales(&mut self, scales: &[(usize, f32)]) -> Result<(), EngineError> {
        for &(id, scale) in scales {
            match self.lora.iter_mut().find(|a| a.id == id) {
                Some(adapter) => adapter.scale = scale,
                None => return Err(EngineError::NotFound(format!("lora adapter {id}"))),
            }
        }
        Ok(())
    }

    fn model_name(&self) -> String {
        "mock".into()
    }
}

/// Decode a char-token sequence back into text, for test assertions.
pub fn text_of(tokens: &[Token]) -> String {
    tokens
        .iter()
        .filter_map(|&t| {
            if t > FIM_MID {
                char::from_u32(t as u32)
            } else {
                None
            }
        })
        .collect()
}
