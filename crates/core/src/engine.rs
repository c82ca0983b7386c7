//! The scheduler loop.
//!
//! A single dedicated thread owns the model backend, the slot pool and the
//! shared KV cache. Each iteration drains the task queue, advances every
//! active slot, composes one joint forward batch (contiguous prompt chunks
//! plus one generation token per slot), decodes it in `n_batch`-sized
//! views, samples per slot, runs the optional speculative step and pushes
//! results to the result queue.
//!
//! HTTP handlers never touch any of this state; they talk to the loop
//! exclusively through [`EngineHandle`].

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::EngineParams;
use crate::error::{EngineError, ErrorCode};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::model::{common_prefix_len, DecodeError, ModelBackend, Pos, Token, TokenBatch};
use crate::prompt;
use crate::queue::{RecvError, ResultQueue, TaskQueue};
use crate::slot::{Slot, SlotParams, SlotState};
use crate::speculative::DraftModel;
use crate::stop::ends_with_incomplete_utf8;
use crate::task::{
    CompletionKind, CompletionOutput, CompletionRequestData, EmbeddingOutput, RerankOutput,
    ResultData, SlotAction, SlotIoOutput, Task, TaskId, TaskKind, TaskResult, Timings, TokenProbs,
};

/// Producer-side handle: post tasks, wait for results.
#[derive(Clone)]
pub struct EngineHandle {
    pub queue: Arc<TaskQueue>,
    pub results: Arc<ResultQueue>,
}

impl EngineHandle {
    /// Submit one completion-family request. Registers the result waiter
    /// before posting so no result can slip through.
    pub fn submit(&self, data: CompletionRequestData) -> TaskId {
        let id = self.queue.get_new_id();
        self.results.add_waiter(id);
        self.queue
            .post(Task::with_id(id, TaskKind::Completion(Box::new(data))), false);
        id
    }

    /// Submit a batch of requests atomically, preserving order.
    pub fn submit_many(&self, requests: Vec<CompletionRequestData>) -> Vec<TaskId> {
        let tasks: Vec<Task> = requests
            .into_iter()
            .map(|data| {
                let id = self.queue.get_new_id();
                Task::with_id(id, TaskKind::Completion(Box::new(data)))
            })
            .collect();
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        self.results.add_waiters(&ids);
        self.queue.post_many(tasks, false);
        ids
    }

    /// Cancel a running or queued task. Jumps the queue.
    pub fn cancel(&self, id_target: TaskId) {
        self.queue
            .post(Task::new(TaskKind::Cancel { id_target }), true);
    }

    /// Request a metrics snapshot. Jumps the queue.
    pub fn metrics(&self, reset_bucket: bool) -> TaskId {
        let id = self.queue.get_new_id();
        self.results.add_waiter(id);
        self.queue
            .post(Task::with_id(id, TaskKind::Metrics { reset_bucket }), true);
        id
    }

    pub fn slot_io(&self, slot_id: usize, action: SlotAction, filename: String) -> TaskId {
        let id = self.queue.get_new_id();
        self.results.add_waiter(id);
        self.queue.post(
            Task::with_id(
                id,
                TaskKind::SlotIo {
                    slot_id,
                    action,
                    filename,
                },
            ),
            false,
        );
        id
    }

    pub fn set_lora(&self, scales: Vec<(usize, f32)>) -> TaskId {
        let id = self.queue.get_new_id();
        self.results.add_waiter(id);
        self.queue
            .post(Task::with_id(id, TaskKind::SetLora { scales }), false);
        id
    }

    pub fn recv(&self, ids: &[TaskId]) -> Result<TaskResult, RecvError> {
        self.results.recv(ids)
    }

    pub fn remove_waiter(&self, id: TaskId) {
        self.results.remove_waiter(id);
    }

    pub fn remove_waiters(&self, ids: &[TaskId]) {
        self.results.remove_waiters(ids);
    }

    /// Stop the scheduler loop once the queue drains.
    pub fn terminate(&self) {
        self.queue.terminate();
        self.results.terminate();
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────

pub struct Engine<B: ModelBackend> {
    backend: B,
    params: EngineParams,
    queue: Arc<TaskQueue>,
    results: Arc<ResultQueue>,
    slots: Vec<Slot>,
    batch: TokenBatch,
    metrics: Metrics,
    draft: Option<Box<dyn DraftModel>>,

    system_tokens: Vec<Token>,
    system_pending: Option<String>,
    /// One-shot guard: scrub the KV on the first all-idle iteration, then
    /// leave it alone so cached prefixes survive idle periods.
    clean_kv_cache: bool,
    t_start: Instant,
}

impl<B: ModelBackend> Engine<B> {
    pub fn new(
        backend: B,
        params: EngineParams,
        queue: Arc<TaskQueue>,
        results: Arc<ResultQueue>,
    ) -> Self {
        let n_ctx_slot = params.n_ctx_slot(backend.n_ctx());
        let mut slots = Vec::with_capacity(params.n_slots);
        for id in 0..params.n_slots {
            let mut slot = Slot::new(id, n_ctx_slot);
            slot.ga_n = params.grp_attn_n;
            slot.ga_w = params.grp_attn_w;
            slots.push(slot);
        }
        info!(
            n_slots = params.n_slots,
            n_ctx_slot,
            n_batch = params.n_batch,
            "slot pool initialized"
        );
        Self {
            system_pending: params.system_prompt.clone(),
            backend,
            params,
            queue,
            results,
            slots,
            batch: TokenBatch::default(),
            metrics: Metrics::default(),
            draft: None,
            system_tokens: Vec::new(),
            clean_kv_cache: true,
            t_start: Instant::now(),
        }
    }

    pub fn with_draft(mut self, draft: Box<dyn DraftModel>) -> Self {
        self.draft = Some(draft);
        self
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            queue: Arc::clone(&self.queue),
            results: Arc::clone(&self.results),
        }
    }

    /// Run until the task queue is terminated and drained.
    pub fn run(&mut self) {
        info!("scheduler loop started");
        loop {
            while let Some(task) = self.queue.pop() {
                self.process_task(task);
            }
            if self.queue.is_terminated() {
                break;
            }

            self.update_slots();

            let all_idle = self.slots.iter().all(Slot::is_idle);
            if all_idle && self.queue.n_pending() == 0 {
                if !self.queue.wait_nonempty_or_terminated() {
                    break;
                }
            }
        }
        self.results.terminate();
        info!("scheduler loop stopped");
    }

    fn now_us(&self) -> i64 {
        self.t_start.elapsed().as_micros() as i64
    }

    // ─── Task dispatch ────────────────────────────────────────────────────

    fn process_task(&mut self, task: Task) {
        match task.kind {
            TaskKind::Completion(data) => self.handle_completion(task.id, *data),
            TaskKind::Cancel { id_target } => self.handle_cancel(id_target),
            TaskKind::NextResponse => {}
            TaskKind::Metrics { reset_bucket } => {
                let snapshot = self.snapshot();
                self.results
                    .send(TaskResult::finished(task.id, ResultData::Metrics(Box::new(snapshot))));
                if reset_bucket {
                    self.metrics.reset_bucket();
                }
            }
            TaskKind::SlotIo {
                slot_id,
                action,
                filename,
            } => self.handle_slot_io(task.id, slot_id, action, filename),
            TaskKind::SetLora { scales } => match self.backend.lora_set_scales(&scales) {
                Ok(()) => self
                    .results
                    .send(TaskResult::finished(task.id, ResultData::Ok)),
                Err(e) => self
                    .results
                    .send(TaskResult::error(task.id, e.code(), e.to_string())),
            },
        }
    }

    fn handle_completion(&mut self, id_task: TaskId, data: CompletionRequestData) {
        match data.kind {
            CompletionKind::Embedding if !self.params.embeddings => {
                self.results.send(TaskResult::error(
                    id_task,
                    ErrorCode::NotSupported,
                    "server is not started in embedding mode",
                ));
                return;
            }
            CompletionKind::Rerank if !self.params.reranking => {
                self.results.send(TaskResult::error(
                    id_task,
                    ErrorCode::NotSupported,
                    "server is not started in reranking mode",
                ));
                return;
            }
            _ => {}
        }

        let slot_index = match data.id_slot {
            Some(requested) => {
                if requested >= self.slots.len() {
                    self.results.send(TaskResult::error(
                        id_task,
                        ErrorCode::InvalidRequest,
                        format!("no slot with id {requested}"),
                    ));
                    return;
                }
                if self.slots[requested].is_processing() {
                    debug!(task = id_task, slot = requested, "requested slot busy, deferring");
                    self.queue
                        .defer(Task::with_id(id_task, TaskKind::Completion(Box::new(data))));
                    return;
                }
                requested
            }
            None => match self.select_slot(&data) {
                Some(index) => index,
                None => {
                    debug!(task = id_task, "no idle slot, deferring");
                    self.queue
                        .defer(Task::with_id(id_task, TaskKind::Completion(Box::new(data))));
                    return;
                }
            },
        };

        if let Err(e) = self.launch_slot(slot_index, id_task, data) {
            warn!(task = id_task, slot = slot_index, error = %e, "launch rejected");
            self.results
                .send(TaskResult::error(id_task, e.code(), e.to_string()));
        }
    }

    /// Pick an idle slot: longest-common-prefix similarity first, LRU
    /// otherwise.
    fn select_slot(&self, data: &CompletionRequestData) -> Option<usize> {
        if self.params.slot_prompt_similarity > 0.0 {
            if let Some(text) = data.prompt.as_text() {
                if !text.is_empty() {
                    let mut best: Option<(usize, usize)> = None;
                    for slot in &self.slots {
                        if !slot.is_idle() || slot.prompt_string.is_empty() {
                            continue;
                        }
                        let lcp = slot
                            .prompt_string
                            .bytes()
                            .zip(text.bytes())
                            .take_while(|(a, b)| a == b)
                            .count();
                        let similarity = lcp as f32 / slot.prompt_string.len() as f32;
                        if similarity > self.params.slot_prompt_similarity
                            && best.map_or(true, |(_, l)| lcp > l)
                        {
                            best = Some((slot.id, lcp));
                        }
                    }
                    if let Some((index, lcp)) = best {
                        debug!(slot = index, lcp, "slot selected by prompt similarity");
                        return Some(index);
                    }
                }
            }
        }

        self.slots
            .iter()
            .filter(|s| s.is_idle())
            .min_by_key(|s| s.t_last_used)
            .map(|s| s.id)
    }

    fn launch_slot(
        &mut self,
        index: usize,
        id_task: TaskId,
        data: CompletionRequestData,
    ) -> Result<(), EngineError> {
        let defaults = self.params.defaults.clone();

        let mut sampling = data.sampling.clone();
        if sampling.json_schema.is_some() && sampling.grammar.is_some() {
            return Err(EngineError::InvalidRequest(
                "either \"json_schema\" or \"grammar\" can be specified, but not both".into(),
            ));
        }
        if let Some(schema) = sampling.json_schema.take() {
            sampling.grammar = Some(self.backend.json_schema_to_grammar(&schema)?);
        }
        let mut spec = sampling.apply(&defaults.sampling);
        if spec.ignore_eos {
            spec.logit_bias
                .push((self.backend.token_eos(), f32::NEG_INFINITY));
        }
        let sampler = self.backend.new_sampler(&spec)?;

        let mut n_predict = data.n_predict.unwrap_or(defaults.n_predict);
        if self.params.n_predict >= 0 && (n_predict < 0 || n_predict > self.params.n_predict) {
            debug!(
                task = id_task,
                n_predict, cap = self.params.n_predict, "n_predict clamped to server limit"
            );
            n_predict = self.params.n_predict;
        }

        let slot = &mut self.slots[index];
        slot.reset();
        slot.id_task = id_task;
        slot.kind = data.kind;
        slot.index = data.index;
        // Self-extend remaps KV positions in place, which invalidates any
        // cached prefix comparison.
        let cache_prompt = data.cache_prompt && slot.ga_n == 1;
        slot.params = SlotParams {
            stream: data.stream,
            cache_prompt,
            n_predict,
            n_keep: data.n_keep.unwrap_or(defaults.n_keep),
            n_discard: data.n_discard.unwrap_or(defaults.n_discard),
            antiprompt: if data.stop.is_empty() {
                defaults.antiprompt.clone()
            } else {
                data.stop.clone()
            },
            input_prefix: data.input_prefix.clone(),
            input_suffix: data.input_suffix.clone(),
            sampling: spec,
            speculative: data.speculative.apply(&defaults.speculative),
        };
        slot.sampler = Some(sampler);
        slot.prompt_string = data.prompt.as_text().unwrap_or_default().to_string();
        slot.request = Some(data);
        slot.state = SlotState::ProcessingPrompt;
        slot.has_next_token = true;

        debug!(task = id_task, slot = index, "task launched");
        Ok(())
    }

    fn handle_cancel(&mut self, id_target: TaskId) {
        // The synthetic result is sent while the waiter is still registered;
        // anything the slot emits afterwards has no waiter and is dropped.
        self.results
            .send(TaskResult::finished(id_target, ResultData::Cancelled));
        if let Some(index) = self.slots.iter().position(|s| s.id_task == id_target) {
            debug!(task = id_target, slot = index, "task cancelled");
            self.release_slot(index);
        }
    }

    fn handle_slot_io(&mut self, id_task: TaskId, slot_id: usize, action: SlotAction, filename: String) {
        let base = match &self.params.slot_save_path {
            Some(path) => path.clone(),
            None => {
                self.results.send(TaskResult::error(
                    id_task,
                    ErrorCode::NotSupported,
                    "slot save path is not configured",
                ));
                return;
            }
        };
        if slot_id >= self.slots.len() {
            self.results.send(TaskResult::error(
                id_task,
                ErrorCode::InvalidRequest,
                format!("no slot with id {slot_id}"),
            ));
            return;
        }
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            self.results.send(TaskResult::error(
                id_task,
                ErrorCode::InvalidRequest,
                "invalid filename",
            ));
            return;
        }
        if self.slots[slot_id].is_processing() {
            debug!(task = id_task, slot = slot_id, "slot busy, deferring slot io");
            self.queue.defer(Task::with_id(
                id_task,
                TaskKind::SlotIo {
                    slot_id,
                    action,
                    filename,
                },
            ));
            return;
        }

        let seq_id = self.slots[slot_id].seq_id();
        let path = base.join(&filename);
        let t0 = Instant::now();
        let outcome: Result<(usize, u64), EngineError> = match action {
            SlotAction::Save => {
                let tokens = self.slots[slot_id].cache_tokens.clone();
                self.backend
                    .seq_save_file(seq_id, &path, &tokens)
                    .map(|bytes| (tokens.len(), bytes))
            }
            SlotAction::Restore => match self.backend.seq_load_file(seq_id, &path) {
                Ok((0, _)) => Err(EngineError::InvalidRequest(
                    "unable to restore slot, no available space in KV cache or invalid slot save file"
                        .into(),
                )),
                Ok((bytes, tokens)) => {
                    let slot = &mut self.slots[slot_id];
                    slot.cache_tokens = tokens;
                    slot.n_past = slot.cache_tokens.len();
                    Ok((slot.n_past, bytes))
                }
                Err(e) => Err(e),
            },
            SlotAction::Erase => {
                self.backend.kv_seq_rm(seq_id, -1, -1);
                let slot = &mut self.slots[slot_id];
                let n_erased = slot.cache_tokens.len();
                slot.cache_tokens.clear();
                slot.n_past = 0;
                Ok((n_erased, 0))
            }
        };

        match outcome {
            Ok((n_tokens, n_bytes)) => self.results.send(TaskResult::finished(
                id_task,
                ResultData::SlotIo(SlotIoOutput {
                    slot_id,
                    filename,
                    n_tokens,
                    n_bytes,
                    t_ms: t0.elapsed().as_secs_f64() * 1e3,
                }),
            )),
            Err(e) => self
                .results
                .send(TaskResult::error(id_task, e.code(), e.to_string())),
        }
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let m = &self.metrics;
        MetricsSnapshot {
            n_prompt_tokens_processed_total: m.n_prompt_tokens_processed_total,
            t_prompt_processing_total_ms: m.t_prompt_processing_total_ms,
            n_tokens_predicted_total: m.n_tokens_predicted_total,
            t_tokens_generation_total_ms: m.t_tokens_generation_total_ms,
            n_decode_total: m.n_decode_total,
            n_busy_slots_total: m.n_busy_slots_total,
            n_prompt_tokens_processed: m.n_prompt_tokens_processed,
            t_prompt_processing_ms: m.t_prompt_processing_ms,
            n_tokens_predicted: m.n_tokens_predicted,
            t_tokens_generation_ms: m.t_tokens_generation_ms,
            kv_cache_used_cells: self.backend.kv_used_cells(),
            kv_cache_total_cells: self.backend.n_ctx(),
            kv_cache_tokens: self.system_tokens.len()
                + self.slots.iter().map(|s| s.cache_tokens.len()).sum::<usize>(),
            n_slots_idle: self.slots.iter().filter(|s| s.is_idle()).count(),
            n_slots_processing: self.slots.iter().filter(|s| s.is_processing()).count(),
            n_tasks_deferred: self.queue.n_deferred(),
            slots: self.slots.iter().map(Slot::view).collect(),
            lora: self.backend.lora_list(),
        }
    }

    // ─── Slot lifecycle ───────────────────────────────────────────────────

    fn release_slot(&mut self, index: usize) {
        let t_last_used = self.now_us();
        let slot = &mut self.slots[index];
        if !slot.is_processing() {
            return;
        }
        if let Some(t0) = slot.t_start_generation {
            slot.t_token_generation_ms = t0.elapsed().as_secs_f64() * 1e3;
        }
        slot.t_last_used = t_last_used;
        slot.state = SlotState::Idle;
        slot.id_task = crate::task::NO_TASK;
        slot.request = None;
        slot.i_batch = None;
        // exactly one deferred task gets another chance per release
        self.queue.pop_deferred();
    }

    fn send_error_for_slot(&mut self, index: usize, code: ErrorCode, message: impl Into<String>) {
        let id_task = self.slots[index].id_task;
        self.results
            .send(TaskResult::error(id_task, code, message));
    }

    fn completion_output(&self, index: usize, content: String, is_final: bool) -> CompletionOutput {
        let slot = &self.slots[index];
        CompletionOutput {
            content,
            index: slot.index,
            slot_id: slot.id,
            tokens_predicted: slot.n_decoded,
            tokens_evaluated: slot.n_prompt_tokens,
            tokens_cached: slot.n_past,
            prompt_n: slot.n_prompt_tokens_processed,
            truncated: slot.truncated,
            stopped_eos: slot.stopped_eos,
            stopped_word: slot.stopped_word,
            stopped_limit: slot.stopped_limit,
            stopping_word: slot.stopping_word.clone(),
            seed: slot.sampler.as_ref().map_or(0, |s| s.seed()),
            probs: if is_final {
                slot.generated_probs.clone()
            } else {
                Vec::new()
            },
            timings: is_final.then(|| Timings {
                prompt_n: slot.n_prompt_tokens_processed,
                prompt_ms: slot.t_prompt_processing_ms,
                prompt_per_second: per_second(slot.n_prompt_tokens_processed, slot.t_prompt_processing_ms),
                predicted_n: slot.n_decoded,
                predicted_ms: slot.t_token_generation_ms,
                predicted_per_second: per_second(slot.n_decoded, slot.t_token_generation_ms),
            }),
        }
    }

    fn send_partial_response(&mut self, index: usize, content: String, probs: Option<TokenProbs>) {
        let id_task = self.slots[index].id_task;
        let mut output = self.completion_output(index, content, false);
        if let Some(p) = probs {
            output.probs.push(p);
        }
        self.results
            .send(TaskResult::partial(id_task, ResultData::Completion(output)));
    }

    fn send_final_response(&mut self, index: usize) {
        let slot = &self.slots[index];
        let id_task = slot.id_task;
        let content = if slot.params.stream {
            String::new()
        } else {
            slot.generated_text.clone()
        };
        if let Some(t0) = self.slots[index].t_start_generation {
            self.slots[index].t_token_generation_ms = t0.elapsed().as_secs_f64() * 1e3;
        }
        let output = self.completion_output(index, content, true);
        debug!(
            task = id_task,
            slot = index,
            tokens_predicted = output.tokens_predicted,
            prompt_ms = output.timings.as_ref().map(|t| t.prompt_ms),
            predicted_ms = output.timings.as_ref().map(|t| t.predicted_ms),
            "request finished"
        );
        self.results
            .send(TaskResult::finished(id_task, ResultData::Completion(output)));
    }

    fn send_embedding(&mut self, index: usize) {
        let slot = &self.slots[index];
        let id_task = slot.id_task;
        let sub_index = slot.index;
        match self.backend.embedding(slot.seq_id()) {
            Some(mut embedding) => {
                normalize_l2(&mut embedding);
                self.results.send(TaskResult::finished(
                    id_task,
                    ResultData::Embedding(EmbeddingOutput {
                        index: sub_index,
                        embedding,
                    }),
                ));
            }
            None => {
                self.results.send(TaskResult::error(
                    id_task,
                    ErrorCode::Server,
                    "failed to get embeddings",
                ));
            }
        }
    }

    fn send_rerank(&mut self, index: usize) {
        let slot = &self.slots[index];
        let id_task = slot.id_task;
        let sub_index = slot.index;
        match self.backend.embedding(slot.seq_id()) {
            Some(embedding) => {
                // rank pooling leaves the relevance logit in component 0
                let score = embedding.first().copied().unwrap_or(-1e6);
                self.results.send(TaskResult::finished(
                    id_task,
                    ResultData::Rerank(RerankOutput {
                        index: sub_index,
                        score,
                    }),
                ));
            }
            None => {
                self.results.send(TaskResult::error(
                    id_task,
                    ErrorCode::Server,
                    "failed to get reranking score",
                ));
            }
        }
    }

    // ─── System prompt ────────────────────────────────────────────────────

    fn apply_system_prompt(&mut self, text: &str) {
        info!(len = text.len(), "updating system prompt");
        self.backend.kv_clear();
        self.clean_kv_cache = false;
        self.system_tokens.clear();

        if text.is_empty() {
            return;
        }
        self.system_tokens = self.backend.tokenize(text, true, true);

        let mut batch = TokenBatch::with_capacity(self.system_tokens.len());
        for (pos, &token) in self.system_tokens.iter().enumerate() {
            batch.add(token, pos as Pos, 0, false);
        }

        let n_batch = self.params.n_batch;
        let mut i = 0;
        while i < batch.len() {
            let n = n_batch.min(batch.len() - i);
            if let Err(e) = self.backend.decode(batch.view(i, n), false) {
                error!(error = %e, "system prompt decode failed");
                self.system_tokens.clear();
                return;
            }
            i += n;
        }

        // broadcast the shared prefix to every slot sequence
        for slot in &self.slots {
            self.backend.kv_seq_cp(0, slot.seq_id(), -1, -1);
        }
    }

    // ─── The iteration ────────────────────────────────────────────────────

    fn update_slots(&mut self) {
        if let Some(text) = self.system_pending.take() {
            self.apply_system_prompt(&text);
        }

        // all-idle fast path: nothing to schedule, scrub the cache once
        if self.slots.iter().all(Slot::is_idle) {
            if self.system_tokens.is_empty() && self.clean_kv_cache {
                self.backend.kv_clear();
                self.clean_kv_cache = false;
            }
            return;
        }

        // wake anything polling for "something happened"
        self.queue.post(Task::new(TaskKind::NextResponse), false);

        self.apply_context_shifts();

        // one generation token per decoding slot
        self.batch.clear();
        let system_len = self.system_tokens.len() as Pos;
        let mut batch_is_embedding: Option<bool> = None;

        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            if slot.state != SlotState::Generating {
                continue;
            }
            slot.i_batch = Some(self.batch.len());
            let slot_npast = if slot.n_past_se > 0 {
                slot.n_past_se
            } else {
                slot.n_past as Pos
            };
            self.batch
                .add(slot.sampled, system_len + slot_npast, slot.seq_id(), true);
            slot.n_past += 1;
            if slot.params.cache_prompt {
                slot.cache_tokens.push(slot.sampled);
            }
            batch_is_embedding = Some(false);
        }

        // admit prompts while the batch has room
        if self.params.cont_batching || self.batch.is_empty() {
            for index in 0..self.slots.len() {
                if self.slots[index].state != SlotState::ProcessingPrompt {
                    continue;
                }
                let is_embedding = matches!(
                    self.slots[index].kind,
                    CompletionKind::Embedding | CompletionKind::Rerank
                );
                // one forward pass is either embedding or decoding, never both
                if let Some(kind) = batch_is_embedding {
                    if kind != is_embedding {
                        continue;
                    }
                }
                if !self.admit_prompt(index, is_embedding) {
                    continue;
                }
                if !self.batch.is_empty() {
                    batch_is_embedding = Some(is_embedding);
                }
                if self.batch.len() >= self.params.n_batch {
                    break;
                }
            }
        }

        if self.batch.is_empty() {
            return;
        }

        let n_busy = self.slots.iter().filter(|s| s.is_processing()).count();
        let embeddings_mode = batch_is_embedding.unwrap_or(false);

        // decode in views, halving on KV pressure
        let mut n_batch = self.params.n_batch;
        let mut i = 0usize;
        while i < self.batch.len() {
            let n_tokens = n_batch.min(self.batch.len() - i);

            self.apply_group_attention(n_tokens as Pos);

            let status = self
                .backend
                .decode(self.batch.view(i, n_tokens), embeddings_mode);
            match status {
                Ok(()) => {}
                Err(DecodeError::NoKvSlot) if n_batch > 1 => {
                    // probe for free KV space with a smaller footprint
                    n_batch /= 2;
                    warn!(
                        i,
                        n_batch, "no KV slot for batch, retrying with smaller size"
                    );
                    continue;
                }
                Err(e) => {
                    error!(error = %e, i, n_batch, "decode failed, releasing all slots");
                    for index in 0..self.slots.len() {
                        if self.slots[index].is_processing() {
                            self.send_error_for_slot(
                                index,
                                ErrorCode::Server,
                                "input prompt is too big compared to KV size, increase the context size",
                            );
                            self.release_slot(index);
                        }
                    }
                    self.batch.clear();
                    return;
                }
            }
            self.metrics.on_decoded(n_busy);

            // logits rows must be captured before any speculative decode
            // replaces them
            let mut pending: Vec<(usize, Vec<f32>)> = Vec::new();
            for index in 0..self.slots.len() {
                let slot = &self.slots[index];
                let Some(i_batch) = slot.i_batch else { continue };
                if i_batch < i || i_batch >= i + n_tokens {
                    continue;
                }
                match slot.state {
                    SlotState::DonePrompt | SlotState::Generating => {
                        pending.push((index, self.backend.logits(i_batch - i)));
                    }
                    _ => {}
                }
            }

            for (index, logits) in pending {
                if self.slots[index].state == SlotState::DonePrompt {
                    match self.slots[index].kind {
                        CompletionKind::Embedding => {
                            self.send_embedding(index);
                            self.release_slot(index);
                            continue;
                        }
                        CompletionKind::Rerank => {
                            self.send_rerank(index);
                            self.release_slot(index);
                            continue;
                        }
                        _ => self.slots[index].state = SlotState::Generating,
                    }
                } else if self.slots[index].state != SlotState::Generating {
                    continue;
                }

                self.sample_and_advance(index, &logits);
            }

            i += n_tokens;
        }
    }

    /// Evict a middle window when a generating slot runs out of room.
    fn apply_context_shifts(&mut self) {
        let system_len = self.system_tokens.len();
        for index in 0..self.slots.len() {
            let slot = &self.slots[index];
            if slot.ga_n != 1
                || !slot.is_processing()
                || system_len + slot.n_past < slot.n_ctx.saturating_sub(1)
            {
                continue;
            }
            if !self.params.ctx_shift {
                self.send_error_for_slot(
                    index,
                    ErrorCode::Server,
                    "context limit reached and context shift is disabled",
                );
                self.release_slot(index);
                continue;
            }

            let seq_id = self.slots[index].seq_id();
            let slot = &mut self.slots[index];
            let mut n_keep = if slot.params.n_keep < 0 {
                slot.n_prompt_tokens as i32
            } else {
                slot.params.n_keep
            };
            n_keep += i32::from(self.backend.add_bos());

            let n_left = (system_len + slot.n_past) as i32 - n_keep;
            let n_discard = if slot.params.n_discard > 0 {
                slot.params.n_discard.min(n_left.max(0))
            } else {
                n_left / 2
            };
            if n_discard <= 0 {
                continue;
            }

            debug!(
                slot = index,
                n_keep, n_left, n_discard, "context shift"
            );

            self.backend
                .kv_seq_rm(seq_id, n_keep, n_keep + n_discard);
            self.backend.kv_seq_add(
                seq_id,
                n_keep + n_discard,
                (system_len + slot.n_past) as Pos,
                -n_discard,
            );

            if slot.params.cache_prompt {
                let keep = n_keep as usize;
                let discard = n_discard as usize;
                if slot.cache_tokens.len() > keep + discard {
                    slot.cache_tokens.drain(keep..keep + discard);
                } else {
                    slot.cache_tokens.truncate(keep.min(slot.cache_tokens.len()));
                }
            }

            slot.n_past -= n_discard as usize;
            slot.truncated = true;
        }
    }

    /// Prepare a prompt-phase slot and feed its tokens into the batch.
    /// Returns false when the slot was released (error or empty prompt).
    fn admit_prompt(&mut self, index: usize, is_embedding: bool) -> bool {
        let system_len = self.system_tokens.len();

        // first admission: tokenize, truncate, compute prefix reuse
        if let Some(request) = self.slots[index].request.take() {
            self.slots[index].t_start_process_prompt = Some(Instant::now());
            self.slots[index].t_start_generation = None;

            let tokens = match prompt::assemble(
                &self.backend,
                &request,
                !self.system_tokens.is_empty(),
                self.params.spm_infill,
            ) {
                Ok(tokens) => tokens,
                Err(e) => {
                    self.send_error_for_slot(index, e.code(), e.to_string());
                    self.release_slot(index);
                    return false;
                }
            };

            if tokens.is_empty() {
                debug!(slot = index, "empty prompt, returning empty response");
                self.send_final_response(index);
                self.release_slot(index);
                return false;
            }

            {
                let slot = &mut self.slots[index];
                slot.prompt_tokens = tokens;
                slot.n_prompt_tokens = slot.prompt_tokens.len();
            }

            if is_embedding {
                let n_prompt = self.slots[index].n_prompt_tokens;
                // embedding prompts cannot be split across physical batches
                if n_prompt > self.params.n_ubatch {
                    self.send_error_for_slot(
                        index,
                        ErrorCode::Server,
                        "input is too large to process, increase the physical batch size",
                    );
                    self.release_slot(index);
                    return false;
                }
                let slot = &mut self.slots[index];
                slot.n_past = 0;
                slot.cache_tokens.clear();
            } else {
                if self.slots[index].ga_n == 1
                    && self.slots[index].n_prompt_tokens >= self.slots[index].n_ctx
                {
                    if !self.params.ctx_shift {
                        self.send_error_for_slot(
                            index,
                            ErrorCode::InvalidRequest,
                            "the request exceeds the available context size, try increasing the context size or enable context shift",
                        );
                        self.release_slot(index);
                        return false;
                    }
                    self.truncate_prompt(index);
                }

                let slot = &mut self.slots[index];
                if slot.params.cache_prompt {
                    slot.n_past = common_prefix_len(&slot.cache_tokens, &slot.prompt_tokens);
                } else {
                    slot.n_past = 0;
                    slot.cache_tokens.clear();
                }

                if slot.n_past == slot.n_prompt_tokens && slot.n_past > 0 {
                    // the last prompt token must be decoded again so there
                    // are logits to sample from
                    slot.n_past -= 1;
                }

                slot.n_prompt_tokens_processed = 0;

                if slot.ga_n != 1 {
                    // rebuild the self-extend view of n_past
                    let mut ga_i: i32 = 0;
                    let mut slot_npast: i32 = 0;
                    for _ in 0..slot.n_past {
                        while slot_npast >= ga_i + slot.ga_w {
                            let bd = (slot.ga_w / slot.ga_n) * (slot.ga_n - 1);
                            slot_npast -= bd;
                            ga_i += slot.ga_w / slot.ga_n;
                        }
                        slot_npast += 1;
                    }
                    slot.n_past_se = slot_npast;
                    slot.ga_i = ga_i;
                }
            }

            // drop the stale tail from the sequence
            let seq_id = self.slots[index].seq_id();
            let p0 = (system_len + self.slots[index].n_past) as Pos;
            self.backend.kv_seq_rm(seq_id, p0, -1);
            let slot = &mut self.slots[index];
            let n_past = slot.n_past;
            slot.cache_tokens.truncate(n_past);
        }

        // feed prompt tokens while the batch has room
        let slot = &mut self.slots[index];
        let mut slot_npast = if slot.n_past_se > 0 {
            slot.n_past_se
        } else {
            slot.n_past as Pos
        };
        while slot.n_past < slot.n_prompt_tokens && self.batch.len() < self.params.n_batch {
            let token = slot.prompt_tokens[slot.n_past];
            self.batch
                .add(token, system_len as Pos + slot_npast, slot.seq_id(), false);
            if slot.params.cache_prompt {
                slot.cache_tokens.push(token);
            }
            slot.n_prompt_tokens_processed += 1;
            slot_npast += 1;
            slot.n_past += 1;
        }

        if slot.n_past == slot.n_prompt_tokens {
            // the whole prompt is in flight; ask for logits on its tail
            slot.state = SlotState::DonePrompt;
            slot.n_decoded = 0;
            self.batch.set_last_logits(true);
            slot.i_batch = Some(self.batch.len() - 1);
            debug!(
                slot = index,
                n_prompt = slot.n_prompt_tokens,
                processed = slot.n_prompt_tokens_processed,
                "prompt fully admitted"
            );
        }
        true
    }

    /// Middle-truncate an over-long prompt down to the slot context.
    fn truncate_prompt(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        let n_ctx = slot.n_ctx;
        let mut n_keep = if slot.params.n_keep < 0 {
            slot.n_prompt_tokens as i32
        } else {
            slot.params.n_keep
        };
        n_keep = n_keep.min(n_ctx as i32 - 4);
        let n_keep = n_keep.max(0) as usize;

        let n_left = n_ctx - n_keep;
        let n_block_size = n_left / 2;
        let erased_blocks =
            (slot.n_prompt_tokens - n_keep - n_block_size) / n_block_size;

        let mut new_tokens = slot.prompt_tokens[..n_keep].to_vec();
        new_tokens.extend_from_slice(&slot.prompt_tokens[n_keep + erased_blocks * n_block_size..]);

        warn!(
            slot = index,
            n_ctx,
            n_keep,
            before = slot.n_prompt_tokens,
            after = new_tokens.len(),
            "prompt truncated"
        );

        slot.prompt_tokens = new_tokens;
        slot.truncated = true;
        slot.n_prompt_tokens = slot.prompt_tokens.len();
        debug_assert!(slot.n_prompt_tokens < n_ctx);
    }

    /// Self-extend KV remap, applied before each decode view.
    fn apply_group_attention(&mut self, n_tokens: Pos) {
        for index in 0..self.slots.len() {
            if self.slots[index].ga_n == 1 {
                continue;
            }
            let seq_id = self.slots[index].seq_id();
            loop {
                let slot = &self.slots[index];
                if slot.n_past_se < slot.ga_i + slot.ga_w {
                    break;
                }
                let (ga_i, ga_n, ga_w, n_past_se) =
                    (slot.ga_i, slot.ga_n, slot.ga_w, slot.n_past_se);
                let ib = (ga_n * ga_i) / ga_w;
                let bd = (ga_w / ga_n) * (ga_n - 1);
                let dd = (ga_w / ga_n) - ib * bd - ga_w;

                self.backend.kv_seq_add(seq_id, ga_i, n_past_se, ib * bd);
                self.backend
                    .kv_seq_div(seq_id, ga_i + ib * bd, ga_i + ib * bd + ga_w, ga_n);
                self.backend
                    .kv_seq_add(seq_id, ga_i + ib * bd + ga_w, n_past_se + ib * bd, dd);

                let slot = &mut self.slots[index];
                slot.n_past_se -= bd;
                slot.ga_i += ga_w / ga_n;
            }
            self.slots[index].n_past_se += n_tokens;
        }
    }

    /// Sample one token for a generating slot, post-process it and run the
    /// optional speculative step.
    fn sample_and_advance(&mut self, index: usize, logits: &[f32]) {
        let token = {
            let slot = &mut self.slots[index];
            let sampler = slot.sampler.as_mut().expect("generating slot has sampler");
            let token = sampler.sample(logits);
            sampler.accept(token, true);
            slot.i_batch = None;
            slot.n_decoded += 1;
            slot.sampled = token;
            token
        };

        if self.slots[index].n_decoded == 1 {
            let slot = &mut self.slots[index];
            slot.t_start_generation = Some(Instant::now());
            if let Some(t0) = slot.t_start_process_prompt {
                slot.t_prompt_processing_ms = t0.elapsed().as_secs_f64() * 1e3;
            }
            let (n, ms) = (slot.n_prompt_tokens_processed, slot.t_prompt_processing_ms);
            self.metrics.on_prompt_eval(n, ms);
        }

        if !self.process_token(index, token) {
            self.finish_generation(index);
            return;
        }

        if self.slots[index].can_speculate(self.draft.is_some()) {
            self.speculate(index, token);
        }
    }

    fn finish_generation(&mut self, index: usize) {
        self.send_final_response(index);
        let slot = &self.slots[index];
        self.metrics
            .on_prediction(slot.n_decoded, slot.t_token_generation_ms);
        self.release_slot(index);
    }

    /// Post-process a produced token: text assembly, stop detection,
    /// budget checks. Returns whether generation continues.
    fn process_token(&mut self, index: usize, token: Token) -> bool {
        let piece = self.backend.token_piece(token);
        let server_n_predict = self.params.n_predict;

        let slot = &mut self.slots[index];
        slot.pending_bytes.extend_from_slice(&piece);

        let incomplete = ends_with_incomplete_utf8(&slot.pending_bytes);

        let mut to_send: Option<String> = None;
        let mut probs_entry: Option<TokenProbs> = None;
        if !incomplete {
            let flushed_len = slot.pending_bytes.len();
            let flushed = String::from_utf8_lossy(&slot.pending_bytes).into_owned();
            slot.pending_bytes.clear();
            slot.generated_text.push_str(&flushed);

            let mut pos = slot.n_sent_text.min(slot.generated_text.len());
            let test = slot.generated_text[pos..].to_string();

            let mut is_stop_full = false;
            let mut stop_pos = slot.find_stopping_strings(&test, flushed_len, true);
            if let Some(at) = stop_pos {
                is_stop_full = true;
                slot.generated_text.truncate(pos + at);
                pos = slot.n_sent_text.min(slot.generated_text.len());
            } else {
                stop_pos = slot.find_stopping_strings(&test, flushed_len, false);
            }

            let send_now = match stop_pos {
                None => true,
                Some(at) => !slot.has_next_token && !is_stop_full && at > 0,
            };
            if send_now {
                let text = slot.generated_text[pos..].to_string();
                slot.n_sent_text += text.len();
                to_send = Some(text);
            }

            if slot.params.sampling.n_probs > 0 {
                let probs = slot
                    .sampler
                    .as_ref()
                    .map(|s| s.candidates().to_vec())
                    .unwrap_or_default();
                let entry = TokenProbs {
                    token,
                    piece: flushed,
                    probs,
                };
                slot.add_token(entry.clone());
                probs_entry = Some(entry);
            }
        } else {
            slot.has_next_token = true;
        }

        // budget
        if slot.n_decoded > 0 && slot.has_next_token && !slot.has_budget(server_n_predict) {
            slot.stopped_limit = true;
            slot.has_next_token = false;
            debug!(
                slot = index,
                n_decoded = slot.n_decoded,
                "stopped by prediction limit"
            );
        }

        // slot context exhausted; without this a model that never emits EOG
        // would decode forever
        if slot.n_decoded >= slot.n_ctx {
            slot.truncated = true;
            slot.stopped_limit = true;
            slot.has_next_token = false;
            debug!(slot = index, n_ctx = slot.n_ctx, "stopped by context capacity");
        }

        // encoder-decoder models stream through a different path and keep
        // generating past the decoder EOG marker
        if !self.backend.has_encoder() && self.backend.token_is_eog(token) {
            slot.stopped_eos = true;
            slot.has_next_token = false;
        }

        let n_ctx_train = self.backend.n_ctx_train();
        if slot.params.n_predict < 1
            && server_n_predict < 1
            && slot.ga_n == 1
            && slot.n_prompt_tokens + slot.n_decoded >= n_ctx_train
        {
            warn!(
                slot = index,
                n_ctx_train,
                "n_predict is not set and self-extend is disabled, limiting to training context"
            );
            slot.truncated = true;
            slot.stopped_limit = true;
            slot.has_next_token = false;
        }

        let has_next = slot.has_next_token;
        let stream = slot.params.stream;
        if stream {
            if let Some(text) = to_send {
                self.send_partial_response(index, text, probs_entry);
            } else if !incomplete {
                self.send_partial_response(index, String::new(), probs_entry);
            }
        }
        has_next
    }

    /// One speculative step: draft, verify through the target model, commit
    /// the accepted prefix, trim the rejected KV tail.
    fn speculate(&mut self, index: usize, token: Token) {
        let spec_params = self.slots[index].params.speculative;
        let draft = {
            let slot = &self.slots[index];
            let Some(draft_model) = self.draft.as_mut() else {
                return;
            };
            draft_model.gen_draft(&spec_params, &slot.cache_tokens, token)
        };
        if draft.len() < spec_params.n_min {
            return;
        }
        let draft = if draft.len() > spec_params.n_max {
            draft[..spec_params.n_max].to_vec()
        } else {
            draft
        };

        let (seq_id, n_past) = {
            let slot = &self.slots[index];
            (slot.seq_id(), slot.n_past as Pos)
        };

        let mut spec_batch = TokenBatch::with_capacity(draft.len() + 1);
        spec_batch.add(token, n_past, seq_id, true);
        for (k, &t) in draft.iter().enumerate() {
            spec_batch.add(t, n_past + 1 + k as Pos, seq_id, true);
        }

        if let Err(e) = self
            .backend
            .decode(spec_batch.view(0, spec_batch.len()), false)
        {
            warn!(slot = index, error = %e, "speculative decode failed, skipping");
            return;
        }

        let rows: Vec<Vec<f32>> = (0..spec_batch.len())
            .map(|k| self.backend.logits(k))
            .collect();

        let accepted = {
            let slot = &mut self.slots[index];
            let sampler = slot.sampler.as_mut().expect("generating slot has sampler");
            sampler.sample_and_accept_n(&rows, &draft)
        };

        debug!(
            slot = index,
            drafted = draft.len(),
            accepted = accepted.len(),
            "speculative step"
        );

        {
            let slot = &mut self.slots[index];
            slot.n_past += accepted.len();
            slot.n_decoded += accepted.len();

            // all but the last accepted token are already decoded; the last
            // one is re-decoded next iteration so the sampler owns its state
            slot.cache_tokens.push(token);
            slot.cache_tokens
                .extend_from_slice(&accepted[..accepted.len() - 1]);
            slot.sampled = *accepted.last().expect("accepted is non-empty");
        }

        let trim_from = self.slots[index].n_past as Pos;
        self.backend.kv_seq_rm(seq_id, trim_from, -1);

        for &t in &accepted {
            if !self.process_token(index, t) {
                self.finish_generation(index);
                break;
            }
        }
    }
}

fn per_second(n: usize, ms: f64) -> f64 {
    if ms > 0.0 {
        n as f64 * 1e3 / ms
    } else {
        0.0
    }
}

fn normalize_l2(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speculative::NGramDraft;
    use crate::task::{PromptInput, PromptPart};
    use crate::testing::{MockBackend, EOS};
    use std::thread::{self, JoinHandle};

    struct TestEngine {
        handle: EngineHandle,
        thread: Option<JoinHandle<()>>,
    }

    impl TestEngine {
        fn start(backend: MockBackend, params: EngineParams) -> Self {
            Self::start_with_draft(backend, params, None)
        }

        fn start_with_draft(
            backend: MockBackend,
            params: EngineParams,
            draft: Option<Box<dyn DraftModel>>,
        ) -> Self {
            let queue = Arc::new(TaskQueue::new());
            let results = Arc::new(ResultQueue::new());
            let mut engine = Engine::new(backend, params, queue, results);
            if let Some(d) = draft {
                engine = engine.with_draft(d);
            }
            let handle = engine.handle();
            let thread = thread::spawn(move || engine.run());
            Self {
                handle,
                thread: Some(thread),
            }
        }

        /// Receive every result for a task up to and including the final one.
        fn collect(&self, id: TaskId) -> Vec<TaskResult> {
            let mut out = Vec::new();
            loop {
                let result = self.handle.recv(&[id]).expect("engine terminated early");
                let stop = result.stop;
                out.push(result);
                if stop {
                    break;
                }
            }
            self.handle.remove_waiter(id);
            out
        }

        fn run_to_completion(&self, data: CompletionRequestData) -> Vec<TaskResult> {
            let id = self.handle.submit(data);
            self.collect(id)
        }

        fn snapshot(&self) -> MetricsSnapshot {
            let id = self.handle.metrics(false);
            let results = self.collect(id);
            match &results.last().unwrap().data {
                ResultData::Metrics(snapshot) => (**snapshot).clone(),
                other => panic!("expected metrics, got {other:?}"),
            }
        }
    }

    impl Drop for TestEngine {
        fn drop(&mut self) {
            self.handle.terminate();
            if let Some(t) = self.thread.take() {
                let _ = t.join();
            }
        }
    }

    fn final_completion(results: &[TaskResult]) -> &CompletionOutput {
        let last = results.last().expect("no results");
        assert!(last.stop, "last result must be final");
        match &last.data {
            ResultData::Completion(c) => c,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    fn streamed_content(results: &[TaskResult]) -> String {
        results
            .iter()
            .filter_map(|r| match &r.data {
                ResultData::Completion(c) => Some(c.content.as_str()),
                _ => None,
            })
            .collect()
    }

    fn test_params() -> EngineParams {
        EngineParams {
            n_slots: 1,
            n_batch: 64,
            n_ubatch: 32,
            ..EngineParams::default()
        }
    }

    fn greedy(prompt: &str, n_predict: i32) -> CompletionRequestData {
        let mut data = CompletionRequestData::new(
            CompletionKind::Normal,
            PromptInput::Text(prompt.to_string()),
        );
        data.n_predict = Some(n_predict);
        data.sampling.temperature = Some(0.0);
        data
    }

    // prompt length in mock tokens: BOS + one per char
    fn plen(prompt: &str) -> usize {
        prompt.chars().count() + 1
    }

    #[test]
    fn basic_completion_stops_on_eos() {
        let backend = MockBackend::new(256).with_script(plen("2+2="), "hello");
        let engine = TestEngine::start(backend, test_params());

        let results = engine.run_to_completion(greedy("2+2=", 16));
        let output = final_completion(&results);

        assert_eq!(output.content, "hello");
        assert!(output.stopped_eos);
        assert!(!output.stopped_limit);
        assert_eq!(output.tokens_evaluated, plen("2+2="));
    }

    #[test]
    fn prediction_budget_is_enforced() {
        let backend = MockBackend::new(256).with_script(plen("2+2="), "abcdefgh");
        let engine = TestEngine::start(backend, test_params());

        let results = engine.run_to_completion(greedy("2+2=", 4));
        let output = final_completion(&results);

        assert_eq!(output.content, "abcd");
        assert!(output.stopped_limit);
        assert!(!output.stopped_eos);
        assert_eq!(output.tokens_predicted, 4);
    }

    #[test]
    fn server_wide_predict_cap_applies() {
        let backend = MockBackend::new(256).with_script(plen("x"), "abcdefgh");
        let params = EngineParams {
            n_predict: 3,
            ..test_params()
        };
        let engine = TestEngine::start(backend, params);

        let mut data = greedy("x", 100);
        data.n_predict = Some(100); // above the cap, must be clamped
        let results = engine.run_to_completion(data);
        let output = final_completion(&results);
        assert_eq!(output.tokens_predicted, 3);
        assert!(output.stopped_limit);
    }

    #[test]
    fn stop_word_split_across_tokens_is_detected() {
        // tokens arrive one char at a time, so "XY" can never appear inside
        // a single token
        let backend = MockBackend::new(256).with_script(plen("go"), "abXYcd");
        let engine = TestEngine::start(backend, test_params());

        let mut data = greedy("go", 32);
        data.stop = vec!["XY".to_string()];
        let results = engine.run_to_completion(data);
        let output = final_completion(&results);

        assert_eq!(output.content, "ab");
        assert!(output.stopped_word);
        assert_eq!(output.stopping_word, "XY");
        assert!(!output.content.contains("XY"));
    }

    #[test]
    fn streaming_emits_partials_then_final() {
        let backend = MockBackend::new(256).with_script(plen("go"), "abXYcd");
        let engine = TestEngine::start(backend, test_params());

        let mut data = greedy("go", 32);
        data.stop = vec!["XY".to_string()];
        data.stream = true;
        let results = engine.run_to_completion(data);

        assert!(results.len() > 1);
        let output = final_completion(&results);
        assert!(output.stopped_word);
        // the final chunk carries no content in streaming mode; everything
        // arrived through the partials, without the stop word
        assert_eq!(streamed_content(&results), "ab");
    }

    #[test]
    fn exactly_one_stop_result_per_task() {
        let backend = MockBackend::new(256).with_script(plen("aa"), "xyz");
        let engine = TestEngine::start(backend, test_params());

        let mut data = greedy("aa", 8);
        data.stream = true;
        let results = engine.run_to_completion(data);
        assert_eq!(results.iter().filter(|r| r.stop).count(), 1);
        assert!(results.last().unwrap().stop);
    }

    #[test]
    fn second_task_defers_until_slot_frees() {
        let backend = MockBackend::new(256).with_script(plen("aa"), "xyz");
        let engine = TestEngine::start(backend, test_params());

        let first = engine.handle.submit(greedy("aa", 8));
        let second = engine.handle.submit(greedy("aa", 8));

        let first_results = engine.collect(first);
        let second_results = engine.collect(second);

        assert_eq!(final_completion(&first_results).content, "xyz");
        assert_eq!(final_completion(&second_results).content, "xyz");

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.n_tasks_deferred, 0);
        assert_eq!(snapshot.n_slots_processing, 0);
    }

    #[test]
    fn submit_many_echoes_sub_indices() {
        let backend = MockBackend::new(256).with_script(plen("aa"), "ok");
        let params = EngineParams {
            n_slots: 2,
            ..test_params()
        };
        let engine = TestEngine::start(backend, params);

        let mut a = greedy("aa", 4);
        a.index = 0;
        let mut b = greedy("aa", 4);
        b.index = 1;
        let ids = engine.handle.submit_many(vec![a, b]);

        let first = engine.collect(ids[0]);
        let second = engine.collect(ids[1]);
        assert_eq!(final_completion(&first).index, 0);
        assert_eq!(final_completion(&second).index, 1);
    }

    #[test]
    fn prefix_reuse_skips_cached_tokens() {
        let backend = MockBackend::new(256).with_next_fn(|_| b'x' as Token);
        let engine = TestEngine::start(backend, test_params());

        let mut first = greedy("ABCDE", 2);
        first.cache_prompt = true;
        first.id_slot = Some(0);
        let results = engine.run_to_completion(first);
        assert_eq!(final_completion(&results).prompt_n, plen("ABCDE"));

        let mut second = greedy("ABCDEF", 2);
        second.cache_prompt = true;
        second.id_slot = Some(0);
        let results = engine.run_to_completion(second);
        let output = final_completion(&results);

        assert_eq!(output.tokens_evaluated, plen("ABCDEF"));
        // only the new suffix was decoded
        assert_eq!(output.prompt_n, 1);
    }

    #[test]
    fn identical_prompt_reuse_redecodes_one_token() {
        let backend = MockBackend::new(256).with_next_fn(|_| b'x' as Token);
        let engine = TestEngine::start(backend, test_params());

        let mut first = greedy("ABCDE", 1);
        first.cache_prompt = true;
        first.id_slot = Some(0);
        engine.run_to_completion(first);

        // resubmitting a prompt that is entirely cached must still decode
        // one token so logits exist
        let mut second = greedy("ABCDE", 1);
        second.cache_prompt = true;
        second.id_slot = Some(0);
        let results = engine.run_to_completion(second);
        assert_eq!(final_completion(&results).prompt_n, 1);
    }

    #[test]
    fn cancel_stops_stream_and_frees_slot() {
        // throttle decoding so the cancel always lands mid-generation
        let backend = MockBackend::new(512)
            .with_next_fn(|_| b'x' as Token)
            .with_decode_delay(std::time::Duration::from_millis(2));
        let engine = TestEngine::start(backend, test_params());

        let mut data = greedy("spin", 100_000);
        data.stream = true;
        let id = engine.handle.submit(data);

        // wait until tokens are flowing
        let first = engine.handle.recv(&[id]).unwrap();
        assert!(!first.stop);

        engine.handle.cancel(id);

        let mut cancelled = false;
        loop {
            let result = engine.handle.recv(&[id]).unwrap();
            if result.stop {
                cancelled = matches!(result.data, ResultData::Cancelled);
                break;
            }
        }
        engine.handle.remove_waiter(id);
        assert!(cancelled);

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.n_slots_processing, 0);
        assert!(snapshot.slots.iter().all(|s| s.state == "idle"));
    }

    #[test]
    fn empty_token_prompt_returns_empty_final() {
        let backend = MockBackend::new(256);
        let engine = TestEngine::start(backend, test_params());

        let data = CompletionRequestData::new(
            CompletionKind::Normal,
            PromptInput::Tokens(Vec::new()),
        );
        let results = engine.run_to_completion(data);
        let output = final_completion(&results);
        assert!(output.content.is_empty());
        assert_eq!(output.tokens_predicted, 0);
    }

    #[test]
    fn invalid_grammar_is_rejected_at_launch() {
        let backend = MockBackend::new(256);
        let engine = TestEngine::start(backend, test_params());

        let mut data = greedy("x", 4);
        data.sampling.grammar = Some("(((".to_string());
        let results = engine.run_to_completion(data);
        let last = results.last().unwrap();
        assert!(last.error);
        match &last.data {
            ResultData::Error(e) => assert_eq!(e.code, ErrorCode::InvalidRequest),
            other => panic!("expected error, got {other:?}"),
        }

        // the slot must be usable again
        let results = engine.run_to_completion(greedy("x", 1));
        assert!(!results.last().unwrap().error);
    }

    #[test]
    fn schema_and_grammar_together_are_rejected() {
        let backend = MockBackend::new(256);
        let engine = TestEngine::start(backend, test_params());

        let mut data = greedy("x", 4);
        data.sampling.grammar = Some("root ::= \"a\"".to_string());
        data.sampling.json_schema = Some(serde_json::json!({"type": "object"}));
        let results = engine.run_to_completion(data);
        assert!(results.last().unwrap().error);
    }

    #[test]
    fn json_schema_alone_compiles_to_grammar() {
        let backend = MockBackend::new(256).with_script(plen("x"), "ok");
        let engine = TestEngine::start(backend, test_params());

        let mut data = greedy("x", 4);
        data.sampling.json_schema = Some(serde_json::json!({"type": "object"}));
        let results = engine.run_to_completion(data);
        assert!(!results.last().unwrap().error);
    }

    #[test]
    fn context_shift_keeps_generation_alive() {
        // slot context = 64 / 2 = 32
        let backend = MockBackend::new(64).with_next_fn(|_| b'x' as Token);
        let engine = TestEngine::start(backend, test_params());

        let mut data = greedy("ab", 40);
        data.n_keep = Some(4);
        let results = engine.run_to_completion(data);
        let output = final_completion(&results);

        assert!(output.truncated);
        assert!(output.tokens_predicted > 0);
        assert!(output.tokens_cached <= 32);
    }

    #[test]
    fn context_shift_disabled_errors_out() {
        let backend = MockBackend::new(64).with_next_fn(|_| b'x' as Token);
        let params = EngineParams {
            ctx_shift: false,
            ..test_params()
        };
        let engine = TestEngine::start(backend, params);

        let results = engine.run_to_completion(greedy("ab", 60));
        let last = results.last().unwrap();
        assert!(last.error);
    }

    #[test]
    fn long_prompt_truncated_when_shift_enabled() {
        // slot context = 32; prompt is 40 chars
        let long_prompt: String = std::iter::repeat('p').take(40).collect();
        let backend = MockBackend::new(64).with_next_fn(|_| EOS);
        let engine = TestEngine::start(backend, test_params());

        let results = engine.run_to_completion(greedy(&long_prompt, 2));
        let output = final_completion(&results);
        assert!(output.truncated);
        assert!(output.tokens_evaluated < 32);
    }

    #[test]
    fn long_prompt_rejected_when_shift_disabled() {
        let long_prompt: String = std::iter::repeat('p').take(40).collect();
        let backend = MockBackend::new(64);
        let params = EngineParams {
            ctx_shift: false,
            ..test_params()
        };
        let engine = TestEngine::start(backend, params);

        let results = engine.run_to_completion(greedy(&long_prompt, 2));
        assert!(results.last().unwrap().error);
    }

    #[test]
    fn speculative_output_matches_plain_decoding() {
        let script = "abcabcabcabcabc";
        let make_backend = || MockBackend::new(512).with_script(plen("abcabc"), script);

        let plain = {
            let engine = TestEngine::start(make_backend(), test_params());
            let mut data = greedy("abcabc", 64);
            data.cache_prompt = true;
            let results = engine.run_to_completion(data);
            final_completion(&results).clone()
        };

        let speculated = {
            let engine = TestEngine::start_with_draft(
                make_backend(),
                test_params(),
                Some(Box::new(NGramDraft { n: 2 })),
            );
            let mut data = greedy("abcabc", 64);
            data.cache_prompt = true;
            data.speculative.n_min = Some(1);
            data.speculative.n_max = Some(4);
            let results = engine.run_to_completion(data);
            final_completion(&results).clone()
        };

        assert_eq!(plain.content, script);
        assert_eq!(speculated.content, plain.content);
        assert!(speculated.stopped_eos);
    }

    #[test]
    fn embedding_returns_normalized_vector() {
        let backend = MockBackend::new(256);
        let params = EngineParams {
            embeddings: true,
            ..test_params()
        };
        let engine = TestEngine::start(backend, params);

        let data = CompletionRequestData::new(
            CompletionKind::Embedding,
            PromptInput::Text("abc".to_string()),
        );
        let results = engine.run_to_completion(data);
        match &results.last().unwrap().data {
            ResultData::Embedding(e) => {
                let norm: f32 = e.embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
                assert!((norm - 1.0).abs() < 1e-5);
            }
            other => panic!("expected embedding, got {other:?}"),
        }
    }

    #[test]
    fn embedding_requires_embedding_mode() {
        let backend = MockBackend::new(256);
        let engine = TestEngine::start(backend, test_params());

        let data = CompletionRequestData::new(
            CompletionKind::Embedding,
            PromptInput::Text("abc".to_string()),
        );
        let results = engine.run_to_completion(data);
        let last = results.last().unwrap();
        assert!(last.error);
        match &last.data {
            ResultData::Error(e) => assert_eq!(e.code, ErrorCode::NotSupported),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn oversized_embedding_prompt_is_rejected() {
        let backend = MockBackend::new(256);
        let params = EngineParams {
            embeddings: true,
            n_ubatch: 4,
            ..test_params()
        };
        let engine = TestEngine::start(backend, params);

        let data = CompletionRequestData::new(
            CompletionKind::Embedding,
            PromptInput::Text("0123456789".to_string()),
        );
        let results = engine.run_to_completion(data);
        assert!(results.last().unwrap().error);
    }

    #[test]
    fn rerank_scores_query_document_pair() {
        let backend = MockBackend::new(256);
        let params = EngineParams {
            reranking: true,
            ..test_params()
        };
        let engine = TestEngine::start(backend, params);

        let data = CompletionRequestData::new(
            CompletionKind::Rerank,
            PromptInput::Mixed(vec![
                PromptPart::Text("q".to_string()),
                PromptPart::Text("d".to_string()),
            ]),
        );
        let results = engine.run_to_completion(data);
        match &results.last().unwrap().data {
            ResultData::Rerank(r) => {
                // mock embedding component 0 is the token sum of the
                // [BOS] q [EOS] [SEP] d [EOS] sandwich
                let expected = (1 + 'q' as i64 + 2 + 3 + 'd' as i64 + 2) as f32;
                assert_eq!(r.score, expected);
            }
            other => panic!("expected rerank, got {other:?}"),
        }
    }

    #[test]
    fn system_prompt_prefixes_every_slot() {
        let system = "sys ";
        let prompt = "hi";
        // history = BOS + system chars + prompt chars (no BOS on the prompt
        // because the system prefix already opened the context)
        let history_len = 1 + system.chars().count() + prompt.chars().count();
        let backend = MockBackend::new(256).with_script(history_len, "ok");
        let params = EngineParams {
            system_prompt: Some(system.to_string()),
            ..test_params()
        };
        let engine = TestEngine::start(backend, params);

        let results = engine.run_to_completion(greedy(prompt, 8));
        let output = final_completion(&results);
        assert_eq!(output.content, "ok");
        assert!(output.stopped_eos);
    }

    #[test]
    fn kv_pressure_retries_with_smaller_batches() {
        let backend = MockBackend::new(256)
            .with_script(plen("ab"), "ok")
            .with_fail_decodes(2);
        let engine = TestEngine::start(backend, test_params());

        let results = engine.run_to_completion(greedy("ab", 8));
        assert_eq!(final_completion(&results).content, "ok");
    }

    #[test]
    fn persistent_kv_exhaustion_is_fatal_for_the_slot() {
        // n_batch = 64 halves at most 6 times; 10 failures exhaust the retry
        let backend = MockBackend::new(256).with_fail_decodes(10);
        let engine = TestEngine::start(backend, test_params());

        let results = engine.run_to_completion(greedy("ab", 8));
        let last = results.last().unwrap();
        assert!(last.error);
        match &last.data {
            ResultData::Error(e) => assert_eq!(e.code, ErrorCode::Server),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn slot_save_erase_restore_round_trip() {
        let dir = std::env::temp_dir().join("weft-slot-io-test");
        std::fs::create_dir_all(&dir).unwrap();
        let backend = MockBackend::new(256).with_next_fn(|_| b'x' as Token);
        let params = EngineParams {
            slot_save_path: Some(dir.clone()),
            ..test_params()
        };
        let engine = TestEngine::start(backend, params);

        let mut data = greedy("ABCDE", 2);
        data.cache_prompt = true;
        data.id_slot = Some(0);
        engine.run_to_completion(data);

        // prompt plus the first generated token; the second sampled token
        // stops on budget before it is ever decoded
        let n_cached = plen("ABCDE") + 1;

        let id = engine.handle.slot_io(0, SlotAction::Save, "state.bin".into());
        let results = engine.collect(id);
        let saved = match &results.last().unwrap().data {
            ResultData::SlotIo(io) => io.clone(),
            other => panic!("expected slot io, got {other:?}"),
        };
        assert_eq!(saved.n_tokens, n_cached);
        assert!(saved.n_bytes > 0);

        let id = engine.handle.slot_io(0, SlotAction::Erase, "state.bin".into());
        let results = engine.collect(id);
        match &results.last().unwrap().data {
            ResultData::SlotIo(io) => assert_eq!(io.n_tokens, n_cached),
            other => panic!("expected slot io, got {other:?}"),
        }

        let id = engine
            .handle
            .slot_io(0, SlotAction::Restore, "state.bin".into());
        let results = engine.collect(id);
        match &results.last().unwrap().data {
            ResultData::SlotIo(io) => assert_eq!(io.n_tokens, n_cached),
            other => panic!("expected slot io, got {other:?}"),
        }
    }

    #[test]
    fn slot_io_requires_save_path() {
        let backend = MockBackend::new(256);
        let engine = TestEngine::start(backend, test_params());

        let id = engine.handle.slot_io(0, SlotAction::Save, "state.bin".into());
        let results = engine.collect(id);
        let last = results.last().unwrap();
        assert!(last.error);
        match &last.data {
            ResultData::Error(e) => assert_eq!(e.code, ErrorCode::NotSupported),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn slot_io_rejects_path_traversal() {
        let dir = std::env::temp_dir().join("weft-slot-io-traversal");
        std::fs::create_dir_all(&dir).unwrap();
        let backend = MockBackend::new(256);
        let params = EngineParams {
            slot_save_path: Some(dir),
            ..test_params()
        };
        let engine = TestEngine::start(backend, params);

        let id = engine
            .handle
            .slot_io(0, SlotAction::Save, "../escape.bin".into());
        let results = engine.collect(id);
        assert!(results.last().unwrap().error);
    }

    #[test]
    fn lora_scales_are_applied() {
        let backend = MockBackend::new(256);
        let engine = TestEngine::start(backend, test_params());

        let id = engine.handle.set_lora(vec![(0, 0.5)]);
        let results = engine.collect(id);
        assert!(!results.last().unwrap().error);

        let id = engine.handle.set_lora(vec![(9, 1.0)]);
        let results = engine.collect(id);
        let last = results.last().unwrap();
        assert!(last.error);
        match &last.data {
            ResultData::Error(e) => assert_eq!(e.code, ErrorCode::NotFound),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn metrics_snapshot_reflects_work_done() {
        let backend = MockBackend::new(256).with_script(plen("aa"), "xyz");
        let engine = TestEngine::start(backend, test_params());

        engine.run_to_completion(greedy("aa", 8));

        let snapshot = engine.snapshot();
        assert!(snapshot.n_tokens_predicted_total >= 3);
        assert!(snapshot.n_prompt_tokens_processed_total >= plen("aa") as u64);
        assert!(snapshot.n_decode_total > 0);
        assert_eq!(snapshot.slots.len(), 1);
        assert_eq!(snapshot.kv_cache_total_cells, 256);
    }

    #[test]
    fn n_probs_attaches_candidates() {
        let backend = MockBackend::new(256).with_script(plen("x"), "ab");
        let engine = TestEngine::start(backend, test_params());

        let mut data = greedy("x", 8);
        data.sampling.n_probs = Some(2);
        let results = engine.run_to_completion(data);
        let output = final_completion(&results);
        assert!(!output.probs.is_empty());
        assert_eq!(output.probs[0].probs.len(), 2);
    }

    #[test]
    fn long_prompt_prefills_across_iterations() {
        let prompt: String = std::iter::repeat('q').take(100).collect();
        let backend = MockBackend::new(1024).with_next_fn(|_| EOS);
        let params = EngineParams {
            n_batch: 32,
            n_ubatch: 32,
            ..test_params()
        };
        let engine = TestEngine::start(backend, params);

        let results = engine.run_to_completion(greedy(&prompt, 2));
        let output = final_completion(&results);
        assert_eq!(output.tokens_evaluated, 101);
        assert_eq!(output.prompt_n, 101);
        assert!(output.stopped_eos);
    }

    #[test]
    fn similar_prompt_selects_the_matching_slot() {
        let backend = MockBackend::new(1024).with_next_fn(|_| EOS);
        let params = EngineParams {
            n_slots: 2,
            slot_prompt_similarity: 0.5,
            ..test_params()
        };
        let engine = TestEngine::start(backend, params);

        let mut warm = greedy("hello world", 2);
        warm.id_slot = Some(0);
        engine.run_to_completion(warm);
        let mut other = greedy("goodbye", 2);
        other.id_slot = Some(1);
        engine.run_to_completion(other);

        // no explicit slot: the shared "hello wor" prefix beats LRU order
        let results = engine.run_to_completion(greedy("hello wor!!", 2));
        assert_eq!(final_completion(&results).slot_id, 0);
    }

    #[test]
    fn lru_slot_selection_prefers_least_recently_used() {
        let backend = MockBackend::new(1024).with_next_fn(|_| EOS);
        let params = EngineParams {
            n_slots: 2,
            ..test_params()
        };
        let engine = TestEngine::start(backend, params);

        let mut warm = greedy("aa", 2);
        warm.id_slot = Some(0);
        engine.run_to_completion(warm);

        // slot 1 has never been used, so it wins over the warm slot 0
        let results = engine.run_to_completion(greedy("bb", 2));
        assert_eq!(final_completion(&results).slot_id, 1);
    }

    #[test]
    fn group_attention_generation_survives_remapping() {
        let backend = MockBackend::new(1024).with_next_fn(|_| b'x' as Token);
        let params = EngineParams {
            grp_attn_n: 2,
            grp_attn_w: 4,
            ..test_params()
        };
        let engine = TestEngine::start(backend, params);

        let results = engine.run_to_completion(greedy("ab", 12));
        let output = final_completion(&results);
        assert_eq!(output.tokens_predicted, 12);
        assert_eq!(output.content, "x".repeat(12));
    }

    #[test]
    fn timings_are_reported_on_the_final_result() {
        let backend = MockBackend::new(256).with_script(plen("aa"), "ok");
        let engine = TestEngine::start(backend, test_params());

        let results = engine.run_to_completion(greedy("aa", 8));
        let output = final_completion(&results);
        let timings = output.timings.as_ref().expect("final carries timings");
        assert_eq!(timings.prompt_n, plen("aa"));
        assert_eq!(timings.predicted_n, output.tokens_predicted);
    }
}
