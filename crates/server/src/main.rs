//! weft-server: OpenAI-compatible HTTP inference server over a single
//! shared llama.cpp context, scheduled by the weft-core slot engine.

mod api;
mod backend;
mod logging;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use weft_core::config::EngineParams;
use weft_core::engine::{Engine, EngineHandle};
use weft_core::queue::{ResultQueue, TaskQueue};
use weft_core::sampling::SamplerSpec;
use weft_core::slot::SlotParams;
use weft_core::speculative::SpeculativeParams;

use api::{AppState, ServerProps};
use backend::{ContextOptions, LlamaCpp, LlamaDraft, LlamaTokenizer, LoadOptions};

#[derive(Debug, Parser)]
#[command(name = "weft-server", version, about = "slot-multiplexed LLM inference server")]
struct Args {
    /// Path to the model file (GGUF).
    #[arg(short, long)]
    model: PathBuf,

    /// Draft model for speculative decoding.
    #[arg(long)]
    model_draft: Option<PathBuf>,

    /// Model name reported by the API.
    #[arg(long)]
    alias: Option<String>,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Number of parallel slots.
    #[arg(short = 'p', long, default_value_t = 1)]
    parallel: usize,

    /// Total context size shared by all slots.
    #[arg(short = 'c', long, default_value_t = 4096)]
    ctx_size: u32,

    /// Logical batch size per forward pass.
    #[arg(short = 'b', long, default_value_t = 2048)]
    batch_size: usize,

    /// Physical batch size; embedding prompts must fit in one.
    #[arg(long, default_value_t = 512)]
    ubatch_size: usize,

    /// Compute threads for the forward pass.
    #[arg(short = 't', long)]
    threads: Option<i32>,

    /// Layers to offload to the GPU.
    #[arg(long, default_value_t = 0)]
    n_gpu_layers: u32,

    /// Server-wide cap on predicted tokens per request; -1 = unlimited.
    #[arg(short = 'n', long, default_value_t = -1)]
    n_predict: i32,

    /// Disable mixing new prompts into ongoing generation batches.
    #[arg(long)]
    no_cont_batching: bool,

    /// Disable mid-conversation context eviction.
    #[arg(long)]
    no_context_shift: bool,

    /// Minimum prompt similarity to reuse a slot's cache (0 disables).
    #[arg(long, default_value_t = 0.0)]
    slot_prompt_similarity: f32,

    /// Directory for slot save/restore files.
    #[arg(long)]
    slot_save_path: Option<PathBuf>,

    /// File whose contents become the shared system prompt.
    #[arg(long)]
    system_prompt_file: Option<PathBuf>,

    /// API key required in the Authorization header. Repeatable.
    #[arg(long = "api-key")]
    api_keys: Vec<String>,

    /// Enable the embedding endpoints.
    #[arg(long)]
    embeddings: bool,

    /// Enable the reranking endpoints.
    #[arg(long)]
    reranking: bool,

    /// Group-attention factor for self-extend (1 disables).
    #[arg(long, default_value_t = 1)]
    grp_attn_n: i32,

    /// Group-attention width for self-extend.
    #[arg(long, default_value_t = 512)]
    grp_attn_w: i32,

    /// Use suffix/prefix/middle infill ordering (SPM models).
    #[arg(long)]
    spm_infill: bool,

    /// Minimum accepted draft length before a speculative step runs.
    #[arg(long, default_value_t = 5)]
    draft_min: usize,

    /// Maximum drafted tokens per speculative step.
    #[arg(long, default_value_t = 16)]
    draft_max: usize,

    /// Minimum draft-token confidence.
    #[arg(long, default_value_t = 0.9)]
    draft_p_min: f32,

    /// Context size for the draft model.
    #[arg(long, default_value_t = 4096)]
    draft_ctx_size: u32,
}

impl Args {
    fn engine_params(&self, system_prompt: Option<String>) -> EngineParams {
        EngineParams {
            n_slots: self.parallel.max(1),
            n_batch: self.batch_size,
            n_ubatch: self.ubatch_size,
            cont_batching: !self.no_cont_batching,
            ctx_shift: !self.no_context_shift,
            n_predict: self.n_predict,
            slot_prompt_similarity: self.slot_prompt_similarity,
            slot_save_path: self.slot_save_path.clone(),
            system_prompt,
            grp_attn_n: self.grp_attn_n,
            grp_attn_w: self.grp_attn_w,
            spm_infill: self.spm_infill,
            embeddings: self.embeddings,
            reranking: self.reranking,
            defaults: SlotParams {
                speculative: SpeculativeParams {
                    n_min: self.draft_min,
                    n_max: if self.model_draft.is_some() {
                        self.draft_max
                    } else {
                        0
                    },
                    p_min: self.draft_p_min,
                },
                ..SlotParams::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let args = Args::parse();

    let system_prompt = match &args.system_prompt_file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("reading system prompt from {}", path.display()))?,
        ),
        None => None,
    };

    let loaded = backend::load(&LoadOptions {
        model_path: args.model.clone(),
        draft_model_path: args.model_draft.clone(),
        n_gpu_layers: args.n_gpu_layers,
    })?;

    let engine_params = args.engine_params(system_prompt.clone());
    let queue = Arc::new(TaskQueue::new());
    let results = Arc::new(ResultQueue::new());
    let handle = EngineHandle {
        queue: Arc::clone(&queue),
        results: Arc::clone(&results),
    };

    // the scheduler owns the contexts; they are created on its thread
    let scheduler = {
        let engine_params = engine_params.clone();
        let ctx_options = ContextOptions {
            n_ctx: args.ctx_size,
            n_batch: args.batch_size as u32,
            n_ubatch: args.ubatch_size as u32,
            n_seq_max: args.parallel as u32 + 1,
            n_threads: args.threads,
            embeddings: args.embeddings || args.reranking,
        };
        let draft_ctx_options = ContextOptions {
            n_ctx: args.draft_ctx_size,
            n_batch: args.batch_size as u32,
            n_ubatch: args.ubatch_size as u32,
            n_seq_max: 1,
            n_threads: args.threads,
            embeddings: false,
        };
        let llama = loaded.backend;
        let model = loaded.model;
        let draft_model = loaded.draft_model;

        thread::Builder::new()
            .name("weft-scheduler".into())
            .spawn(move || -> anyhow::Result<()> {
                let model_backend = LlamaCpp::new(llama, model, &ctx_options)?;
                let mut engine = Engine::new(model_backend, engine_params, queue, results);
                if let Some(draft) = draft_model {
                    let draft_backend = LlamaDraft::new(llama, draft, &draft_ctx_options)?;
                    engine = engine.with_draft(Box::new(draft_backend));
                }
                engine.run();
                Ok(())
            })
            .context("spawning scheduler thread")?
    };

    let alias = args.alias.clone().unwrap_or_else(|| {
        args.model
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".into())
    });

    let props = ServerProps {
        model_alias: alias,
        total_slots: engine_params.n_slots,
        system_prompt: system_prompt.unwrap_or_default(),
        chat_template: loaded.model.get_chat_template(4096).unwrap_or_default(),
        default_generation_settings: serde_json::to_value(&SamplerSpec::default())
            .unwrap_or_default(),
        api_keys: args.api_keys.clone(),
    };

    let state = AppState {
        handle: handle.clone(),
        tokenizer: LlamaTokenizer::new(loaded.model),
        props: Arc::new(props),
    };
    let router = api::create_router(state);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .context("invalid host/port")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, slots = engine_params.n_slots, "server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(handle))
        .await?;

    scheduler
        .join()
        .map_err(|_| anyhow::anyhow!("scheduler thread panicked"))??;
    Ok(())
}

async fn shutdown_signal(handle: EngineHandle) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining");
    handle.terminate();
}
