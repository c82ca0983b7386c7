//! weft-core: slot-multiplexed batched decoding over a shared KV cache.
//!
//! The crate turns an unbounded stream of completion, embedding and rerank
//! requests into joint forward batches against a single model context. The
//! moving parts:
//!
//! - [`queue`]: task FIFO (+ deferred lane) and the result queue handlers
//!   block on.
//! - [`slot`]: the fixed pool of execution contexts, one KV sequence each.
//! - [`engine`]: the single-threaded scheduler loop that owns everything.
//! - [`model`]: the trait seam to the tensor engine (production: llama.cpp
//!   in the server crate; tests: [`testing::MockBackend`]).
//! - [`sampling`], [`speculative`], [`stop`], [`prompt`]: per-token
//!   machinery used by the loop.
//!
//! HTTP surfaces live elsewhere; this crate is deliberately runtime-free
//! (no async) because the scheduler is one dedicated thread.

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod model;
pub mod prompt;
pub mod queue;
pub mod sampling;
pub mod slot;
pub mod speculative;
pub mod stop;
pub mod task;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::EngineParams;
pub use engine::{Engine, EngineHandle};
pub use error::{EngineError, ErrorCode};
pub use metrics::MetricsSnapshot;
pub use model::{ModelBackend, Token};
pub use queue::{RecvError, ResultQueue, TaskQueue};
pub use task::{
    CompletionKind, CompletionRequestData, PromptInput, ResultData, Task, TaskId, TaskResult,
};
