//! Engine configuration.

use std::path::PathBuf;

use crate::slot::SlotParams;

/// Scheduler and slot-pool configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct EngineParams {
    /// Number of slots decoding in parallel.
    pub n_slots: usize,
    /// Logical batch cap per forward pass.
    pub n_batch: usize,
    /// Physical batch cap; embedding prompts must fit in one.
    pub n_ubatch: usize,
    /// Allow new prompt chunks to ride along with ongoing generation.
    pub cont_batching: bool,
    /// Enable mid-conversation context eviction.
    pub ctx_shift: bool,
    /// Server-wide prediction cap; -1 = unlimited.
    pub n_predict: i32,
    /// Prompt-similarity threshold for slot selection; 0 disables it.
    pub slot_prompt_similarity: f32,
    /// Directory for slot save/restore files; None disables the endpoints.
    pub slot_save_path: Option<PathBuf>,
    /// System prompt decoded into sequence 0 and shared by every slot.
    pub system_prompt: Option<String>,
    /// Group-attention factor; 1 disables self-extend.
    pub grp_attn_n: i32,
    /// Group-attention window.
    pub grp_attn_w: i32,
    /// Put the suffix before the prefix when assembling infill prompts.
    pub spm_infill: bool,
    /// Server accepts embedding requests.
    pub embeddings: bool,
    /// Server accepts rerank requests.
    pub reranking: bool,
    /// Defaults merged under per-request overrides at slot launch.
    pub defaults: SlotParams,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            n_slots: 1,
            n_batch: 2048,
            n_ubatch: 512,
            cont_batching: true,
            ctx_shift: true,
            n_predict: -1,
            slot_prompt_similarity: 0.0,
            slot_save_path: None,
            system_prompt: None,
            grp_attn_n: 1,
            grp_attn_w: 512,
            spm_infill: false,
            embeddings: false,
            reranking: false,
            defaults: SlotParams::default(),
        }
    }
}

impl EngineParams {
    /// Per-slot context budget. One extra share is reserved for the system
    /// prompt sequence.
    pub fn n_ctx_slot(&self, n_ctx_total: usize) -> usize {
        n_ctx_total / (self.n_slots + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_context_reserves_system_share() {
        let params = EngineParams {
            n_slots: 3,
            ..EngineParams::default()
        };
        assert_eq!(params.n_ctx_slot(4096), 1024);
    }

    #[test]
    fn defaults_are_usable() {
        let params = EngineParams::default();
        assert_eq!(params.n_slots, 1);
        assert!(params.ctx_shift);
        assert_eq!(params.grp_attn_n, 1);
    }
}
