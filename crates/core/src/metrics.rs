//! Scheduler-side counters.
//!
//! Mutated only by the scheduler thread; HTTP scrapes get a snapshot by
//! posting a `Metrics` task. Lifetime totals accumulate forever; the bucket
//! counters cover the window since the last scrape that asked for a reset.

use serde::Serialize;

/// Aggregate counters kept by the scheduler.
#[derive(Debug, Default)]
pub struct Metrics {
    // Lifetime totals.
    pub n_prompt_tokens_processed_total: u64,
    pub t_prompt_processing_total_ms: f64,
    pub n_tokens_predicted_total: u64,
    pub t_tokens_generation_total_ms: f64,
    pub n_decode_total: u64,
    pub n_busy_slots_total: u64,

    // Bucket since last reset.
    pub n_prompt_tokens_processed: u64,
    pub t_prompt_processing_ms: f64,
    pub n_tokens_predicted: u64,
    pub t_tokens_generation_ms: f64,
}

impl Metrics {
    /// Record a finished prompt pass.
    pub fn on_prompt_eval(&mut self, n_tokens: usize, elapsed_ms: f64) {
        self.n_prompt_tokens_processed_total += n_tokens as u64;
        self.n_prompt_tokens_processed += n_tokens as u64;
        self.t_prompt_processing_total_ms += elapsed_ms;
        self.t_prompt_processing_ms += elapsed_ms;
    }

    /// Record a finished generation.
    pub fn on_prediction(&mut self, n_tokens: usize, elapsed_ms: f64) {
        self.n_tokens_predicted_total += n_tokens as u64;
        self.n_tokens_predicted += n_tokens as u64;
        self.t_tokens_generation_total_ms += elapsed_ms;
        self.t_tokens_generation_ms += elapsed_ms;
    }

    /// Record one forward pass touching `n_busy` slots.
    pub fn on_decoded(&mut self, n_busy: usize) {
        self.n_decode_total += 1;
        self.n_busy_slots_total += n_busy as u64;
    }

    pub fn reset_bucket(&mut self) {
        self.n_prompt_tokens_processed = 0;
        self.t_prompt_processing_ms = 0.0;
        self.n_tokens_predicted = 0;
        self.t_tokens_generation_ms = 0.0;
    }
}

/// Per-slot view exposed by `/slots` and the metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SlotView {
    pub id: usize,
    pub id_task: i64,
    pub state: String,
    pub n_ctx: usize,
    pub n_past: usize,
    pub n_decoded: usize,
    pub cache_tokens: usize,
    pub truncated: bool,
}

/// Point-in-time counters shipped to the HTTP layer.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub n_prompt_tokens_processed_total: u64,
    pub t_prompt_processing_total_ms: f64,
    pub n_tokens_predicted_total: u64,
    pub t_tokens_generation_total_ms: f64,
    pub n_decode_total: u64,
    pub n_busy_slots_total: u64,

    pub n_prompt_tokens_processed: u64,
    pub t_prompt_processing_ms: f64,
    pub n_tokens_predicted: u64,
    pub t_tokens_generation_ms: f64,

    pub kv_cache_used_cells: usize,
    pub kv_cache_total_cells: usize,
    /// Sum of cached tokens across slots plus the system prompt.
    pub kv_cache_tokens: usize,
    pub n_slots_idle: usize,
    pub n_slots_processing: usize,
    pub n_tasks_deferred: usize,
    pub slots: Vec<SlotView>,
    pub lora: Vec<crate::model::LoraAdapter>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_survive_bucket_reset() {
        let mut m = Metrics::default();
        m.on_prompt_eval(10, 5.0);
        m.on_prediction(4, 8.0);
        m.on_decoded(2);

        m.reset_bucket();

        assert_eq!(m.n_prompt_tokens_processed, 0);
        assert_eq!(m.n_tokens_predicted, 0);
        assert_eq!(m.t_prompt_processing_ms, 0.0);
        assert_eq!(m.n_prompt_tokens_processed_total, 10);
        assert_eq!(m.n_tokens_predicted_total, 4);
        assert_eq!(m.n_decode_total, 1);
        assert_eq!(m.n_busy_slots_total, 2);
    }

    #[test]
    fn buckets_accumulate_between_resets() {
        let mut m = Metrics::default();
        m.on_prompt_eval(3, 1.0);
        m.on_prompt_eval(4, 2.0);
        assert_eq!(m.n_prompt_tokens_processed, 7);
        assert_eq!(m.t_prompt_processing_ms, 3.0);
    }
}
