//! Operational endpoints: health, props, Prometheus metrics, slot
//! persistence, LoRA hotswap, cancellation, model listing.

use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::Json;
use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_int_counter, register_int_gauge, Encoder, Gauge, IntCounter,
    IntGauge, TextEncoder,
};

use weft_core::task::{ResultData, SlotAction};
use weft_core::MetricsSnapshot;

use super::error::ApiError;
use super::types::{
    timestamp_now, CancelRequest, HealthResponse, LoraScaleRequest, ModelEntry, ModelsResponse,
    OkResponse, PropsResponse, SlotActionQuery, SlotFileRequest,
};
use super::{gather_finals, AppState};

// ─── Prometheus registry ──────────────────────────────────────────────────

static PROMPT_TOKENS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "weft_prompt_tokens_total",
        "Number of prompt tokens processed"
    )
    .expect("failed to register weft_prompt_tokens_total")
});

static TOKENS_PREDICTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "weft_tokens_predicted_total",
        "Number of generated tokens"
    )
    .expect("failed to register weft_tokens_predicted_total")
});

static PROMPT_SECONDS_TOTAL: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "weft_prompt_seconds_total",
        "Prompt-processing time in seconds"
    )
    .expect("failed to register weft_prompt_seconds_total")
});

static GENERATION_SECONDS_TOTAL: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "weft_tokens_predicted_seconds_total",
        "Generation time in seconds"
    )
    .expect("failed to register weft_tokens_predicted_seconds_total")
});

static KV_CACHE_USAGE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "weft_kv_cache_usage_ratio",
        "Fraction of KV cache cells in use"
    )
    .expect("failed to register weft_kv_cache_usage_ratio")
});

static KV_CACHE_TOKENS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("weft_kv_cache_tokens", "Tokens held in the KV cache")
        .expect("failed to register weft_kv_cache_tokens")
});

static REQUESTS_PROCESSING: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("weft_requests_processing", "Slots currently decoding")
        .expect("failed to register weft_requests_processing")
});

static REQUESTS_DEFERRED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("weft_requests_deferred", "Tasks parked in the deferred queue")
        .expect("failed to register weft_requests_deferred")
});

static DECODE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("weft_decode_total", "Forward passes executed")
        .expect("failed to register weft_decode_total")
});

static BUSY_SLOTS_PER_DECODE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "weft_busy_slots_per_decode",
        "Average busy slots per forward pass"
    )
    .expect("failed to register weft_busy_slots_per_decode")
});

fn update_registry(snapshot: &MetricsSnapshot) {
    let counter_gap = |counter: &IntCounter, value: u64| {
        let current = counter.get();
        if value > current {
            counter.inc_by(value - current);
        }
    };
    counter_gap(&PROMPT_TOKENS_TOTAL, snapshot.n_prompt_tokens_processed_total);
    counter_gap(&TOKENS_PREDICTED_TOTAL, snapshot.n_tokens_predicted_total);
    counter_gap(&DECODE_TOTAL, snapshot.n_decode_total);

    PROMPT_SECONDS_TOTAL.set(snapshot.t_prompt_processing_total_ms / 1e3);
    GENERATION_SECONDS_TOTAL.set(snapshot.t_tokens_generation_total_ms / 1e3);
    KV_CACHE_USAGE.set(if snapshot.kv_cache_total_cells > 0 {
        snapshot.kv_cache_used_cells as f64 / snapshot.kv_cache_total_cells as f64
    } else {
        0.0
    });
    KV_CACHE_TOKENS.set(snapshot.kv_cache_tokens as i64);
    REQUESTS_PROCESSING.set(snapshot.n_slots_processing as i64);
    REQUESTS_DEFERRED.set(snapshot.n_tasks_deferred as i64);
    BUSY_SLOTS_PER_DECODE.set(if snapshot.n_decode_total > 0 {
        snapshot.n_busy_slots_total as f64 / snapshot.n_decode_total as f64
    } else {
        0.0
    });
}

async fn fetch_snapshot(state: &AppState, reset_bucket: bool) -> Result<MetricsSnapshot, ApiError> {
    let id = state.handle.metrics(reset_bucket);
    let results = gather_finals(state.handle.clone(), vec![id]).await?;
    match results.into_iter().next().map(|r| r.data) {
        Some(ResultData::Metrics(snapshot)) => Ok(*snapshot),
        Some(ResultData::Error(e)) => Err(ApiError::new(e.code, e.message)),
        _ => Err(ApiError::server("no metrics snapshot")),
    }
}

// ─── Handlers ─────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

pub async fn props(State(state): State<AppState>) -> impl IntoResponse {
    Json(PropsResponse {
        system_prompt: state.props.system_prompt.clone(),
        default_generation_settings: state.props.default_generation_settings.clone(),
        total_slots: state.props.total_slots,
        chat_template: state.props.chat_template.clone(),
    })
}

pub async fn models(State(state): State<AppState>) -> impl IntoResponse {
    Json(ModelsResponse {
        object: "list",
        data: vec![ModelEntry {
            id: state.props.model_alias.clone(),
            object: "model",
            created: timestamp_now(),
            owned_by: "weft",
        }],
    })
}

pub async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = fetch_snapshot(&state, true).await?;
    update_registry(&snapshot);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| ApiError::server(format!("metrics encoding failed: {e}")))?;
    Ok(([(CONTENT_TYPE, encoder.format_type().to_string())], buffer))
}

pub async fn slots(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = fetch_snapshot(&state, false).await?;
    Ok(Json(snapshot.slots))
}

pub async fn slot_action(
    State(state): State<AppState>,
    Path(slot_id): Path<usize>,
    Query(query): Query<SlotActionQuery>,
    body: Option<Json<SlotFileRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let action = match query.action.as_deref() {
        Some("save") => SlotAction::Save,
        Some("restore") => SlotAction::Restore,
        Some("erase") => SlotAction::Erase,
        other => {
            return Err(ApiError::invalid_request(format!(
                "unknown slot action: {other:?}"
            )))
        }
    };
    let filename = match (&action, body) {
        (SlotAction::Erase, _) => String::new(),
        (_, Some(Json(req))) => req.filename,
        (_, None) => return Err(ApiError::invalid_request("missing filename")),
    };

    let id = state.handle.slot_io(slot_id, action, filename);
    let results = gather_finals(state.handle.clone(), vec![id]).await?;
    match results.into_iter().next().map(|r| r.data) {
        Some(ResultData::SlotIo(io)) => Ok(Json(io)),
        Some(ResultData::Error(e)) => Err(ApiError::new(e.code, e.message)),
        _ => Err(ApiError::server("no slot io result")),
    }
}

pub async fn lora_list(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    // adapter state lives with the backend, so the list rides along on a
    // metrics snapshot instead of getting its own task type
    let snapshot = fetch_snapshot(&state, false).await?;
    Ok(Json(snapshot.lora))
}

pub async fn lora_set(
    State(state): State<AppState>,
    Json(scales): Json<Vec<LoraScaleRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state
        .handle
        .set_lora(scales.into_iter().map(|s| (s.id, s.scale)).collect());
    let results = gather_finals(state.handle.clone(), vec![id]).await?;
    match results.into_iter().next().map(|r| r.data) {
        Some(ResultData::Error(e)) => Err(ApiError::new(e.code, e.message)),
        Some(_) => Ok(Json(OkResponse { success: true })),
        None => Err(ApiError::server("no lora result")),
    }
}

pub async fn cancel(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.handle.cancel(req.task_id);
    Ok(Json(OkResponse { success: true }))
}
