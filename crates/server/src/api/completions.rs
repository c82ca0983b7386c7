//! Text completion and infill handlers, native and OpenAI flavored.

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::stream::Stream;
use serde_json::Value;
use std::convert::Infallible;
use tracing::debug;
use uuid::Uuid;

use weft_core::task::{CompletionKind, CompletionRequestData, PromptInput, ResultData};

use super::error::ApiError;
use super::types::{
    finish_reason, timestamp_now, CompletionChoice, CompletionRequest, CompletionResponse,
    NativeCompletionResponse, StopField, Usage,
};
use super::{gather_finals, into_completion, stream_results, AppState};

/// Split the `prompt` field into individual submissions: an array of
/// strings or token arrays fans out into one task per element.
fn split_prompts(prompt: Value) -> Result<Vec<PromptInput>, ApiError> {
    match &prompt {
        Value::String(_) => Ok(vec![serde_json::from_value(prompt)
            .map_err(|e| ApiError::invalid_request(format!("invalid prompt: {e}")))?]),
        Value::Array(items) => {
            // an array of strings or arrays is a multi-prompt submission; an
            // array of numbers is a single pre-tokenized prompt
            let fan_out = items
                .iter()
                .any(|item| matches!(item, Value::String(_) | Value::Array(_)));
            if fan_out {
                items
                    .iter()
                    .map(|item| {
                        serde_json::from_value(item.clone()).map_err(|e| {
                            ApiError::invalid_request(format!("invalid prompt element: {e}"))
                        })
                    })
                    .collect()
            } else {
                Ok(vec![serde_json::from_value(prompt).map_err(|e| {
                    ApiError::invalid_request(format!("invalid prompt: {e}"))
                })?])
            }
        }
        _ => Err(ApiError::invalid_request(
            "prompt must be a string or an array",
        )),
    }
}

pub(super) fn build_request(
    req: &CompletionRequest,
    kind: CompletionKind,
    prompt: PromptInput,
    index: usize,
) -> CompletionRequestData {
    let mut data = CompletionRequestData::new(kind, prompt);
    data.index = index;
    data.id_slot = req.id_slot;
    data.stream = req.stream;
    data.cache_prompt = req.cache_prompt;
    data.n_predict = req.n_predict;
    data.n_keep = req.n_keep;
    data.n_discard = req.n_discard;
    data.stop = req.stop.clone().map(StopField::into_vec).unwrap_or_default();
    data.input_prefix = req.input_prefix.clone().unwrap_or_default();
    data.input_suffix = req.input_suffix.clone().unwrap_or_default();
    data.sampling = req.sampling_overrides();
    data.speculative = req
        .speculative
        .as_ref()
        .map(|s| s.overrides())
        .unwrap_or_default();
    data
}

async fn run_completion(
    state: AppState,
    req: CompletionRequest,
    kind: CompletionKind,
    openai: bool,
) -> Result<axum::response::Response, ApiError> {
    let prompts = match kind {
        CompletionKind::Infill => vec![PromptInput::Text(String::new())],
        _ => split_prompts(
            req.prompt
                .clone()
                .ok_or_else(|| ApiError::invalid_request("missing prompt"))?,
        )?,
    };

    if req.stream && prompts.len() > 1 {
        return Err(ApiError::invalid_request(
            "streaming is not supported with multiple prompts",
        ));
    }

    let requests: Vec<CompletionRequestData> = prompts
        .into_iter()
        .enumerate()
        .map(|(index, prompt)| build_request(&req, kind, prompt, index))
        .collect();

    if req.stream {
        let id = state.handle.submit(requests.into_iter().next().expect("one prompt"));
        debug!(task = id, "streaming completion started");
        let rx = stream_results(state.handle.clone(), id);
        let model = state.props.model_alias.clone();
        return Ok(if openai {
            openai_completion_sse(model, rx).into_response()
        } else {
            native_completion_sse(model, rx).into_response()
        });
    }

    let ids = state.handle.submit_many(requests);
    let results = gather_finals(state.handle.clone(), ids).await?;

    let mut outputs = Vec::with_capacity(results.len());
    for result in results {
        outputs.push(into_completion(result)?);
    }

    if openai {
        let prompt_tokens: usize = outputs.iter().map(|o| o.tokens_evaluated).sum();
        let completion_tokens: usize = outputs.iter().map(|o| o.tokens_predicted).sum();
        let response = CompletionResponse {
            id: format!("cmpl-{}", Uuid::new_v4()),
            object: "text_completion",
            created: timestamp_now(),
            model: state.props.model_alias.clone(),
            choices: outputs
                .iter()
                .map(|o| CompletionChoice {
                    text: o.content.clone(),
                    index: o.index,
                    logprobs: None,
                    finish_reason: Some(finish_reason(o)),
                })
                .collect(),
            usage: Usage::new(prompt_tokens, completion_tokens),
        };
        Ok(Json(response).into_response())
    } else if outputs.len() == 1 {
        let output = &outputs[0];
        Ok(Json(NativeCompletionResponse {
            model: &state.props.model_alias,
            output,
            stop: true,
            cancelled: None,
        })
        .into_response())
    } else {
        let model = state.props.model_alias.clone();
        let results: Vec<Value> = outputs
            .iter()
            .map(|output| {
                serde_json::to_value(NativeCompletionResponse {
                    model: &model,
                    output,
                    stop: true,
                    cancelled: None,
                })
                .unwrap_or(Value::Null)
            })
            .collect();
        Ok(Json(serde_json::json!({ "results": results })).into_response())
    }
}

pub async fn native_completion(
    State(state): State<AppState>,
    Json(req): Json<CompletionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    run_completion(state, req, CompletionKind::Normal, false).await
}

pub async fn openai_completion(
    State(state): State<AppState>,
    Json(req): Json<CompletionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    run_completion(state, req, CompletionKind::Normal, true).await
}

pub async fn infill(
    State(state): State<AppState>,
    Json(req): Json<CompletionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.input_prefix.is_none() && req.input_suffix.is_none() {
        return Err(ApiError::invalid_request(
            "infill requires input_prefix and/or input_suffix",
        ));
    }
    run_completion(state, req, CompletionKind::Infill, false).await
}

// ─── SSE assembly ─────────────────────────────────────────────────────────

fn native_completion_sse(
    model: String,
    mut rx: tokio::sync::mpsc::Receiver<weft_core::task::TaskResult>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        while let Some(result) = rx.recv().await {
            let stop = result.stop;
            let payload = match result.data {
                ResultData::Completion(output) => serde_json::to_value(NativeCompletionResponse {
                    model: &model,
                    output: &output,
                    stop,
                    cancelled: None,
                })
                .unwrap_or(Value::Null),
                ResultData::Cancelled => serde_json::json!({
                    "stop": true,
                    "cancelled": true,
                    "content": "",
                }),
                ResultData::Error(e) => serde_json::json!({
                    "stop": true,
                    "error": { "code": e.code, "message": e.message },
                }),
                _ => Value::Null,
            };
            yield Ok::<_, Infallible>(
                Event::default().data(serde_json::to_string(&payload).unwrap_or_default()),
            );
            if stop {
                break;
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn openai_completion_sse(
    model: String,
    mut rx: tokio::sync::mpsc::Receiver<weft_core::task::TaskResult>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let id = format!("cmpl-{}", Uuid::new_v4());
    let stream = async_stream::stream! {
        while let Some(result) = rx.recv().await {
            let stop = result.stop;
            match result.data {
                ResultData::Completion(output) => {
                    let reason = stop.then(|| finish_reason(&output));
                    let chunk = serde_json::json!({
                        "id": id,
                        "object": "text_completion",
                        "created": timestamp_now(),
                        "model": model,
                        "choices": [{
                            "text": output.content,
                            "index": 0,
                            "logprobs": Value::Null,
                            "finish_reason": reason,
                        }],
                    });
                    yield Ok::<_, Infallible>(
                        Event::default().data(serde_json::to_string(&chunk).unwrap_or_default()),
                    );
                }
                ResultData::Error(e) => {
                    let chunk = serde_json::json!({"error": {"message": e.message, "type": e.code}});
                    yield Ok::<_, Infallible>(
                        Event::default().data(serde_json::to_string(&chunk).unwrap_or_default()),
                    );
                }
                _ => {}
            }
            if stop {
                break;
            }
        }
        yield Ok::<_, Infallible>(Event::default().data("[DONE]"));
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}
