//! OpenAI-compatible chat completions.
//!
//! Messages are rendered through the model's chat template, then the
//! request behaves exactly like a text completion.

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::stream::Stream;
use std::convert::Infallible;
use uuid::Uuid;

use weft_core::task::{CompletionKind, CompletionRequestData, PromptInput, ResultData};

use super::error::ApiError;
use super::types::{
    finish_reason, timestamp_now, ChatChoice, ChatChunkChoice, ChatCompletionChunk,
    ChatCompletionRequest, ChatCompletionResponse, ChatDelta, ChatMessageOut, LogitBias,
    StopField, Usage,
};
use super::{gather_finals, into_completion, stream_results, AppState};

fn build_chat_request(
    state: &AppState,
    req: &ChatCompletionRequest,
) -> Result<CompletionRequestData, ApiError> {
    if req.messages.is_empty() {
        return Err(ApiError::invalid_request("messages must not be empty"));
    }
    let prompt = state.tokenizer.apply_chat_template(&req.messages)?;

    let mut data =
        CompletionRequestData::new(CompletionKind::Normal, PromptInput::Text(prompt));
    data.stream = req.stream;
    data.n_predict = req.max_tokens;
    data.stop = req.stop.clone().map(StopField::into_vec).unwrap_or_default();
    data.sampling.temperature = req.temperature;
    data.sampling.top_p = req.top_p;
    data.sampling.seed = req.seed;
    data.sampling.penalty_freq = req.frequency_penalty;
    data.sampling.penalty_present = req.presence_penalty;
    data.sampling.n_probs = req.n_probs;
    data.sampling.logit_bias = req.logit_bias.clone().map(LogitBias::into_pairs);
    data.sampling.grammar = req.grammar.clone();
    data.sampling.json_schema = req.json_schema.clone();

    // response_format json_schema takes priority, mirroring the OpenAI API
    if let Some(format) = &req.response_format {
        match format.r#type.as_str() {
            "json_object" => {
                if let Some(schema) = &format.schema {
                    data.sampling.json_schema = Some(schema.clone());
                }
            }
            "json_schema" => {
                if let Some(spec) = &format.json_schema {
                    if let Some(schema) = &spec.schema {
                        data.sampling.json_schema = Some(schema.clone());
                    }
                }
            }
            "text" => {}
            other => {
                return Err(ApiError::invalid_request(format!(
                    "unsupported response_format type: {other}"
                )))
            }
        }
    }

    Ok(data)
}

pub async fn chat_completion(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let data = build_chat_request(&state, &req)?;

    if req.stream {
        let id = state.handle.submit(data);
        let rx = stream_results(state.handle.clone(), id);
        let model = state.props.model_alias.clone();
        return Ok(chat_sse(model, rx).into_response());
    }

    let ids = state.handle.submit_many(vec![data]);
    let results = gather_finals(state.handle.clone(), ids).await?;
    let output = into_completion(results.into_iter().next().ok_or_else(|| {
        ApiError::server("no result for chat completion")
    })?)?;

    let response = ChatCompletionResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4()),
        object: "chat.completion",
        created: timestamp_now(),
        model: state.props.model_alias.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessageOut {
                role: "assistant",
                content: output.content.clone(),
            },
            finish_reason: Some(finish_reason(&output)),
        }],
        usage: Usage::new(output.tokens_evaluated, output.tokens_predicted),
    };
    Ok(Json(response).into_response())
}

fn chat_sse(
    model: String,
    mut rx: tokio::sync::mpsc::Receiver<weft_core::task::TaskResult>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let id = format!("chatcmpl-{}", Uuid::new_v4());
    let stream = async_stream::stream! {
        // OpenAI clients expect the role to arrive in the first chunk
        let opening = ChatCompletionChunk {
            id: id.clone(),
            object: "chat.completion.chunk",
            created: timestamp_now(),
            model: model.clone(),
            choices: vec![ChatChunkChoice {
                index: 0,
                delta: ChatDelta {
                    role: Some("assistant"),
                    content: None,
                },
                finish_reason: None,
            }],
        };
        yield Ok::<_, Infallible>(
            Event::default().data(serde_json::to_string(&opening).unwrap_or_default()),
        );

        while let Some(result) = rx.recv().await {
            let stop = result.stop;
            if let ResultData::Completion(output) = result.data {
                let reason = stop.then(|| finish_reason(&output));
                let chunk = ChatCompletionChunk {
                    id: id.clone(),
                    object: "chat.completion.chunk",
                    created: timestamp_now(),
                    model: model.clone(),
                    choices: vec![ChatChunkChoice {
                        index: 0,
                        delta: ChatDelta {
                            role: None,
                            content: (!output.content.is_empty()).then(|| output.content.clone()),
                        },
                        finish_reason: reason,
                    }],
                };
                yield Ok::<_, Infallible>(
                    Event::default().data(serde_json::to_string(&chunk).unwrap_or_default()),
                );
            }
            if stop {
                break;
            }
        }
        yield Ok::<_, Infallible>(Event::default().data("[DONE]"));
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}
