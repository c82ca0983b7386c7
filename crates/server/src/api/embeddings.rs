//! Embedding and reranking handlers.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::Value;

use weft_core::task::{
    CompletionKind, CompletionRequestData, PromptInput, PromptPart, ResultData,
};

use super::error::ApiError;
use super::types::{
    EmbeddingData, EmbeddingRequest, EmbeddingResponse, RerankRequest, RerankResponse,
    RerankResult, Usage,
};
use super::{gather_finals, AppState};

fn split_inputs(input: Value) -> Result<Vec<PromptInput>, ApiError> {
    match &input {
        Value::String(_) => Ok(vec![serde_json::from_value(input)
            .map_err(|e| ApiError::invalid_request(format!("invalid input: {e}")))?]),
        Value::Array(items) => {
            let fan_out = items
                .iter()
                .any(|item| matches!(item, Value::String(_) | Value::Array(_)));
            if fan_out {
                items
                    .iter()
                    .map(|item| {
                        serde_json::from_value(item.clone()).map_err(|e| {
                            ApiError::invalid_request(format!("invalid input element: {e}"))
                        })
                    })
                    .collect()
            } else {
                Ok(vec![serde_json::from_value(input).map_err(|e| {
                    ApiError::invalid_request(format!("invalid input: {e}"))
                })?])
            }
        }
        _ => Err(ApiError::invalid_request(
            "input must be a string or an array",
        )),
    }
}

pub async fn embeddings(
    State(state): State<AppState>,
    Json(req): Json<EmbeddingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let inputs = split_inputs(req.input)?;
    if inputs.is_empty() {
        return Err(ApiError::invalid_request("input must not be empty"));
    }

    // usage is reported in prompt tokens; count before the inputs move
    let prompt_tokens: usize = inputs
        .iter()
        .map(|input| match input {
            PromptInput::Text(text) => state.tokenizer.tokenize(text, true, true).len(),
            PromptInput::Tokens(tokens) => tokens.len(),
            PromptInput::Mixed(_) => 0,
        })
        .sum();

    let requests: Vec<CompletionRequestData> = inputs
        .into_iter()
        .enumerate()
        .map(|(index, prompt)| {
            let mut data = CompletionRequestData::new(CompletionKind::Embedding, prompt);
            data.index = index;
            data
        })
        .collect();

    let ids = state.handle.submit_many(requests);
    let results = gather_finals(state.handle.clone(), ids).await?;

    let mut data = Vec::with_capacity(results.len());
    for result in results {
        match result.data {
            ResultData::Embedding(e) => {
                data.push(EmbeddingData {
                    object: "embedding",
                    embedding: e.embedding,
                    index: e.index,
                });
            }
            ResultData::Error(e) => return Err(ApiError::new(e.code, e.message)),
            other => {
                return Err(ApiError::server(format!(
                    "unexpected embedding result: {other:?}"
                )))
            }
        }
    }
    data.sort_by_key(|d| d.index);

    Ok(Json(EmbeddingResponse {
        object: "list",
        data,
        model: req.model.unwrap_or_else(|| state.props.model_alias.clone()),
        usage: Usage::new(prompt_tokens, 0),
    }))
}

pub async fn rerank(
    State(state): State<AppState>,
    Json(req): Json<RerankRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.documents.is_empty() {
        return Err(ApiError::invalid_request("documents must not be empty"));
    }

    let requests: Vec<CompletionRequestData> = req
        .documents
        .iter()
        .enumerate()
        .map(|(index, doc)| {
            let mut data = CompletionRequestData::new(
                CompletionKind::Rerank,
                PromptInput::Mixed(vec![
                    PromptPart::Text(req.query.clone()),
                    PromptPart::Text(doc.clone()),
                ]),
            );
            data.index = index;
            data
        })
        .collect();

    let ids = state.handle.submit_many(requests);
    let results = gather_finals(state.handle.clone(), ids).await?;

    let mut scored = Vec::with_capacity(results.len());
    for result in results {
        match result.data {
            ResultData::Rerank(r) => scored.push(RerankResult {
                index: r.index,
                relevance_score: r.score,
            }),
            ResultData::Error(e) => return Err(ApiError::new(e.code, e.message)),
            other => {
                return Err(ApiError::server(format!(
                    "unexpected rerank result: {other:?}"
                )))
            }
        }
    }

    scored.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if let Some(top_n) = req.top_n {
        scored.truncate(top_n);
    }

    Ok(Json(RerankResponse {
        model: req.model.unwrap_or_else(|| state.props.model_alias.clone()),
        object: "list",
        results: scored,
        usage: Usage::new(0, 0),
    }))
}
