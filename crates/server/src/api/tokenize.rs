//! Tokenizer endpoints. These never touch the scheduler; the model's
//! vocabulary is read-only shared state.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use super::error::ApiError;
use super::types::{
    DetokenizeRequest, DetokenizeResponse, TokenPiece, TokenizeRequest, TokenizeResponse,
};
use super::AppState;

pub async fn tokenize(
    State(state): State<AppState>,
    Json(req): Json<TokenizeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tokens = state
        .tokenizer
        .tokenize(&req.content, req.add_special, true);

    let response = if req.with_pieces {
        TokenizeResponse::Pieces {
            tokens: tokens
                .into_iter()
                .map(|id| TokenPiece {
                    id,
                    piece: String::from_utf8_lossy(&state.tokenizer.token_piece(id)).into_owned(),
                })
                .collect(),
        }
    } else {
        TokenizeResponse::Ids { tokens }
    };
    Ok(Json(response))
}

pub async fn detokenize(
    State(state): State<AppState>,
    Json(req): Json<DetokenizeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(DetokenizeResponse {
        content: state.tokenizer.detokenize(&req.tokens),
    }))
}
