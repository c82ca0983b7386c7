//! HTTP surface: router, shared state, auth middleware and the helpers that
//! bridge async handlers to the blocking result queue.

pub mod admin;
pub mod chat;
pub mod completions;
pub mod embeddings;
pub mod error;
pub mod tokenize;
pub mod types;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::Value;
use tokio::sync::mpsc;

use weft_core::engine::EngineHandle;
use weft_core::error::ErrorCode;
use weft_core::model::{ChatMessage, Token};
use weft_core::task::{CompletionOutput, ResultData, TaskId, TaskResult};
use weft_core::EngineError;

use error::ApiError;

/// Tokenizer-side capabilities that HTTP handlers use without going through
/// the scheduler: `/tokenize`, `/detokenize` and chat templating. Backed by
/// the shared model, which is read-only and thread-safe.
pub trait ApiTokenizer: Send + Sync {
    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Vec<Token>;
    fn token_piece(&self, token: Token) -> Vec<u8>;
    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<String, EngineError>;

    fn detokenize(&self, tokens: &[Token]) -> String {
        let mut bytes = Vec::new();
        for &t in tokens {
            bytes.extend(self.token_piece(t));
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Static server facts echoed by `/props`, `/v1/models` and friends.
pub struct ServerProps {
    pub model_alias: String,
    pub total_slots: usize,
    pub system_prompt: String,
    pub chat_template: String,
    pub default_generation_settings: Value,
    pub api_keys: Vec<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub handle: EngineHandle,
    pub tokenizer: Arc<dyn ApiTokenizer>,
    pub props: Arc<ServerProps>,
}

pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/completion", post(completions::native_completion))
        .route("/completions", post(completions::native_completion))
        .route("/v1/completions", post(completions::openai_completion))
        .route("/infill", post(completions::infill))
        .route("/chat/completions", post(chat::chat_completion))
        .route("/v1/chat/completions", post(chat::chat_completion))
        .route("/embedding", post(embeddings::embeddings))
        .route("/embeddings", post(embeddings::embeddings))
        .route("/v1/embeddings", post(embeddings::embeddings))
        .route("/rerank", post(embeddings::rerank))
        .route("/reranking", post(embeddings::rerank))
        .route("/v1/rerank", post(embeddings::rerank))
        .route("/v1/reranking", post(embeddings::rerank))
        .route("/tokenize", post(tokenize::tokenize))
        .route("/detokenize", post(tokenize::detokenize))
        .route("/props", get(admin::props))
        .route("/metrics", get(admin::metrics))
        .route("/slots", get(admin::slots))
        .route("/slots/:id", post(admin::slot_action))
        .route("/lora-adapters", get(admin::lora_list).post(admin::lora_set))
        .route("/v1/cancel", post(admin::cancel))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(admin::health))
        .route("/v1/models", get(admin::models))
        .merge(protected)
        .with_state(state)
}

/// Bearer-token check applied to every protected route when keys are
/// configured.
async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if state.props.api_keys.is_empty() {
        return next.run(req).await;
    }
    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(key) if state.props.api_keys.iter().any(|k| k == key) => next.run(req).await,
        _ => ApiError::new(ErrorCode::Authentication, "invalid API key").into_response(),
    }
}

// ─── Result plumbing ──────────────────────────────────────────────────────

/// Wait for the final result of every task id, in submission order.
pub async fn gather_finals(
    handle: EngineHandle,
    ids: Vec<TaskId>,
) -> Result<Vec<TaskResult>, ApiError> {
    let gathered = tokio::task::spawn_blocking(move || {
        let mut out: Vec<Option<TaskResult>> = (0..ids.len()).map(|_| None).collect();
        let mut pending = ids.clone();
        while !pending.is_empty() {
            let result = match handle.recv(&pending) {
                Ok(result) => result,
                Err(_) => {
                    handle.remove_waiters(&ids);
                    return Err(());
                }
            };
            if result.stop {
                pending.retain(|&id| id != result.id);
                if let Some(at) = ids.iter().position(|&id| id == result.id) {
                    out[at] = Some(result);
                }
            }
        }
        handle.remove_waiters(&ids);
        Ok(out.into_iter().flatten().collect::<Vec<_>>())
    })
    .await
    .map_err(|_| ApiError::server("result collection task failed"))?;

    gathered.map_err(|_| ApiError::unavailable("server is shutting down"))
}

/// Stream every result for one task into a channel. If the receiving side
/// goes away (client disconnect), the task is cancelled so its slot frees
/// immediately.
pub fn stream_results(handle: EngineHandle, id: TaskId) -> mpsc::Receiver<TaskResult> {
    let (tx, rx) = mpsc::channel(32);
    tokio::task::spawn_blocking(move || {
        loop {
            match handle.recv(&[id]) {
                Ok(result) => {
                    let stop = result.stop;
                    if tx.blocking_send(result).is_err() {
                        handle.cancel(id);
                        break;
                    }
                    if stop {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        handle.remove_waiter(id);
    });
    rx
}

/// Unpack a final result into a completion output, mapping engine errors
/// and cancellation onto the HTTP taxonomy.
pub fn into_completion(result: TaskResult) -> Result<CompletionOutput, ApiError> {
    match result.data {
        ResultData::Completion(output) => Ok(output),
        ResultData::Cancelled => Err(ApiError::server("request was cancelled")),
        ResultData::Error(e) => Err(ApiError::new(e.code, e.message)),
        other => Err(ApiError::server(format!(
            "unexpected result payload: {other:?}"
        ))),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use tower::ServiceExt;
    use weft_core::config::EngineParams;
    use weft_core::testing::MockBackend;

    fn params() -> EngineParams {
        EngineParams {
            n_slots: 1,
            n_batch: 64,
            n_ubatch: 32,
            ..EngineParams::default()
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let (state, _handle) = test_state(MockBackend::new(256), params());
        let app = create_router(state);

        let response = app
            .oneshot(
                HttpRequest::get("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn completion_round_trip() {
        let backend = MockBackend::new(256).with_script(3, "hey");
        let (state, _handle) = test_state(backend, params());
        let app = create_router(state);

        let response = app
            .oneshot(
                HttpRequest::post("/completion")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"prompt": "hi", "n_predict": 8, "temperature": 0}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["content"], "hey");
        assert_eq!(json["stop"], true);
        assert_eq!(json["stopped_eos"], true);
    }

    #[tokio::test]
    async fn openai_completion_shape() {
        let backend = MockBackend::new(256).with_script(3, "ok");
        let (state, _handle) = test_state(backend, params());
        let app = create_router(state);

        let response = app
            .oneshot(
                HttpRequest::post("/v1/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"prompt": "hi", "max_tokens": 8, "temperature": 0}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["object"], "text_completion");
        assert_eq!(json["choices"][0]["text"], "ok");
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        assert!(json["usage"]["total_tokens"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn chat_completion_applies_template() {
        // template output: "<|user|>hi\n<|assistant|>" = 24 chars + BOS
        let backend = MockBackend::new(256).with_script(25, "yo");
        let (state, _handle) = test_state(backend, params());
        let app = create_router(state);

        let response = app
            .oneshot(
                HttpRequest::post("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"messages": [{"role": "user", "content": "hi"}], "temperature": 0}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["choices"][0]["message"]["content"], "yo");
    }

    #[tokio::test]
    async fn tokenize_round_trip() {
        let (state, _handle) = test_state(MockBackend::new(256), params());
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(
                HttpRequest::post("/tokenize")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"content": "ab"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        let tokens: Vec<i64> = json["tokens"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect();
        assert_eq!(tokens, vec!['a' as i64, 'b' as i64]);

        let response = app
            .oneshot(
                HttpRequest::post("/detokenize")
                    .header("content-type", "application/json")
                    .body(Body::from(format!(
                        r#"{{"tokens": [{}, {}]}}"#,
                        'a' as i64, 'b' as i64
                    )))
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["content"], "ab");
    }

    #[tokio::test]
    async fn api_key_gates_protected_routes() {
        let (mut state, _handle) = test_state(MockBackend::new(256), params());
        let props = ServerProps {
            model_alias: "mock-model".into(),
            total_slots: 1,
            system_prompt: String::new(),
            chat_template: String::new(),
            default_generation_settings: serde_json::json!({}),
            api_keys: vec!["sekret".into()],
        };
        state.props = Arc::new(props);
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(
                HttpRequest::post("/tokenize")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"content": "x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(
                HttpRequest::post("/tokenize")
                    .header("content-type", "application/json")
                    .header("authorization", "Bearer sekret")
                    .body(Body::from(r#"{"content": "x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // health stays public
        let response = app
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn models_lists_the_served_model() {
        let (state, _handle) = test_state(MockBackend::new(256), params());
        let app = create_router(state);

        let response = app
            .oneshot(HttpRequest::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["object"], "list");
        assert_eq!(json["data"][0]["id"], "mock-model");
    }

    #[tokio::test]
    async fn cancel_endpoint_acknowledges() {
        let (state, _handle) = test_state(MockBackend::new(256), params());
        let app = create_router(state);

        let response = app
            .oneshot(
                HttpRequest::post("/v1/cancel")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"task_id": 12345}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
    }

    #[tokio::test]
    async fn props_reports_slots() {
        let (state, _handle) = test_state(MockBackend::new(256), params());
        let app = create_router(state);

        let response = app
            .oneshot(HttpRequest::get("/props").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["total_slots"], 1);
    }

    #[tokio::test]
    async fn embeddings_require_embedding_mode() {
        let (state, _handle) = test_state(MockBackend::new(256), params());
        let app = create_router(state);

        let response = app
            .oneshot(
                HttpRequest::post("/v1/embeddings")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"input": "abc"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn embeddings_round_trip() {
        let backend = MockBackend::new(256);
        let engine_params = EngineParams {
            embeddings: true,
            ..params()
        };
        let (state, _handle) = test_state(backend, engine_params);
        let app = create_router(state);

        let response = app
            .oneshot(
                HttpRequest::post("/v1/embeddings")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"input": ["abc", "def"]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"].as_array().unwrap().len(), 2);
        assert_eq!(json["data"][0]["index"], 0);
        assert_eq!(json["data"][1]["index"], 1);
    }

    #[tokio::test]
    async fn rerank_orders_documents() {
        let backend = MockBackend::new(256);
        let engine_params = EngineParams {
            reranking: true,
            ..params()
        };
        let (state, _handle) = test_state(backend, engine_params);
        let app = create_router(state);

        let response = app
            .oneshot(
                HttpRequest::post("/v1/rerank")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"query": "q", "documents": ["a", "zz"]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let results = json["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        // mock scores are token sums, so the longer document ranks first
        assert_eq!(results[0]["index"], 1);
    }
}
