use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy surfaced to clients.
///
/// Every error that escapes the scheduler carries one of these codes; the
/// HTTP layer maps them onto status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    Authentication,
    NotFound,
    Server,
    NotSupported,
    Unavailable,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid grammar: {0}")]
    InvalidGrammar(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Server(String),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidRequest(_) | Self::InvalidGrammar(_) => ErrorCode::InvalidRequest,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::NotSupported(_) => ErrorCode::NotSupported,
            Self::Unavailable(_) => ErrorCode::Unavailable,
            Self::Server(_) => ErrorCode::Server,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_variants() {
        assert_eq!(
            EngineError::InvalidRequest("x".into()).code(),
            ErrorCode::InvalidRequest
        );
        assert_eq!(
            EngineError::InvalidGrammar("x".into()).code(),
            ErrorCode::InvalidRequest
        );
        assert_eq!(EngineError::NotFound("x".into()).code(), ErrorCode::NotFound);
        assert_eq!(
            EngineError::NotSupported("x".into()).code(),
            ErrorCode::NotSupported
        );
        assert_eq!(
            EngineError::Unavailable("x".into()).code(),
            ErrorCode::Unavailable
        );
        assert_eq!(EngineError::Server("x".into()).code(), ErrorCode::Server);
    }

    #[test]
    fn error_code_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::InvalidRequest).unwrap(),
            "\"invalid_request\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::NotSupported).unwrap(),
            "\"not_supported\""
        );
    }
}
