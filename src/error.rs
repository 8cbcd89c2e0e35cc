use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::{Operation, SessionState};

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, SessionError>;

/// Closed set of status codes shared with the engine.
///
/// Stage codes identify which part of the remote pipeline failed; the
/// remaining codes cover the connection and generic outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Disconnected,
    Failed,
    Success,
    Timeout,
    InvalidModel,
    InitVocabError,
    InitEmbeddingTableError,
    TokenizeError,
    DetokenizeError,
    PreAttnPrefillError,
    PreAttnDecodeError,
    AttnError,
    PostAttnPrefillError,
    PostAttnDecodeError,
    LmHeadError,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 15] = [
        ErrorCode::Disconnected,
        ErrorCode::Failed,
        ErrorCode::Success,
        ErrorCode::Timeout,
        ErrorCode::InvalidModel,
        ErrorCode::InitVocabError,
        ErrorCode::InitEmbeddingTableError,
        ErrorCode::TokenizeError,
        ErrorCode::DetokenizeError,
        ErrorCode::PreAttnPrefillError,
        ErrorCode::PreAttnDecodeError,
        ErrorCode::AttnError,
        ErrorCode::PostAttnPrefillError,
        ErrorCode::PostAttnDecodeError,
        ErrorCode::LmHeadError,
    ];

    /// Numeric value used by the engine
    pub fn as_i32(self) -> i32 {
        match self {
            ErrorCode::Disconnected => -2,
            ErrorCode::Failed => -1,
            ErrorCode::Success => 0,
            ErrorCode::Timeout => 1,
            ErrorCode::InvalidModel => 2,
            ErrorCode::InitVocabError => 3,
            ErrorCode::InitEmbeddingTableError => 4,
            ErrorCode::TokenizeError => 5,
            ErrorCode::DetokenizeError => 6,
            ErrorCode::PreAttnPrefillError => 7,
            ErrorCode::PreAttnDecodeError => 8,
            ErrorCode::AttnError => 9,
            ErrorCode::PostAttnPrefillError => 10,
            ErrorCode::PostAttnDecodeError => 11,
            ErrorCode::LmHeadError => 12,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|code| code.as_i32() == value)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Disconnected => "DISCONNECTED",
            ErrorCode::Failed => "FAILED",
            ErrorCode::Success => "SUCCESS",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::InvalidModel => "INVALID_MODEL",
            ErrorCode::InitVocabError => "INIT_VOCAB_ERROR",
            ErrorCode::InitEmbeddingTableError => "INIT_EMBEDDING_TABLE_ERROR",
            ErrorCode::TokenizeError => "TOKENIZE_ERROR",
            ErrorCode::DetokenizeError => "DETOKENIZE_ERROR",
            ErrorCode::PreAttnPrefillError => "PRE_ATTN_PREFILL_ERROR",
            ErrorCode::PreAttnDecodeError => "PRE_ATTN_DECODE_ERROR",
            ErrorCode::AttnError => "ATTN_ERROR",
            ErrorCode::PostAttnPrefillError => "POST_ATTN_PREFILL_ERROR",
            ErrorCode::PostAttnDecodeError => "POST_ATTN_DECODE_ERROR",
            ErrorCode::LmHeadError => "LM_HEAD_ERROR",
        }
    }

    /// Whether the code names a stage of the remote inference pipeline
    pub fn is_pipeline_stage(self) -> bool {
        matches!(
            self,
            ErrorCode::InitVocabError
                | ErrorCode::InitEmbeddingTableError
                | ErrorCode::TokenizeError
                | ErrorCode::DetokenizeError
                | ErrorCode::PreAttnPrefillError
                | ErrorCode::PreAttnDecodeError
                | ErrorCode::AttnError
                | ErrorCode::PostAttnPrefillError
                | ErrorCode::PostAttnDecodeError
                | ErrorCode::LmHeadError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<T> From<&Result<T>> for ErrorCode {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => ErrorCode::Success,
            Err(e) => e.code(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("cannot {operation} while session is {state}")]
    State {
        operation: Operation,
        state: SessionState,
    },

    #[error("engine reported {code}: {message}")]
    Engine { code: ErrorCode, message: String },

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("channel disconnected: {0}")]
    Disconnected(String),

    #[error("frame decode error: {0}")]
    Decode(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid argument '{parameter}': {message}")]
    InvalidArgument { parameter: String, message: String },

    #[error("configuration error for {parameter}: {message}")]
    Configuration { parameter: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub(crate) fn state(operation: Operation, state: SessionState) -> Self {
        SessionError::State { operation, state }
    }

    pub(crate) fn invalid_argument(parameter: &str, message: impl Into<String>) -> Self {
        SessionError::InvalidArgument {
            parameter: parameter.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn timeout(operation: &str, duration: Duration) -> Self {
        SessionError::Timeout {
            operation: operation.to_string(),
            duration,
        }
    }

    /// Map the error onto the status code reported to callers
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::Engine { code, .. } => *code,
            SessionError::InvalidModel(_) => ErrorCode::InvalidModel,
            SessionError::Timeout { .. } => ErrorCode::Timeout,
            SessionError::Disconnected(_) | SessionError::Io(_) => ErrorCode::Disconnected,
            SessionError::State { .. }
            | SessionError::Decode(_)
            | SessionError::Protocol(_)
            | SessionError::InvalidArgument { .. }
            | SessionError::Configuration { .. } => ErrorCode::Failed,
        }
    }

    /// Errors after which the frame stream can no longer be trusted
    pub fn is_channel_fault(&self) -> bool {
        matches!(
            self,
            SessionError::Disconnected(_)
                | SessionError::Io(_)
                | SessionError::Timeout { .. }
                | SessionError::Decode(_)
                | SessionError::Protocol(_)
        )
    }

    /// Contract violations detected locally, before any network activity
    pub fn is_state_error(&self) -> bool {
        matches!(self, SessionError::State { .. })
    }
}

impl From<bincode::Error> for SessionError {
    fn from(e: bincode::Error) -> Self {
        SessionError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SessionError::Engine {
            code: ErrorCode::AttnError,
            message: "attention kernel failed".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "engine reported ATTN_ERROR: attention kernel failed"
        );

        let error = SessionError::state(Operation::Execute, SessionState::Ready);
        assert_eq!(error.to_string(), "cannot execute while session is ready");
    }

    #[test]
    fn test_code_roundtrip() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_i32(code.as_i32()), Some(code));
        }
        assert_eq!(ErrorCode::from_i32(99), None);
        assert_eq!(ErrorCode::LmHeadError.as_i32(), 12);
        assert_eq!(ErrorCode::Failed.as_i32(), -1);
    }

    #[test]
    fn test_error_classification() {
        let error = SessionError::Disconnected("peer closed".to_string());
        assert_eq!(error.code(), ErrorCode::Disconnected);
        assert!(error.is_channel_fault());

        let error = SessionError::state(Operation::Input, SessionState::Loaded);
        assert_eq!(error.code(), ErrorCode::Failed);
        assert!(error.is_state_error());
        assert!(!error.is_channel_fault());

        let error = SessionError::Engine {
            code: ErrorCode::TokenizeError,
            message: String::new(),
        };
        assert!(error.code().is_pipeline_stage());
        assert!(!error.is_channel_fault());
    }

    #[test]
    fn test_code_from_result() {
        let ok: Result<()> = Ok(());
        assert_eq!(ErrorCode::from(&ok), ErrorCode::Success);

        let err: Result<()> = Err(SessionError::timeout("handshake", Duration::from_secs(1)));
        assert_eq!(ErrorCode::from(&err), ErrorCode::Timeout);
    }
}
