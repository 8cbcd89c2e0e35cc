//! Common type definitions used throughout the session runtime

mod cache;
mod chat;
mod model;
mod tensor;

use serde::{Deserialize, Serialize};

pub use cache::PrefixCache;
pub use chat::{
    ChatChoice, ChatChunk, ChatChunkSequence, ChatRequest, ChatResult, ChunkChoice, ChunkDelta,
    ChunkPosition, ContentPart, EngineMetrics, FinishReason, FunctionCall, Message,
    ResponseFormat, SamplingParams, ToolCall, Usage, ROLE_ASSISTANT, ROLE_SYSTEM, ROLE_USER,
};
pub use model::ModelKind;
pub use tensor::{BatchInferenceRequest, BatchInferenceResult, ElementType, NamedTensor};

/// A unit of work submitted through a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Chat(ChatRequest),
    BatchInference(BatchInferenceRequest),
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Chat(_) => RequestKind::Chat,
            Request::BatchInference(_) => RequestKind::BatchInference,
        }
    }
}

impl From<ChatRequest> for Request {
    fn from(request: ChatRequest) -> Self {
        Request::Chat(request)
    }
}

impl From<BatchInferenceRequest> for Request {
    fn from(request: BatchInferenceRequest) -> Self {
        Request::BatchInference(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Chat,
    BatchInference,
}

/// Output of one execute cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InferenceResult {
    Chat(ChatResult),
    ChatStream(ChatChunkSequence),
    BatchInference(BatchInferenceResult),
}

impl InferenceResult {
    pub fn into_chat(self) -> Option<ChatResult> {
        match self {
            InferenceResult::Chat(result) => Some(result),
            _ => None,
        }
    }

    pub fn into_chat_stream(self) -> Option<ChatChunkSequence> {
        match self {
            InferenceResult::ChatStream(sequence) => Some(sequence),
            _ => None,
        }
    }

    pub fn into_batch(self) -> Option<BatchInferenceResult> {
        match self {
            InferenceResult::BatchInference(result) => Some(result),
            _ => None,
        }
    }

    /// Token usage reported by the engine, when the result carries one
    pub fn usage(&self) -> Option<Usage> {
        match self {
            InferenceResult::Chat(result) => Some(result.usage),
            InferenceResult::ChatStream(sequence) => sequence.usage(),
            InferenceResult::BatchInference(_) => None,
        }
    }
}
