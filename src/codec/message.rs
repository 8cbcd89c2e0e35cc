//! Typed frame payloads and their bincode serialization

use bincode::Options;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::frame::{read_frame, write_frame, FrameTag};
use crate::error::{ErrorCode, Result, SessionError};
use crate::types::{
    BatchInferenceRequest, BatchInferenceResult, ChatChunk, ChatRequest, ChatResult,
    PrefixCache, Request,
};

/// Commands carried by a `REQUEST` frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineCommand {
    Init {
        model_id: i32,
        model_path: String,
        context_length: u32,
    },
    Terminate,
    Chat { request: ChatRequest, stream: bool },
    Batch(BatchInferenceRequest),
}

/// Payload of a `RESPONSE_FULL` frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineResponse {
    Chat(ChatResult),
    Batch(BatchInferenceResult),
}

/// Payload of an `ERROR` frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorReport {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn into_error(self) -> SessionError {
        match self.code {
            ErrorCode::InvalidModel => SessionError::InvalidModel(self.message),
            code => SessionError::Engine {
                code,
                message: self.message,
            },
        }
    }
}

/// One decoded unit of wire communication
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(EngineCommand),
    ResponseFull(EngineResponse),
    ResponseChunk(ChatChunk),
    Error(ErrorReport),
    Abort,
    CacheSaveRequest { token_count: u32 },
    CacheSaveResponse(PrefixCache),
    CacheLoadRequest(PrefixCache),
    Ack,
}

impl Frame {
    pub fn tag(&self) -> FrameTag {
        match self {
            Frame::Request(_) => FrameTag::Request,
            Frame::ResponseFull(_) => FrameTag::ResponseFull,
            Frame::ResponseChunk(_) => FrameTag::ResponseChunk,
            Frame::Error(_) => FrameTag::Error,
            Frame::Abort => FrameTag::Abort,
            Frame::CacheSaveRequest { .. } => FrameTag::CacheSaveRequest,
            Frame::CacheSaveResponse(_) => FrameTag::CacheSaveResponse,
            Frame::CacheLoadRequest(_) => FrameTag::CacheLoadRequest,
            Frame::Ack => FrameTag::Ack,
        }
    }
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
}

fn to_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    options()
        .serialize(value)
        .map_err(|e| SessionError::invalid_argument("payload", e.to_string()))
}

fn from_payload<T: DeserializeOwned>(tag: FrameTag, payload: &[u8]) -> Result<T> {
    options()
        .deserialize(payload)
        .map_err(|e| SessionError::Decode(format!("{} payload: {}", tag, e)))
}

/// Encode a typed frame into framed bytes
pub fn encode(frame: &Frame) -> Result<Bytes> {
    let payload = match frame {
        Frame::Request(command) => to_payload(command)?,
        Frame::ResponseFull(response) => to_payload(response)?,
        Frame::ResponseChunk(chunk) => to_payload(chunk)?,
        Frame::Error(report) => to_payload(report)?,
        Frame::CacheSaveRequest { token_count } => to_payload(token_count)?,
        Frame::CacheSaveResponse(cache) | Frame::CacheLoadRequest(cache) => to_payload(cache)?,
        Frame::Abort | Frame::Ack => Vec::new(),
    };
    write_frame(frame.tag(), &payload)
}

/// Decode framed bytes into a typed frame
pub fn decode(bytes: &[u8]) -> Result<Frame> {
    let (tag, payload) = read_frame(bytes)?;
    let frame = match tag {
        FrameTag::Request => Frame::Request(from_payload(tag, payload)?),
        FrameTag::ResponseFull => Frame::ResponseFull(from_payload(tag, payload)?),
        FrameTag::ResponseChunk => Frame::ResponseChunk(from_payload(tag, payload)?),
        FrameTag::Error => Frame::Error(from_payload(tag, payload)?),
        FrameTag::CacheSaveRequest => Frame::CacheSaveRequest {
            token_count: from_payload(tag, payload)?,
        },
        FrameTag::CacheSaveResponse => Frame::CacheSaveResponse(from_payload(tag, payload)?),
        FrameTag::CacheLoadRequest => Frame::CacheLoadRequest(from_payload(tag, payload)?),
        FrameTag::Abort | FrameTag::Ack => {
            if !payload.is_empty() {
                return Err(SessionError::Decode(format!(
                    "{} frame carries {} unexpected payload bytes",
                    tag,
                    payload.len()
                )));
            }
            if tag == FrameTag::Abort {
                Frame::Abort
            } else {
                Frame::Ack
            }
        }
    };
    Ok(frame)
}

/// Encode a caller request as a `REQUEST` frame
pub fn encode_request(request: &Request, stream: bool) -> Result<Bytes> {
    let command = match request {
        Request::Chat(chat) => EngineCommand::Chat {
            request: chat.clone(),
            stream,
        },
        Request::BatchInference(batch) => EngineCommand::Batch(batch.clone()),
    };
    encode(&Frame::Request(command))
}
