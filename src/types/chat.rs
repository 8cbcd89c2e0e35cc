//! Chat completion request/response values (OpenAI-compatible shapes)

use half::f16;
use serde::{Deserialize, Serialize};

pub const ROLE_SYSTEM: &str = "system";
pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub r#type: String,
    pub function: FunctionCall,
}

/// One part of a message's content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContentPart {
    Text(String),
    ImageUrl(String),
    /// Encoded audio payload
    InputAudio(String),
    /// Frame references of a video clip
    Video(Vec<String>),
    /// Raw image/video pixels in float16
    Pixels(Vec<f16>),
}

impl ContentPart {
    pub fn text(&self) -> Option<&str> {
        match self {
            ContentPart::Text(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: Vec<ContentPart>,
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: Vec<ContentPart>) -> Self {
        Self {
            role: role.into(),
            content,
            tool_calls: Vec::new(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(ROLE_SYSTEM, vec![ContentPart::Text(text.into())])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(ROLE_USER, vec![ContentPart::Text(text.into())])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(ROLE_ASSISTANT, vec![ContentPart::Text(text.into())])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFormat {
    pub r#type: String,
    pub json_schema: Option<String>,
    pub regex: Option<String>,
}

/// Sampling controls forwarded verbatim to the engine's sampler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub meta_top_k: u32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub repetition_penalty: f32,
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 50,
            meta_top_k: 100,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            repetition_penalty: 1.0,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// Tool declarations, each a JSON document
    pub tools: Vec<String>,
    pub model: String,
    pub max_completion_tokens: Option<u32>,
    pub response_format: Option<ResponseFormat>,
    pub sampling: SamplingParams,
    pub stream: bool,
    pub ignore_eos: bool,
    /// Disable CPU/NPU parallel execution on the engine
    pub no_cpu_npu_parallel: bool,
    /// Ignore any cached prefix and recompute attention state
    pub no_prefix_cache: bool,
    pub imu: Vec<Vec<f32>>,
    pub fps: f32,
    pub data_type: String,
}

impl Default for ChatRequest {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            tools: Vec::new(),
            model: String::new(),
            max_completion_tokens: None,
            response_format: None,
            sampling: SamplingParams::default(),
            stream: false,
            ignore_eos: false,
            no_cpu_npu_parallel: false,
            no_prefix_cache: false,
            imu: Vec::new(),
            fps: 1.0,
            data_type: "image".to_string(),
        }
    }
}

impl ChatRequest {
    /// Single-turn request with one user message
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::user(text)],
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    /// Generation was cancelled by an abort request
    Aborted,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq<&str> for FinishReason {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.total_tokens == self.prompt_tokens + self.completion_tokens
    }
}

/// Engine-side timing, in seconds and tokens per second
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub prefill_time: f64,
    pub prefill_speed: f64,
    pub decode_time: f64,
    pub decode_speed: f64,
    /// Vision encoder time
    pub ve_time: f64,
    pub preprocess_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub finish_reason: FinishReason,
    pub role: String,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

/// Complete (non-streamed) chat result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResult {
    pub id: String,
    pub created: i64,
    pub model: String,
    pub system_fingerprint: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
    pub metric: EngineMetrics,
}

impl ChatResult {
    /// Text of the first choice, if any
    pub fn text(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.content.as_deref())
    }
}

/// Incremental update; at most one of `role`/`content` is present
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    pub role: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChunk {
    pub id: String,
    pub created: i64,
    pub model: String,
    pub system_fingerprint: String,
    pub choices: Vec<ChunkChoice>,
    /// Present on the terminal chunk
    pub usage: Option<Usage>,
    pub metric: Option<EngineMetrics>,
}

/// Where a chunk sits in its sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPosition {
    First,
    Subsequent,
}

impl ChatChunk {
    pub fn choice(&self) -> Option<&ChunkChoice> {
        self.choices.first()
    }

    pub fn role(&self) -> Option<&str> {
        self.choice().and_then(|c| c.delta.role.as_deref())
    }

    pub fn content(&self) -> Option<&str> {
        self.choice().and_then(|c| c.delta.content.as_deref())
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.choice().and_then(|c| c.finish_reason)
    }

    pub fn is_terminal(&self) -> bool {
        self.finish_reason().is_some()
    }

    /// Check the chunk against the streaming shape rules for its position.
    ///
    /// A first chunk carries the role and no content, unless it is already
    /// terminal. Later chunks never carry a role. Terminal chunks carry no
    /// content.
    pub fn check_shape(&self, position: ChunkPosition) -> std::result::Result<(), String> {
        if self.choices.len() != 1 {
            return Err(format!(
                "expected exactly one choice per chunk, got {}",
                self.choices.len()
            ));
        }
        let delta = &self.choices[0].delta;
        if delta.role.is_some() && delta.content.is_some() {
            return Err("chunk carries both role and content".to_string());
        }
        if self.is_terminal() {
            if delta.content.is_some() {
                return Err("terminal chunk carries content".to_string());
            }
            if position == ChunkPosition::Subsequent && delta.role.is_some() {
                return Err("terminal chunk carries a role".to_string());
            }
            return Ok(());
        }
        match position {
            ChunkPosition::First => {
                if delta.role.is_none() {
                    return Err("first chunk is missing the role".to_string());
                }
            }
            ChunkPosition::Subsequent => {
                if delta.role.is_some() {
                    return Err("role repeated after the first chunk".to_string());
                }
            }
        }
        Ok(())
    }
}

/// Ordered chunks of one streamed completion, terminal chunk last.
///
/// Only obtainable by issuing the request again; it cannot be replayed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatChunkSequence {
    pub chunks: Vec<ChatChunk>,
}

impl ChatChunkSequence {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn role(&self) -> Option<&str> {
        self.chunks.first().and_then(|c| c.role())
    }

    /// Concatenated content fragments
    pub fn text(&self) -> String {
        self.chunks.iter().filter_map(|c| c.content()).collect()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.chunks.last().and_then(|c| c.finish_reason())
    }

    pub fn usage(&self) -> Option<Usage> {
        self.chunks.last().and_then(|c| c.usage)
    }

    /// Validate the whole sequence: shape rules, a single terminal chunk at
    /// the end and a constant choice index
    pub fn validate(&self) -> std::result::Result<(), String> {
        let Some(first) = self.chunks.first() else {
            return Err("empty chunk sequence".to_string());
        };
        let index = first.choice().map(|c| c.index);
        for (i, chunk) in self.chunks.iter().enumerate() {
            let position = if i == 0 {
                ChunkPosition::First
            } else {
                ChunkPosition::Subsequent
            };
            chunk.check_shape(position).map_err(|e| format!("chunk {}: {}", i, e))?;
            if chunk.choice().map(|c| c.index) != index {
                return Err(format!("chunk {}: choice index changed", i));
            }
            let last = i + 1 == self.chunks.len();
            if chunk.is_terminal() != last {
                return Err(format!("chunk {}: terminal chunk must be last", i));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(role: Option<&str>, content: Option<&str>, finish: Option<FinishReason>) -> ChatChunk {
        ChatChunk {
            id: "chatcmpl-1".to_string(),
            created: 0,
            model: "qwen".to_string(),
            system_fingerprint: String::new(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: role.map(str::to_string),
                    content: content.map(str::to_string),
                },
                finish_reason: finish,
            }],
            usage: None,
            metric: None,
        }
    }

    #[test]
    fn test_chunk_shape_rules() {
        assert!(chunk(Some("assistant"), None, None)
            .check_shape(ChunkPosition::First)
            .is_ok());
        assert!(chunk(None, Some("Hi"), None)
            .check_shape(ChunkPosition::First)
            .is_err());
        assert!(chunk(Some("assistant"), None, None)
            .check_shape(ChunkPosition::Subsequent)
            .is_err());
        assert!(chunk(None, Some("x"), Some(FinishReason::Stop))
            .check_shape(ChunkPosition::Subsequent)
            .is_err());
        assert!(chunk(None, None, Some(FinishReason::Aborted))
            .check_shape(ChunkPosition::First)
            .is_ok());
    }

    #[test]
    fn test_sequence_validation() {
        let sequence = ChatChunkSequence {
            chunks: vec![
                chunk(Some("assistant"), None, None),
                chunk(None, Some("Hel"), None),
                chunk(None, Some("lo"), None),
                chunk(None, None, Some(FinishReason::Stop)),
            ],
        };
        assert!(sequence.validate().is_ok());
        assert_eq!(sequence.text(), "Hello");
        assert_eq!(sequence.role(), Some("assistant"));
        assert_eq!(sequence.finish_reason(), Some(FinishReason::Stop));

        let truncated = ChatChunkSequence {
            chunks: sequence.chunks[..3].to_vec(),
        };
        assert!(truncated.validate().is_err());
    }

    #[test]
    fn test_usage_consistency() {
        assert!(Usage::new(12, 30).is_consistent());
        let broken = Usage {
            prompt_tokens: 1,
            completion_tokens: 1,
            total_tokens: 3,
        };
        assert!(!broken.is_consistent());
    }

    #[test]
    fn test_finish_reason_strings() {
        assert_eq!(FinishReason::Stop, "stop");
        assert_eq!(FinishReason::Aborted.to_string(), "aborted");
    }
}
