//! Test helpers: value builders and a scripted in-process engine that speaks
//! the real wire protocol over `tokio::io::duplex`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use half::f16;

use crate::channel::{Channel, Connector};
use crate::codec::{EngineCommand, EngineResponse, ErrorReport, Frame};
use crate::config::SessionConfig;
use crate::error::{ErrorCode, Result};
use crate::session::Session;
use crate::types::{
    BatchInferenceRequest, BatchInferenceResult, ChatChoice, ChatChunk, ChatRequest, ChatResult,
    ChunkChoice, ChunkDelta, ContentPart, EngineMetrics, FinishReason, ModelKind, PrefixCache,
    Usage, ROLE_ASSISTANT,
};

/// Content fragments the mock engine generates, one token each
pub(crate) const REPLY: [&str; 5] = ["Hello", "!", " How", " can I", " help?"];

pub(crate) fn chunk(
    role: Option<&str>,
    content: Option<&str>,
    finish_reason: Option<FinishReason>,
) -> ChatChunk {
    ChatChunk {
        id: "chatcmpl-test".to_string(),
        created: 1_700_000_000,
        model: "qwen".to_string(),
        system_fingerprint: "fp_test".to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                role: role.map(str::to_string),
                content: content.map(str::to_string),
            },
            finish_reason,
        }],
        usage: None,
        metric: None,
    }
}

pub(crate) fn chat_result(text: &str) -> ChatResult {
    ChatResult {
        id: "chatcmpl-test".to_string(),
        created: 1_700_000_000,
        model: "qwen".to_string(),
        system_fingerprint: "fp_test".to_string(),
        choices: vec![ChatChoice {
            index: 0,
            finish_reason: FinishReason::Stop,
            role: ROLE_ASSISTANT.to_string(),
            content: Some(text.to_string()),
            tool_calls: Vec::new(),
        }],
        usage: Usage::new(3, 2),
        metric: EngineMetrics::default(),
    }
}

fn kv_value(layer: usize, token: i32, offset: usize, plane: usize) -> f16 {
    // Small integers are exact in f16
    let value = (layer * 31 + token as usize * 7 + offset * 3 + plane) % 2048;
    f16::from_f32(value as f32)
}

fn cache_for(token_ids: &[i32], layers: usize, width: usize) -> PrefixCache {
    let plane = |kind: usize| -> Vec<Vec<f16>> {
        (0..layers)
            .map(|layer| {
                token_ids
                    .iter()
                    .flat_map(|&token| (0..width).map(move |j| kv_value(layer, token, j, kind)))
                    .collect()
            })
            .collect()
    };
    PrefixCache {
        k_cache: plane(0),
        v_cache: plane(1),
        token_ids: token_ids.to_vec(),
    }
}

pub(crate) fn prefix_cache(layers: usize, tokens: usize, width: usize) -> PrefixCache {
    let ids: Vec<i32> = (1..=tokens as i32).collect();
    cache_for(&ids, layers, width)
}

/// Timeouts short enough for tests
pub(crate) fn test_config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.timeouts.connect = Duration::from_secs(1);
    config.timeouts.handshake = Duration::from_secs(1);
    config.timeouts.receive = Duration::from_secs(1);
    config.timeouts.terminate = Duration::from_millis(200);
    config.streaming.queue_capacity = 4;
    config.limits.max_frame_bytes = 4 * 1024 * 1024;
    config
}

#[derive(Debug, Clone)]
pub(crate) struct MockBehaviour {
    /// Answer chat and batch requests with this stage error
    pub stage_error: Option<ErrorCode>,
    /// Model id the engine refuses to load
    pub rejected_model: Option<i32>,
    /// Never answer chat requests
    pub hang: bool,
    /// Drop the connection after sending this many chunks (0 drops before
    /// any reply, also for non-streaming requests)
    pub sever_after_chunks: Option<usize>,
    /// Pause before each generated fragment, listening for `ABORT`
    pub chunk_delay: Duration,
    pub layers: usize,
    pub width: usize,
}

impl Default for MockBehaviour {
    fn default() -> Self {
        Self {
            stage_error: None,
            rejected_model: None,
            hang: false,
            sever_after_chunks: None,
            chunk_delay: Duration::ZERO,
            layers: 4,
            width: 8,
        }
    }
}

/// Hands out channels wired to fresh mock engines
pub(crate) struct MockConnector {
    behaviour: MockBehaviour,
    connections: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new(behaviour: MockBehaviour) -> Self {
        Self {
            behaviour,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn connections(&self) -> Arc<AtomicUsize> {
        self.connections.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<Channel> {
        let (client, server) = tokio::io::duplex(1 << 20);
        self.connections.fetch_add(1, Ordering::SeqCst);
        let engine = MockEngine {
            channel: Channel::new(server, config.limits.max_frame_bytes),
            behaviour: self.behaviour.clone(),
            resident: Vec::new(),
            next_token: 1,
        };
        tokio::spawn(engine.run());
        Ok(Channel::new(client, config.limits.max_frame_bytes))
    }
}

pub(crate) fn mock_session(behaviour: MockBehaviour) -> Session {
    mock_session_with(behaviour, test_config())
}

pub(crate) fn mock_session_with(behaviour: MockBehaviour, config: SessionConfig) -> Session {
    Session::builder()
        .with_config(config)
        .with_connector(MockConnector::new(behaviour))
        .build()
        .unwrap()
}

/// A session already initialized with the Qwen model
pub(crate) async fn ready_session(behaviour: MockBehaviour) -> Session {
    let mut session = mock_session(behaviour);
    session
        .init(ModelKind::Qwen, "/models/qwen", 4096)
        .await
        .unwrap();
    session
}

enum Poll {
    Idle,
    Aborted,
    Closed,
}

struct MockEngine {
    channel: Channel,
    behaviour: MockBehaviour,
    resident: Vec<i32>,
    next_token: i32,
}

impl MockEngine {
    async fn run(mut self) {
        loop {
            let frame = match self.channel.receive(Duration::from_secs(30)).await {
                Ok(frame) => frame,
                Err(_) => return,
            };
            let open = match frame {
                Frame::Request(EngineCommand::Init { model_id, .. }) => {
                    self.resident.clear();
                    let known = ModelKind::from_id(model_id).is_ok();
                    if known && self.behaviour.rejected_model != Some(model_id) {
                        self.reply(Frame::Ack).await
                    } else {
                        let report = ErrorReport::new(
                            ErrorCode::InvalidModel,
                            format!("unknown model id {}", model_id),
                        );
                        self.reply(Frame::Error(report)).await
                    }
                }
                Frame::Request(EngineCommand::Terminate) => {
                    let _ = self.reply(Frame::Ack).await;
                    false
                }
                Frame::Request(EngineCommand::Chat { request, stream }) => {
                    self.chat(request, stream).await
                }
                Frame::Request(EngineCommand::Batch(request)) => self.batch(request).await,
                Frame::CacheSaveRequest { token_count } => self.save(token_count as usize).await,
                Frame::CacheLoadRequest(cache) => {
                    self.resident = cache.token_ids;
                    self.next_token = self.resident.iter().max().map_or(1, |max| max + 1);
                    self.reply(Frame::Ack).await
                }
                // Nothing in flight
                Frame::Abort => true,
                other => {
                    let report = ErrorReport::new(
                        ErrorCode::Failed,
                        format!("unexpected {} frame", other.tag()),
                    );
                    self.reply(Frame::Error(report)).await
                }
            };
            if !open {
                return;
            }
        }
    }

    async fn reply(&self, frame: Frame) -> bool {
        self.channel.send_frame(&frame).await.is_ok()
    }

    fn take_tokens(&mut self, count: usize) {
        for _ in 0..count {
            self.resident.push(self.next_token);
            self.next_token += 1;
        }
    }

    /// Wait out the fragment delay while listening for `ABORT`
    async fn poll_abort(&mut self) -> Poll {
        let delay = self.behaviour.chunk_delay;
        match tokio::time::timeout(delay, self.channel.receive(Duration::from_secs(30))).await {
            Ok(Ok(Frame::Abort)) => Poll::Aborted,
            Ok(Ok(_)) | Err(_) => Poll::Idle,
            Ok(Err(_)) => Poll::Closed,
        }
    }

    fn severed(&self, sent: usize) -> bool {
        self.behaviour.sever_after_chunks == Some(sent)
    }

    async fn chat(&mut self, request: ChatRequest, stream: bool) -> bool {
        if self.behaviour.hang {
            return true;
        }
        if let Some(code) = self.behaviour.stage_error {
            let report = ErrorReport::new(code, format!("{} in mock engine", code));
            return self.reply(Frame::Error(report)).await;
        }
        if self.severed(0) {
            return false;
        }

        let words: usize = request
            .messages
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(ContentPart::text)
            .map(|text| text.split_whitespace().count())
            .sum();
        let prompt_tokens = (self.resident.len() + words) as u32;
        self.take_tokens(words);

        let mut sent = 0;
        if stream {
            if !self.reply(Frame::ResponseChunk(chunk(Some(ROLE_ASSISTANT), None, None))).await {
                return false;
            }
            sent += 1;
            if self.severed(sent) {
                return false;
            }
        }

        let mut text = String::new();
        let mut finish_reason = FinishReason::Stop;
        for fragment in REPLY {
            match self.poll_abort().await {
                Poll::Idle => {}
                Poll::Aborted => {
                    finish_reason = FinishReason::Aborted;
                    break;
                }
                Poll::Closed => return false,
            }
            self.take_tokens(1);
            text.push_str(fragment);
            if stream {
                if !self.reply(Frame::ResponseChunk(chunk(None, Some(fragment), None))).await {
                    return false;
                }
                sent += 1;
                if self.severed(sent) {
                    return false;
                }
            }
        }

        let usage = Usage::new(prompt_tokens, self.resident.len() as u32 - prompt_tokens);
        if stream {
            let mut last = chunk(None, None, Some(finish_reason));
            last.usage = Some(usage);
            last.metric = Some(EngineMetrics::default());
            return self.reply(Frame::ResponseChunk(last)).await;
        }

        let mut result = chat_result(&text);
        result.choices[0].finish_reason = finish_reason;
        result.usage = usage;
        self.reply(Frame::ResponseFull(EngineResponse::Chat(result))).await
    }

    async fn batch(&mut self, request: BatchInferenceRequest) -> bool {
        if let Some(code) = self.behaviour.stage_error {
            let report = ErrorReport::new(code, "batch inference failed");
            return self.reply(Frame::Error(report)).await;
        }
        let tensors = request
            .tensors
            .into_iter()
            .enumerate()
            .map(|(i, mut tensor)| {
                tensor.name = format!("output{}", i);
                tensor
            })
            .collect();
        let result = BatchInferenceResult {
            case_name: request.case_name,
            tensors,
        };
        self.reply(Frame::ResponseFull(EngineResponse::Batch(result))).await
    }

    async fn save(&mut self, token_count: usize) -> bool {
        if token_count > self.resident.len() {
            let report = ErrorReport::new(
                ErrorCode::InvalidModel,
                format!(
                    "{} tokens requested, {} resident",
                    token_count,
                    self.resident.len()
                ),
            );
            return self.reply(Frame::Error(report)).await;
        }
        let start = self.resident.len() - token_count;
        let cache = cache_for(
            &self.resident[start..],
            self.behaviour.layers,
            self.behaviour.width,
        );
        self.reply(Frame::CacheSaveResponse(cache)).await
    }
}
