use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use super::state::{Operation, SessionState};
use crate::channel::{Channel, ChannelWriter, Connector};
use crate::codec::{encode_request, EngineCommand, Frame};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::processing::{
    cache, expect_ack, spawn_stream, ChunkSink, DemuxEvent, Demultiplexer, StreamOutcome,
    StreamSettings,
};
use crate::types::{FinishReason, InferenceResult, ModelKind, PrefixCache, Request, RequestKind};

/// An encoded request waiting for `execute`
struct PendingRequest {
    frame: Bytes,
    kind: RequestKind,
    streaming: bool,
}

/// Background receive path of a streaming request
struct ActiveStream {
    handle: JoinHandle<StreamOutcome>,
    started: Instant,
}

/// One model handle driving one engine connection.
///
/// Control operations take `&mut self`: a session has a single writer. The
/// only concurrency is the background receive path of a streaming request,
/// which the session reaps on its next call.
pub struct Session {
    config: Arc<SessionConfig>,
    connector: Arc<dyn Connector>,
    state: SessionState,
    model: Option<ModelKind>,
    context_length: u32,
    channel: Option<Channel>,
    pending: Option<PendingRequest>,
    last_result: Option<Result<InferenceResult>>,
    stream: Option<ActiveStream>,
    sink: Option<Box<dyn ChunkSink>>,
    resident_tokens: Option<usize>,
    fresh: bool,
    executing: Arc<AtomicBool>,
    /// Bumped before each request is sent
    generation: Arc<AtomicU64>,
    metrics: Arc<MetricsCollector>,
}

impl Session {
    pub(crate) fn from_parts(
        config: Arc<SessionConfig>,
        connector: Arc<dyn Connector>,
        sink: Option<Box<dyn ChunkSink>>,
    ) -> Self {
        let metrics = Arc::new(MetricsCollector::new(config.monitoring.enable_metrics));
        Self {
            config,
            connector,
            state: SessionState::Uninitialized,
            model: None,
            context_length: 0,
            channel: None,
            pending: None,
            last_result: None,
            stream: None,
            sink,
            resident_tokens: None,
            fresh: false,
            executing: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            metrics,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn model(&self) -> Option<ModelKind> {
        self.model
    }

    pub fn context_length(&self) -> u32 {
        self.context_length
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Tokens the engine is known to hold for this session, if known
    pub fn resident_tokens(&self) -> Option<usize> {
        self.resident_tokens
    }

    /// Non-blocking health check
    pub fn is_connected(&self) -> bool {
        self.channel.as_ref().map_or(false, Channel::healthy)
    }

    /// Whether a streamed request's terminal chunk can be collected without
    /// waiting
    pub fn result_ready(&self) -> bool {
        match self.state {
            SessionState::Ready => self.last_result.is_some(),
            SessionState::Executing => self
                .stream
                .as_ref()
                .map_or(false, |stream| stream.handle.is_finished()),
            _ => false,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn metrics_collector(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    /// Install the sink that receives chunks of streaming requests.
    ///
    /// Takes effect from the next `execute`.
    pub fn set_sink(&mut self, sink: impl ChunkSink + 'static) {
        self.sink = Some(Box::new(sink));
    }

    pub fn clear_sink(&mut self) -> Option<Box<dyn ChunkSink>> {
        self.sink.take()
    }

    /// Open the channel and load `model` on the engine
    pub async fn init(
        &mut self,
        model: ModelKind,
        model_path: impl AsRef<Path>,
        context_length: u32,
    ) -> Result<()> {
        self.reap();
        self.check(Operation::Init)?;
        if context_length == 0 {
            return Err(SessionError::invalid_argument(
                "context_length",
                "must be greater than zero",
            ));
        }
        let model_path = model_path.as_ref().to_string_lossy().into_owned();

        let previous = self.state;
        self.transition(SessionState::Connecting);
        let handshake = Self::handshake(
            self.connector.clone(),
            self.config.clone(),
            model,
            model_path,
            context_length,
        );
        match handshake.await {
            Ok(channel) => {
                self.channel = Some(channel);
                self.model = Some(model);
                self.context_length = context_length;
                self.pending = None;
                self.last_result = None;
                self.resident_tokens = None;
                self.fresh = true;
                self.transition(SessionState::Ready);
                info!(model = %model, context_length, "Session initialized");
                Ok(())
            }
            Err(e) => {
                warn!(model = %model, "Init failed: {}", e);
                self.transition(previous);
                Err(e)
            }
        }
    }

    /// Borrows nothing from the session, which holds a `!Sync` sink
    async fn handshake(
        connector: Arc<dyn Connector>,
        config: Arc<SessionConfig>,
        model: ModelKind,
        model_path: String,
        context_length: u32,
    ) -> Result<Channel> {
        let mut channel = connector.connect(&config).await?;
        let timeout = config.timeouts.handshake;
        let command = Frame::Request(EngineCommand::Init {
            model_id: model.id(),
            model_path,
            context_length,
        });

        let exchange = async {
            channel.send_frame(&command).await?;
            let reply = channel.receive(timeout).await?;
            expect_ack(reply, "init")
        };
        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(Err(SessionError::Timeout { .. })) | Err(_) => {
                Err(SessionError::timeout("handshake", timeout))
            }
            Ok(result) => result,
        };

        match result {
            Ok(()) => Ok(channel),
            Err(e) => {
                channel.close().await;
                Err(e)
            }
        }
    }

    /// Buffer one request for the next `execute`
    pub fn input(&mut self, request: impl Into<Request>, streaming: bool) -> Result<()> {
        self.reap();
        self.ensure_connected()?;
        self.check(Operation::Input)?;
        if self.last_result.is_some() {
            // The previous result has not been collected yet
            return Err(SessionError::state(Operation::Input, self.state));
        }
        let model = self
            .model
            .ok_or_else(|| SessionError::state(Operation::Input, self.state))?;

        let mut request = request.into();
        match &mut request {
            Request::Chat(chat) => {
                if model.is_vision_cnn() {
                    return Err(SessionError::invalid_argument(
                        "request",
                        format!("{} takes batch inference requests", model),
                    ));
                }
                if chat.messages.is_empty() {
                    return Err(SessionError::invalid_argument(
                        "messages",
                        "chat request carries no messages",
                    ));
                }
                chat.stream = streaming;
            }
            Request::BatchInference(batch) => {
                if !model.is_vision_cnn() {
                    return Err(SessionError::invalid_argument(
                        "request",
                        format!("{} takes chat requests", model),
                    ));
                }
                if streaming {
                    return Err(SessionError::invalid_argument(
                        "streaming",
                        "batch inference results cannot be streamed",
                    ));
                }
                batch.validate()?;
            }
        }

        let frame = encode_request(&request, streaming)?;
        self.pending = Some(PendingRequest {
            frame,
            kind: request.kind(),
            streaming,
        });
        self.fresh = false;
        self.transition(SessionState::Loaded);
        Ok(())
    }

    /// Send the buffered request.
    ///
    /// Non-streaming requests complete before this returns. Streaming
    /// requests return once the first chunk has been decoded; the rest is
    /// delivered to the sink in the background.
    pub async fn execute(&mut self) -> Result<()> {
        self.reap();
        self.ensure_connected()?;
        self.check(Operation::Execute)?;
        let pending = self
            .pending
            .take()
            .ok_or_else(|| SessionError::state(Operation::Execute, self.state))?;

        let started = Instant::now();
        self.metrics.record_request();
        self.generation.fetch_add(1, Ordering::SeqCst);
        let sent = match self.channel.as_ref() {
            Some(channel) => channel.send(&pending.frame).await,
            None => Err(SessionError::Disconnected("no channel".to_string())),
        };
        if let Err(e) = sent {
            return Err(self.fail_request(e).await);
        }

        self.executing.store(true, Ordering::SeqCst);
        self.transition(SessionState::Executing);
        let demux = Demultiplexer::new(pending.kind, pending.streaming);
        if pending.streaming {
            self.start_stream(demux, started).await
        } else {
            self.receive_full(demux, started).await
        }
    }

    async fn receive_full(&mut self, mut demux: Demultiplexer, started: Instant) -> Result<()> {
        let timeout = self.config.timeouts.receive;
        let received = match self.channel.as_mut() {
            Some(channel) => channel.receive(timeout).await,
            None => Err(SessionError::Disconnected("no channel".to_string())),
        };
        let result = received.and_then(|frame| match demux.accept(frame)? {
            DemuxEvent::Complete(result) => Ok(result),
            DemuxEvent::Chunk { .. } => Err(SessionError::Protocol(
                "chunk received for a non-streaming request".to_string(),
            )),
        });
        self.executing.store(false, Ordering::SeqCst);

        match result {
            Ok(result) => {
                self.record_result(&result, started);
                self.last_result = Some(Ok(result));
                self.transition(SessionState::Ready);
                Ok(())
            }
            Err(e) => Err(self.fail_request(e).await),
        }
    }

    async fn start_stream(&mut self, demux: Demultiplexer, started: Instant) -> Result<()> {
        let reader = match self.channel.as_mut().and_then(Channel::take_reader) {
            Some(reader) => reader,
            None => {
                let error = SessionError::Protocol("receive path is unavailable".to_string());
                return Err(self.fail_request(error).await);
            }
        };

        let (first_tx, first_rx) = oneshot::channel();
        let settings = StreamSettings {
            receive_timeout: self.config.timeouts.receive,
            queue_capacity: self.config.streaming.queue_capacity,
        };
        let handle = spawn_stream(
            reader,
            demux,
            self.sink.take(),
            settings,
            first_tx,
            self.executing.clone(),
            self.metrics.clone(),
        );

        if first_rx.await.is_ok() {
            self.stream = Some(ActiveStream { handle, started });
            return Ok(());
        }

        // The stream ended before producing a chunk, so it carries the error
        let joined = handle.await;
        self.complete_stream(joined, started).map(|_| ())
    }

    /// Collect the result of the last execute cycle.
    ///
    /// While a streaming request is still running this waits for its
    /// terminal chunk and returns the whole sequence.
    pub async fn output(&mut self) -> Result<InferenceResult> {
        self.reap();
        self.ensure_connected()?;
        self.check(Operation::Output)?;

        if self.state == SessionState::Executing {
            let stream = self
                .stream
                .take()
                .ok_or_else(|| SessionError::state(Operation::Output, self.state))?;
            let joined = stream.handle.await;
            return self.complete_stream(joined, stream.started);
        }

        self.last_result
            .take()
            .unwrap_or_else(|| Err(SessionError::state(Operation::Output, self.state)))
    }

    /// `input`, `execute` and `output` in one call
    pub async fn run(&mut self, request: impl Into<Request>, streaming: bool) -> Result<InferenceResult> {
        self.input(request, streaming)?;
        self.execute().await?;
        self.output().await
    }

    /// Ask the engine to cancel the in-flight request.
    ///
    /// Returns without waiting; the cancellation shows up as a terminal
    /// result with an aborted finish reason.
    pub fn abort(&mut self) -> Result<()> {
        self.reap();
        self.ensure_connected()?;
        self.check(Operation::Abort)?;
        let handle = self.abort_handle()?;
        if !handle.abort() {
            debug!("Request finished before the abort was sent");
        }
        Ok(())
    }

    /// A cloneable handle that can abort requests from other tasks, including
    /// a non-streaming `execute` that holds the session
    pub fn abort_handle(&self) -> Result<AbortHandle> {
        if self.state == SessionState::Disconnected {
            return Err(self.disconnected_error());
        }
        let writer = self
            .channel
            .as_ref()
            .map(Channel::writer)
            .ok_or_else(|| SessionError::state(Operation::Abort, self.state))?;
        Ok(AbortHandle {
            writer,
            executing: self.executing.clone(),
            generation: self.generation.clone(),
        })
    }

    /// Fetch the key/value cache of the last `token_count` resident tokens
    pub async fn save_kv_cache(&mut self, token_count: u32) -> Result<PrefixCache> {
        self.reap();
        self.ensure_connected()?;
        self.check(Operation::SaveCache)?;
        if token_count == 0 {
            return Err(SessionError::invalid_argument(
                "token_count",
                "must be greater than zero",
            ));
        }
        if let Some(resident) = self.resident_tokens {
            if token_count as usize > resident {
                return Err(SessionError::InvalidModel(format!(
                    "{} tokens requested but only {} are resident",
                    token_count, resident
                )));
            }
        }

        let timeout = self.config.timeouts.receive;
        let saved = match self.channel.as_mut() {
            Some(channel) => cache::save(channel, token_count, timeout).await,
            None => Err(SessionError::Disconnected("no channel".to_string())),
        };
        self.settle(saved).await
    }

    /// Restore a saved cache; only valid right after `init`
    pub async fn load_kv_cache(&mut self, prefix: &PrefixCache) -> Result<()> {
        self.reap();
        self.ensure_connected()?;
        self.check(Operation::LoadCache)?;
        if !self.fresh {
            return Err(SessionError::state(Operation::LoadCache, self.state));
        }
        cache::check_loadable(prefix, self.context_length)?;

        let timeout = self.config.timeouts.receive;
        let loaded = match self.channel.as_mut() {
            Some(channel) => cache::load(channel, prefix, timeout).await,
            None => Err(SessionError::Disconnected("no channel".to_string())),
        };
        self.settle(loaded).await?;
        self.resident_tokens = Some(prefix.num_tokens());
        self.fresh = false;
        Ok(())
    }

    /// Shut down the engine-side model and release the channel.
    ///
    /// Engine-side failures are logged, never returned.
    pub async fn terminate(&mut self) -> Result<()> {
        self.check(Operation::Terminate)?;
        if let Some(stream) = self.stream.take() {
            stream.handle.abort();
        }

        if let Some(mut channel) = self.channel.take() {
            if channel.healthy() {
                let timeout = self.config.timeouts.terminate;
                let exchange = async {
                    channel
                        .send_frame(&Frame::Request(EngineCommand::Terminate))
                        .await?;
                    let reply = channel.receive(timeout).await?;
                    expect_ack(reply, "terminate")
                };
                match tokio::time::timeout(timeout, exchange).await {
                    Ok(Ok(())) => debug!("Engine acknowledged terminate"),
                    Ok(Err(e)) => warn!("Terminate was not acknowledged: {}", e),
                    Err(_) => warn!("Terminate was not acknowledged within {:?}", timeout),
                }
            }
            channel.close().await;
        }

        self.executing.store(false, Ordering::SeqCst);
        self.pending = None;
        self.last_result = None;
        self.resident_tokens = None;
        self.transition(SessionState::Terminated);
        info!(model = ?self.model, "Session terminated");
        Ok(())
    }

    fn check(&self, operation: Operation) -> Result<()> {
        if self.state.permits(operation) {
            Ok(())
        } else {
            Err(SessionError::state(operation, self.state))
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state == SessionState::Disconnected {
            return Err(self.disconnected_error());
        }
        Ok(())
    }

    fn disconnected_error(&self) -> SessionError {
        SessionError::Disconnected("session lost its channel; init again to reconnect".to_string())
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Session state change");
            self.state = next;
        }
    }

    /// Bring the state up to date with work that ended in the background or
    /// was abandoned by a dropped future
    fn reap(&mut self) {
        match self.state {
            SessionState::Connecting => {
                warn!("Init was interrupted before completing");
                self.disconnect_now();
            }
            SessionState::Executing => match self.stream.as_mut() {
                None => {
                    warn!("Request was abandoned while in flight");
                    self.executing.store(false, Ordering::SeqCst);
                    self.metrics.record_failure();
                    self.disconnect_now();
                }
                Some(stream) if stream.handle.is_finished() => {
                    if let Some(joined) = (&mut stream.handle).now_or_never() {
                        let started = stream.started;
                        self.stream = None;
                        let result = self.complete_stream(joined, started);
                        self.last_result = Some(result);
                    }
                }
                Some(_) => {}
            },
            _ => {}
        }
    }

    fn complete_stream(
        &mut self,
        joined: std::result::Result<StreamOutcome, JoinError>,
        started: Instant,
    ) -> Result<InferenceResult> {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                self.executing.store(false, Ordering::SeqCst);
                self.metrics.record_failure();
                self.disconnect_now();
                return Err(SessionError::Disconnected(format!(
                    "stream receive task failed: {}",
                    e
                )));
            }
        };
        if self.sink.is_none() {
            self.sink = outcome.sink;
        }

        match outcome.result {
            Ok(sequence) => {
                if let Some(channel) = self.channel.as_mut() {
                    channel.restore_reader(outcome.reader);
                }
                let result = InferenceResult::ChatStream(sequence);
                self.record_result(&result, started);
                self.transition(SessionState::Ready);
                Ok(result)
            }
            Err(e) => {
                self.metrics.record_failure();
                if e.is_channel_fault() {
                    warn!("Stream failed, dropping channel: {}", e);
                    self.disconnect_now();
                } else {
                    if let Some(channel) = self.channel.as_mut() {
                        channel.restore_reader(outcome.reader);
                    }
                    self.transition(SessionState::Ready);
                }
                Err(e)
            }
        }
    }

    fn record_result(&mut self, result: &InferenceResult, started: Instant) {
        let usage = result.usage();
        let aborted = match result {
            InferenceResult::Chat(chat) => chat
                .choices
                .iter()
                .any(|c| c.finish_reason == FinishReason::Aborted),
            InferenceResult::ChatStream(sequence) => {
                sequence.finish_reason() == Some(FinishReason::Aborted)
            }
            InferenceResult::BatchInference(_) => false,
        };
        if aborted {
            info!("Request was aborted");
        }
        self.metrics.record_success(usage, started.elapsed(), aborted);
        if !matches!(result, InferenceResult::BatchInference(_)) {
            self.resident_tokens = usage.map(|u| u.total_tokens as usize);
        }
    }

    /// Route a failed in-flight request: channel faults disconnect, engine
    /// errors leave the session ready without a result
    async fn fail_request(&mut self, error: SessionError) -> SessionError {
        self.executing.store(false, Ordering::SeqCst);
        self.metrics.record_failure();
        if error.is_channel_fault() {
            self.disconnect(&error).await;
        } else {
            self.transition(SessionState::Ready);
        }
        error
    }

    /// Disconnect on channel faults of a cache exchange
    async fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_channel_fault() {
                self.disconnect(e).await;
            }
        }
        result
    }

    async fn disconnect(&mut self, reason: &SessionError) {
        warn!(model = ?self.model, "Channel lost: {}", reason);
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        self.pending = None;
        self.transition(SessionState::Disconnected);
    }

    fn disconnect_now(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.abandon();
        }
        self.pending = None;
        self.transition(SessionState::Disconnected);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.handle.abort();
        }
        if let Some(channel) = self.channel.take() {
            channel.abandon();
        }
    }
}

/// Cancels a session's in-flight request from any task
#[derive(Clone)]
pub struct AbortHandle {
    writer: ChannelWriter,
    executing: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
}

impl AbortHandle {
    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    /// Schedule an `ABORT` frame if a request is in flight.
    ///
    /// Never blocks. Returns whether a frame was scheduled. The frame is
    /// dropped if the request it targets has finished by the time the writer
    /// is free, so it can never cancel a later request.
    pub fn abort(&self) -> bool {
        if !self.is_executing() || !self.writer.healthy() {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Abort requested outside a runtime");
            return false;
        };
        let target = self.generation.load(Ordering::SeqCst);
        let writer = self.writer.clone();
        let executing = self.executing.clone();
        let generation = self.generation.clone();
        runtime.spawn(async move {
            let still_wanted = || {
                executing.load(Ordering::SeqCst) && generation.load(Ordering::SeqCst) == target
            };
            match writer.send_frame_if(&Frame::Abort, still_wanted).await {
                Ok(true) => {}
                Ok(false) => debug!("Request finished before the abort was sent"),
                Err(e) => warn!("Failed to send abort: {}", e),
            }
        });
        true
    }
}
