//! Streaming delivery.
//!
//! The receive path runs on its own task and owns the channel reader for the
//! lifetime of the stream. Decoded chunks travel through a bounded queue to a
//! delivery task that feeds the caller's sink in arrival order, so a slow sink
//! applies backpressure to decoding instead of growing memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::demux::{DemuxEvent, Demultiplexer};
use crate::channel::ChannelReader;
use crate::error::{Result, SessionError};
use crate::metrics::MetricsCollector;
use crate::types::{ChatChunk, ChatChunkSequence};

/// Receives streamed chunks in arrival order.
///
/// Returning an error detaches the sink; remaining chunks are still
/// collected into the sequence returned by `output()`.
#[async_trait]
pub trait ChunkSink: Send {
    async fn on_chunk(&mut self, chunk: &ChatChunk) -> Result<()>;
}

#[async_trait]
impl ChunkSink for mpsc::Sender<ChatChunk> {
    async fn on_chunk(&mut self, chunk: &ChatChunk) -> Result<()> {
        self.send(chunk.clone())
            .await
            .map_err(|_| SessionError::Disconnected("chunk receiver dropped".to_string()))
    }
}

/// Hands chunks to a synchronous consumer thread
#[async_trait]
impl ChunkSink for crossbeam_channel::Sender<ChatChunk> {
    async fn on_chunk(&mut self, chunk: &ChatChunk) -> Result<()> {
        let sender = self.clone();
        let chunk = chunk.clone();
        tokio::task::spawn_blocking(move || sender.send(chunk))
            .await
            .map_err(|e| SessionError::Disconnected(e.to_string()))?
            .map_err(|_| SessionError::Disconnected("chunk receiver dropped".to_string()))
    }
}

/// Adapts a closure into a sink
pub struct FnSink<F>(pub F);

#[async_trait]
impl<F> ChunkSink for FnSink<F>
where
    F: FnMut(&ChatChunk) + Send,
{
    async fn on_chunk(&mut self, chunk: &ChatChunk) -> Result<()> {
        (self.0)(chunk);
        Ok(())
    }
}

/// Everything the receive task hands back when it ends
pub(crate) struct StreamOutcome {
    pub reader: ChannelReader,
    pub sink: Option<Box<dyn ChunkSink>>,
    pub result: Result<ChatChunkSequence>,
}

pub(crate) struct StreamSettings {
    pub receive_timeout: Duration,
    pub queue_capacity: usize,
}

/// Start the background receive path for one streaming request.
///
/// `first_frame` fires once the first chunk has been decoded. It is dropped
/// without firing when the stream fails before producing a chunk.
pub(crate) fn spawn_stream(
    mut reader: ChannelReader,
    mut demux: Demultiplexer,
    sink: Option<Box<dyn ChunkSink>>,
    settings: StreamSettings,
    first_frame: oneshot::Sender<()>,
    executing: Arc<AtomicBool>,
    metrics: Arc<MetricsCollector>,
) -> JoinHandle<StreamOutcome> {
    tokio::spawn(async move {
        let (queue_tx, queue_rx) = mpsc::channel(settings.queue_capacity.max(1));
        let delivery = tokio::spawn(deliver(queue_rx, sink, metrics));

        let mut first_frame = Some(first_frame);
        let mut chunks = Vec::new();
        let result = loop {
            let frame = match reader.receive_frame(settings.receive_timeout).await {
                Ok(frame) => frame,
                Err(e) => break Err(e),
            };
            match demux.accept(frame) {
                Ok(DemuxEvent::Chunk { chunk, terminal }) => {
                    if let Some(signal) = first_frame.take() {
                        let _ = signal.send(());
                    }
                    if queue_tx.send(chunk.clone()).await.is_err() {
                        debug!("Delivery task ended early");
                    }
                    chunks.push(chunk);
                    if terminal {
                        break Ok(ChatChunkSequence { chunks });
                    }
                }
                Ok(DemuxEvent::Complete(_)) => {
                    break Err(SessionError::Protocol(
                        "complete response on a streaming request".to_string(),
                    ))
                }
                Err(e) => break Err(e),
            }
        };
        executing.store(false, Ordering::SeqCst);

        // Close the queue so delivery drains and returns the sink
        drop(queue_tx);
        let sink = match delivery.await {
            Ok(sink) => sink,
            Err(e) => {
                warn!("Chunk delivery task failed: {}", e);
                None
            }
        };

        StreamOutcome {
            reader,
            sink,
            result,
        }
    })
}

async fn deliver(
    mut queue: mpsc::Receiver<ChatChunk>,
    mut sink: Option<Box<dyn ChunkSink>>,
    metrics: Arc<MetricsCollector>,
) -> Option<Box<dyn ChunkSink>> {
    while let Some(chunk) = queue.recv().await {
        if let Some(active) = sink.as_mut() {
            if let Err(e) = active.on_chunk(&chunk).await {
                warn!("Detaching chunk sink: {}", e);
                sink = None;
                continue;
            }
            metrics.record_chunk();
        }
    }
    sink
}
