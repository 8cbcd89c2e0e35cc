//! Byte transport to the engine process.
//!
//! A [`Channel`] owns one connection split into a shared writer half and an
//! exclusively owned reader half. The reader can be lent to a background
//! receive path while the writer stays usable for control frames such as
//! `ABORT`.

mod connector;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::codec::{self, split_frame, Frame, FrameTag, HEADER_LEN};
use crate::error::{Result, SessionError};
use crate::utils::{trace_frame, Direction};

pub use connector::{Connector, EndpointConnector};

type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

const READ_CHUNK: usize = 8 * 1024;

fn frame_tag(frame: &[u8]) -> Option<FrameTag> {
    frame
        .get(HEADER_LEN)
        .and_then(|tag| FrameTag::try_from(*tag).ok())
}

/// Shared, cloneable sending half
#[derive(Clone)]
pub struct ChannelWriter {
    inner: Arc<Mutex<Option<BoxedWriter>>>,
    healthy: Arc<AtomicBool>,
}

impl ChannelWriter {
    /// Write one complete frame
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock().await;
        self.write_locked(&mut guard, frame).await
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let bytes = codec::encode(frame)?;
        self.send(&bytes).await
    }

    /// Write `frame` only if `still_wanted` holds once the writer is ours.
    ///
    /// Returns whether the frame was written.
    pub async fn send_frame_if<F>(&self, frame: &Frame, still_wanted: F) -> Result<bool>
    where
        F: FnOnce() -> bool,
    {
        let bytes = codec::encode(frame)?;
        let mut guard = self.inner.lock().await;
        if !still_wanted() {
            return Ok(false);
        }
        self.write_locked(&mut guard, &bytes).await.map(|()| true)
    }

    async fn write_locked(&self, slot: &mut Option<BoxedWriter>, frame: &[u8]) -> Result<()> {
        let Some(writer) = slot.as_mut() else {
            return Err(SessionError::Disconnected("channel is closed".to_string()));
        };

        let result = async {
            writer.write_all(frame).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                if let Some(tag) = frame_tag(frame) {
                    trace_frame(Direction::Send, tag, frame.len());
                }
                Ok(())
            }
            Err(e) => {
                warn!("Send failed, dropping connection: {}", e);
                self.healthy.store(false, Ordering::SeqCst);
                *slot = None;
                Err(SessionError::Disconnected(e.to_string()))
            }
        }
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if let Some(mut writer) = self.inner.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Error shutting down channel writer: {}", e);
            }
        }
        self.healthy.store(false, Ordering::SeqCst);
    }
}

/// Exclusively owned receiving half
pub struct ChannelReader {
    inner: BoxedReader,
    buf: BytesMut,
    max_frame_bytes: usize,
    healthy: Arc<AtomicBool>,
}

impl ChannelReader {
    /// Wait for the next complete frame, bounded by `timeout`.
    ///
    /// A lost connection flips the health flag and yields
    /// [`SessionError::Disconnected`].
    pub async fn receive(&mut self, timeout: Duration) -> Result<Bytes> {
        match tokio::time::timeout(timeout, self.read_frame()).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::timeout("receive", timeout)),
        }
    }

    /// Receive and decode the next frame
    pub async fn receive_frame(&mut self, timeout: Duration) -> Result<Frame> {
        let bytes = self.receive(timeout).await?;
        codec::decode(&bytes)
    }

    async fn read_frame(&mut self) -> Result<Bytes> {
        loop {
            if let Some(frame) = split_frame(&mut self.buf, self.max_frame_bytes)? {
                if let Some(tag) = frame_tag(&frame) {
                    trace_frame(Direction::Receive, tag, frame.len());
                }
                return Ok(frame);
            }

            self.buf.reserve(READ_CHUNK);
            let read = match self.inner.read_buf(&mut self.buf).await {
                Ok(read) => read,
                Err(e) => {
                    self.healthy.store(false, Ordering::SeqCst);
                    return Err(SessionError::Disconnected(e.to_string()));
                }
            };
            if read == 0 {
                self.healthy.store(false, Ordering::SeqCst);
                return Err(SessionError::Disconnected(
                    "engine closed the connection".to_string(),
                ));
            }
        }
    }
}

/// One connection to the engine
pub struct Channel {
    writer: ChannelWriter,
    reader: Option<ChannelReader>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

impl Channel {
    pub fn new<S>(stream: S, max_frame_bytes: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let healthy = Arc::new(AtomicBool::new(true));

        Self {
            writer: ChannelWriter {
                inner: Arc::new(Mutex::new(Some(Box::new(write_half)))),
                healthy: healthy.clone(),
            },
            reader: Some(ChannelReader {
                inner: Box::new(read_half),
                buf: BytesMut::with_capacity(READ_CHUNK),
                max_frame_bytes,
                healthy,
            }),
        }
    }

    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        self.writer.send(frame).await
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.writer.send_frame(frame).await
    }

    /// Receive the next decoded frame.
    ///
    /// Fails with a protocol error while the reader is lent to a stream.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Frame> {
        match self.reader.as_mut() {
            Some(reader) => reader.receive_frame(timeout).await,
            None => Err(SessionError::Protocol(
                "receive path is owned by an active stream".to_string(),
            )),
        }
    }

    pub fn healthy(&self) -> bool {
        self.writer.healthy()
    }

    /// Release the connection; safe to call more than once
    pub async fn close(&mut self) {
        self.reader = None;
        self.writer.close().await;
    }

    /// Release the connection without awaiting, for drop paths and other
    /// synchronous contexts
    pub fn abandon(self) {
        let writer = self.writer;
        writer.healthy.store(false, Ordering::SeqCst);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { writer.close().await });
            }
            Err(_) => {
                if let Ok(mut guard) = writer.inner.try_lock() {
                    guard.take();
                }
            }
        }
    }

    pub fn writer(&self) -> ChannelWriter {
        self.writer.clone()
    }

    pub fn take_reader(&mut self) -> Option<ChannelReader> {
        self.reader.take()
    }

    pub fn restore_reader(&mut self, reader: ChannelReader) {
        self.reader = Some(reader);
    }
}
