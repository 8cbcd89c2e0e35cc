//! Classifies the frames of one in-flight request as partial or terminal and
//! rebuilds the typed result.

use tracing::warn;

use crate::codec::{EngineResponse, Frame};
use crate::error::{Result, SessionError};
use crate::types::{ChatChunk, ChunkPosition, InferenceResult, RequestKind};

/// What a single accepted frame means for the request
#[derive(Debug, Clone, PartialEq)]
pub enum DemuxEvent {
    /// A streamed chunk; `terminal` marks the last one
    Chunk { chunk: ChatChunk, terminal: bool },
    /// The complete result of a non-streaming request
    Complete(InferenceResult),
}

#[derive(Debug)]
pub struct Demultiplexer {
    kind: RequestKind,
    streaming: bool,
    chunks_seen: usize,
    choice_index: Option<u32>,
    finished: bool,
}

impl Demultiplexer {
    pub fn new(kind: RequestKind, streaming: bool) -> Self {
        Self {
            kind,
            streaming,
            chunks_seen: 0,
            choice_index: None,
            finished: false,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Whether a terminal frame (result, last chunk or error) has been seen
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn chunks_seen(&self) -> usize {
        self.chunks_seen
    }

    /// Classify the next frame.
    ///
    /// Engine `ERROR` frames end the request and surface as their mapped
    /// error. Anything that breaks the response contract is a
    /// [`SessionError::Protocol`].
    pub fn accept(&mut self, frame: Frame) -> Result<DemuxEvent> {
        if self.finished {
            return Err(SessionError::Protocol(format!(
                "{} frame received after the terminal frame",
                frame.tag()
            )));
        }

        match frame {
            Frame::Error(report) => {
                self.finished = true;
                warn!(code = %report.code, "Engine reported failure: {}", report.message);
                Err(report.into_error())
            }
            Frame::ResponseFull(response) if !self.streaming => self.accept_full(response),
            Frame::ResponseChunk(chunk) if self.streaming => self.accept_chunk(chunk),
            Frame::ResponseChunk(_) => Err(SessionError::Protocol(
                "chunk received for a non-streaming request".to_string(),
            )),
            other => Err(SessionError::Protocol(format!(
                "unexpected {} frame while awaiting a response",
                other.tag()
            ))),
        }
    }

    fn accept_full(&mut self, response: EngineResponse) -> Result<DemuxEvent> {
        let result = match (self.kind, response) {
            (RequestKind::Chat, EngineResponse::Chat(result)) => {
                if !result.usage.is_consistent() {
                    warn!(usage = ?result.usage, "Engine reported inconsistent token usage");
                }
                InferenceResult::Chat(result)
            }
            (RequestKind::BatchInference, EngineResponse::Batch(result)) => {
                InferenceResult::BatchInference(result)
            }
            (kind, _) => {
                return Err(SessionError::Protocol(format!(
                    "response does not match the {:?} request",
                    kind
                )))
            }
        };
        self.finished = true;
        Ok(DemuxEvent::Complete(result))
    }

    fn accept_chunk(&mut self, chunk: ChatChunk) -> Result<DemuxEvent> {
        let position = if self.chunks_seen == 0 {
            ChunkPosition::First
        } else {
            ChunkPosition::Subsequent
        };
        chunk.check_shape(position).map_err(|e| {
            SessionError::Protocol(format!("chunk {}: {}", self.chunks_seen, e))
        })?;

        let index = chunk.choice().map(|c| c.index);
        match (self.choice_index, index) {
            (None, Some(index)) => self.choice_index = Some(index),
            (Some(expected), Some(index)) if expected != index => {
                return Err(SessionError::Protocol(format!(
                    "chunk {}: choice index changed from {} to {}",
                    self.chunks_seen, expected, index
                )));
            }
            _ => {}
        }

        self.chunks_seen += 1;
        let terminal = chunk.is_terminal();
        if terminal {
            self.finished = true;
        }
        Ok(DemuxEvent::Chunk { chunk, terminal })
    }
}

/// Interpret the reply to a control frame that expects `ACK`
pub fn expect_ack(frame: Frame, context: &str) -> Result<()> {
    match frame {
        Frame::Ack => Ok(()),
        Frame::Error(report) => Err(report.into_error()),
        other => Err(SessionError::Protocol(format!(
            "unexpected {} frame in reply to {}",
            other.tag(),
            context
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ErrorReport;
    use crate::error::ErrorCode;
    use crate::test_utils::{chat_result, chunk};
    use crate::types::FinishReason;

    #[test]
    fn test_full_response() {
        let mut demux = Demultiplexer::new(RequestKind::Chat, false);
        let event = demux
            .accept(Frame::ResponseFull(EngineResponse::Chat(chat_result("Hi"))))
            .unwrap();
        assert!(matches!(event, DemuxEvent::Complete(InferenceResult::Chat(_))));
        assert!(demux.is_finished());
        assert!(demux.accept(Frame::Ack).is_err());
    }

    #[test]
    fn test_chunk_in_full_mode_is_protocol_error() {
        let mut demux = Demultiplexer::new(RequestKind::Chat, false);
        let result = demux.accept(Frame::ResponseChunk(chunk(Some("assistant"), None, None)));
        assert!(matches!(result, Err(SessionError::Protocol(_))));
    }

    #[test]
    fn test_mismatched_response_kind() {
        let mut demux = Demultiplexer::new(RequestKind::BatchInference, false);
        let result = demux.accept(Frame::ResponseFull(EngineResponse::Chat(chat_result("Hi"))));
        assert!(matches!(result, Err(SessionError::Protocol(_))));
    }

    #[test]
    fn test_stream_sequence() {
        let mut demux = Demultiplexer::new(RequestKind::Chat, true);
        let frames = vec![
            chunk(Some("assistant"), None, None),
            chunk(None, Some("Hel"), None),
            chunk(None, Some("lo"), None),
            chunk(None, None, Some(FinishReason::Stop)),
        ];
        let mut terminals = Vec::new();
        for frame in frames {
            match demux.accept(Frame::ResponseChunk(frame)).unwrap() {
                DemuxEvent::Chunk { terminal, .. } => terminals.push(terminal),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(terminals, vec![false, false, false, true]);
        assert_eq!(demux.chunks_seen(), 4);

        let late = demux.accept(Frame::ResponseChunk(chunk(None, Some("!"), None)));
        assert!(matches!(late, Err(SessionError::Protocol(_))));
    }

    #[test]
    fn test_stream_shape_violations() {
        let mut demux = Demultiplexer::new(RequestKind::Chat, true);
        assert!(demux
            .accept(Frame::ResponseChunk(chunk(None, Some("Hi"), None)))
            .is_err());

        let mut demux = Demultiplexer::new(RequestKind::Chat, true);
        demux
            .accept(Frame::ResponseChunk(chunk(Some("assistant"), None, None)))
            .unwrap();
        let mut moved = chunk(None, Some("x"), None);
        moved.choices[0].index = 1;
        assert!(demux.accept(Frame::ResponseChunk(moved)).is_err());
    }

    #[test]
    fn test_aborted_first_chunk_is_terminal() {
        let mut demux = Demultiplexer::new(RequestKind::Chat, true);
        let event = demux
            .accept(Frame::ResponseChunk(chunk(None, None, Some(FinishReason::Aborted))))
            .unwrap();
        assert!(matches!(event, DemuxEvent::Chunk { terminal: true, .. }));
        assert!(demux.is_finished());
    }

    #[test]
    fn test_error_frame_is_terminal() {
        let mut demux = Demultiplexer::new(RequestKind::Chat, true);
        let report = ErrorReport::new(ErrorCode::PreAttnDecodeError, "decode stage failed");
        let error = demux.accept(Frame::Error(report)).unwrap_err();
        assert_eq!(error.code(), ErrorCode::PreAttnDecodeError);
        assert!(demux.is_finished());
    }

    #[test]
    fn test_expect_ack() {
        assert!(expect_ack(Frame::Ack, "init").is_ok());
        let error = expect_ack(
            Frame::Error(ErrorReport::new(ErrorCode::InvalidModel, "unknown")),
            "init",
        )
        .unwrap_err();
        assert!(matches!(error, SessionError::InvalidModel(_)));
        assert!(matches!(
            expect_ack(Frame::Abort, "init"),
            Err(SessionError::Protocol(_))
        ));
    }
}
