//! Frame header layout: `[length: u32 BE][tag: u8][payload]`.
//!
//! `length` counts the tag byte plus the payload, so it is never zero.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, SessionError};

pub const HEADER_LEN: usize = 4;
pub const MIN_FRAME_LEN: usize = HEADER_LEN + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameTag {
    Request = 1,
    ResponseFull = 2,
    ResponseChunk = 3,
    Error = 4,
    Abort = 5,
    CacheSaveRequest = 6,
    CacheSaveResponse = 7,
    CacheLoadRequest = 8,
    Ack = 9,
}

impl FrameTag {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameTag::Request => "REQUEST",
            FrameTag::ResponseFull => "RESPONSE_FULL",
            FrameTag::ResponseChunk => "RESPONSE_CHUNK",
            FrameTag::Error => "ERROR",
            FrameTag::Abort => "ABORT",
            FrameTag::CacheSaveRequest => "CACHE_SAVE_REQUEST",
            FrameTag::CacheSaveResponse => "CACHE_SAVE_RESPONSE",
            FrameTag::CacheLoadRequest => "CACHE_LOAD_REQUEST",
            FrameTag::Ack => "ACK",
        }
    }
}

impl TryFrom<u8> for FrameTag {
    type Error = SessionError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => FrameTag::Request,
            2 => FrameTag::ResponseFull,
            3 => FrameTag::ResponseChunk,
            4 => FrameTag::Error,
            5 => FrameTag::Abort,
            6 => FrameTag::CacheSaveRequest,
            7 => FrameTag::CacheSaveResponse,
            8 => FrameTag::CacheLoadRequest,
            9 => FrameTag::Ack,
            other => return Err(SessionError::Decode(format!("unknown frame tag {}", other))),
        })
    }
}

impl std::fmt::Display for FrameTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build one complete frame around `payload`
pub fn write_frame(tag: FrameTag, payload: &[u8]) -> Result<Bytes> {
    let length = u32::try_from(payload.len() + 1).map_err(|_| {
        SessionError::invalid_argument("payload", format!("{} bytes exceed the frame limit", payload.len()))
    })?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 1 + payload.len());
    buf.put_u32(length);
    buf.put_u8(tag as u8);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Split one complete frame into its tag and payload
pub fn read_frame(frame: &[u8]) -> Result<(FrameTag, &[u8])> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(SessionError::Decode(format!(
            "truncated frame: {} bytes",
            frame.len()
        )));
    }
    let length = declared_length(frame) as usize;
    if length != frame.len() - HEADER_LEN {
        return Err(SessionError::Decode(format!(
            "frame declares {} bytes but carries {}",
            length,
            frame.len() - HEADER_LEN
        )));
    }
    let tag = FrameTag::try_from(frame[HEADER_LEN])?;
    Ok((tag, &frame[MIN_FRAME_LEN..]))
}

/// Take the next complete frame off the front of `buf`, if one has arrived.
///
/// Returns `Ok(None)` when more bytes are needed. Oversized and zero-length
/// headers are rejected before their bodies are buffered.
pub fn split_frame(buf: &mut BytesMut, max_frame_bytes: usize) -> Result<Option<Bytes>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let length = declared_length(buf) as usize;
    if length == 0 {
        return Err(SessionError::Decode("zero-length frame".to_string()));
    }
    let total = HEADER_LEN + length;
    if total > max_frame_bytes {
        return Err(SessionError::Decode(format!(
            "frame of {} bytes exceeds limit of {}",
            total, max_frame_bytes
        )));
    }
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }
    Ok(Some(buf.split_to(total).freeze()))
}

fn declared_length(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}
