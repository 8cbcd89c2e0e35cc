//! Wire codec: length-prefixed, tagged frames with bincode payloads.
//!
//! The codec is pure and stateless; it performs no I/O.

mod frame;
mod message;

pub use frame::{read_frame, split_frame, write_frame, FrameTag, HEADER_LEN, MIN_FRAME_LEN};
pub use message::{decode, encode, encode_request, EngineCommand, EngineResponse, ErrorReport, Frame};
