//! Response handling: frame demultiplexing, streaming delivery and cache
//! transfer exchanges

pub mod cache;
mod demux;
mod stream;

pub use demux::{expect_ack, DemuxEvent, Demultiplexer};
pub use stream::{ChunkSink, FnSink};

pub(crate) use stream::{spawn_stream, StreamOutcome, StreamSettings};
