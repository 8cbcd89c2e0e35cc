//! Inference Session - client runtime for an out-of-process inference engine
//!
//! A [`Session`] owns one connection to the engine and walks a model through
//! its lifecycle: `init`, then any number of `input` / `execute` / `output`
//! cycles, then `terminate`. Chat requests can stream their reply chunk by
//! chunk to a [`ChunkSink`]; convolutional models take batched tensors.
//! Attention caches can be saved from one session and loaded into another.

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod processing;
pub mod session;
pub mod types;
pub mod utils;
pub mod vision;

#[cfg(test)]
mod test_utils;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-exports for public API
pub use config::{Endpoint, SessionConfig};
pub use error::{ErrorCode, Result, SessionError};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use processing::{ChunkSink, FnSink};
pub use session::{AbortHandle, Operation, Session, SessionBuilder, SessionState};
pub use types::{InferenceResult, ModelKind, PrefixCache, Request};
pub use utils::{disable_tracer, enable_tracer, setup_logging, LogConfig};
