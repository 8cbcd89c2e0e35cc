//! Logging setup and diagnostics toggles

mod logging;
mod tracer;

pub use logging::{setup_logging, LogConfig};
pub use tracer::{disable_tracer, enable_tracer, tracer_enabled, Direction};

pub(crate) use tracer::record as trace_frame;
