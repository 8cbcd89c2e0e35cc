//! The model handle: lifecycle state machine and request/response exchange

mod builder;
mod handle;
mod state;

pub use builder::SessionBuilder;
pub use handle::{AbortHandle, Session};
pub use state::{Operation, SessionState};
