//! Sessions: the per-stream state carried over a channel.
//!
//! - [`SessionState`] - the open/close state machine
//! - [`Session`] - one byte stream with its queues, sequence counters and wakers
//! - [`SessionTable`] - live sessions of a channel and the id allocator

#[allow(clippy::module_inception)]
mod session;
mod state;
mod table;

pub use session::Session;
pub use state::SessionState;
pub use table::{Role, SessionTable};
