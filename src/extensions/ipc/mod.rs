//! IPC between the host and extension worker processes.
//!
//! Workers talk to the host over a private Unix socket pair using one JSON
//! object per line. The host side is wrapped in a [`MessageChannel`] by the
//! runtime; a worker attaches to its inherited end with
//! [`client::connect_from_env`].

mod channel;
pub mod client;
mod types;

pub use channel::{MessageChannel, MessageHandler};
pub use types::{EventId, EventRef, OutboundMessage, QueryEvent, ResponseMessage, ResultAction};
