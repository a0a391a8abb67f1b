//! Worker-side helpers: attach to the channel inherited from the host.

use std::os::fd::{FromRawFd, RawFd};

use serde_json::{Map, Value};

use super::channel::MessageChannel;
use super::types::{EventRef, ResponseMessage, ResultAction};
use crate::extensions::error::{ExtensionError, ExtensionResult};

/// Environment variable holding the worker id.
pub const ENV_EXTENSION_ID: &str = "NOVA_EXTENSION_ID";

/// Environment variable holding the inherited socket descriptor.
pub const ENV_SOCKET_FD: &str = "NOVA_EXTENSION_SOCKET_FD";

/// Wrap the descriptor announced in the environment.
///
/// Returns the worker id and the channel. Must be called at most once per
/// process, since the channel takes ownership of the descriptor.
pub fn connect_from_env() -> ExtensionResult<(String, MessageChannel)> {
    let ext_id = std::env::var(ENV_EXTENSION_ID).unwrap_or_default();
    let raw = std::env::var(ENV_SOCKET_FD).map_err(|_| ExtensionError::InvalidDescriptor {
        var: ENV_SOCKET_FD,
        value: String::new(),
    })?;
    let fd = parse_fd(&raw)?;

    // SAFETY: the host passes a socket it created for this process alone and
    // nothing else in the worker refers to it.
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    let label = if ext_id.is_empty() {
        "worker".to_string()
    } else {
        ext_id.clone()
    };
    let channel = MessageChannel::from_unix(label, stream)?;
    Ok((ext_id, channel))
}

fn parse_fd(raw: &str) -> ExtensionResult<RawFd> {
    raw.trim()
        .parse::<RawFd>()
        .ok()
        .filter(|fd| *fd > 2)
        .ok_or_else(|| ExtensionError::InvalidDescriptor {
            var: ENV_SOCKET_FD,
            value: raw.to_string(),
        })
}

/// Answer a query: echoes the received event back with an action.
pub fn respond(channel: &MessageChannel, event: &Map<String, Value>, action: Value) -> ExtensionResult<()> {
    let event_ref: EventRef = serde_json::from_value(Value::Object(event.clone()))
        .map_err(|e| ExtensionError::Protocol(format!("event has no id: {}", e)))?;
    channel.send(&ResponseMessage {
        event: event_ref,
        action: ResultAction(action),
    });
    Ok(())
}
