//! Extension system for Nova.
//!
//! This module runs extensions as separate worker processes and talks to
//! them over a private Unix socket using newline-delimited JSON.
//!
//! # Architecture
//!
//! ```text
//! ExtensionHost
//! ├── manifests: HashMap<ExtensionId, ExtensionManifest>
//! ├── keyword_index: HashMap<keyword, (ExtensionId, TriggerId)>
//! ├── runtimes: HashMap<ExtensionId, ExtensionRuntime>
//! │   └── MessageChannel (host end of the socket pair)
//! ├── Registry: HashMap<ExtensionId, Controller>
//! │   └── Controller ── Debouncer ──▶ MessageChannel
//! └── DeferredResultRenderer (single active dispatch, loading placeholder)
//! ```
//!
//! A query flows from the host (keyword lookup) to the worker's controller,
//! which debounces it onto the channel and hands the event to the renderer.
//! The worker's answer comes back through the same controller; the renderer
//! runs it only if it answers the most recent dispatch.
//!
//! Everything here is single-threaded: state lives in `Rc`/`RefCell` and all
//! tasks are spawned on a `tokio::task::LocalSet`.

mod collaborators;
mod controller;
mod debounce;
mod error;
mod exit;
mod host;
pub mod ipc;
mod manifest;
mod registry;
mod renderer;
mod runtime;

#[cfg(test)]
mod testing;

pub use collaborators::{LauncherUi, NoopCache, WorkerCache};
pub use controller::{Controller, ControllerConfig, PLACEHOLDER_ICON_SIZE};
pub use debounce::Debouncer;
pub use error::{ExtensionError, ExtensionResult};
pub use exit::{classify_exit, ExitCause, ProcessExit, MIN_HEALTHY_UPTIME, SDK_MODULE};
pub use host::{ExitCallback, ExtensionHost, ResolvedQuery};
pub use ipc::{MessageChannel, QueryEvent, ResponseMessage, ResultAction};
pub use manifest::{
    ExtensionManifest, ExtensionMeta, IconHandle, PreferenceConfig, PreferenceOption,
    PreferenceType, RuntimeConfig, TriggerConfig, HOST_API_VERSION, MANIFEST_FILE,
    MAX_DEBOUNCE_MS,
};
pub use registry::Registry;
pub use renderer::{DeferredResultRenderer, PlaceholderAction, DEFAULT_LOADING_DELAY};
pub use runtime::{
    ExitHandler, ExtensionRuntime, LaunchSpec, RingBuffer, RuntimeOptions, RuntimeState,
    STDERR_TAIL_LINES,
};

/// Unique identifier for an extension.
pub type ExtensionId = String;
