//! Nova extensions - worker runtime for the Nova launcher.
//!
//! Extensions run as separate worker processes. The host launches each worker
//! with one end of a private socket, exchanges newline-delimited JSON with it,
//! and turns its answers into launcher actions.
//!
//! # Architecture
//!
//! The library is organized into these main modules:
//!
//! - [`config`] - Configuration loading and management
//! - [`extensions`] - Worker supervision, the wire protocol, and query routing
//! - [`logging`] - `tracing` subscriber setup for binaries
//! - [`cli`] - The `nova-extd` command line
//!
//! # Example
//!
//! ```ignore
//! use std::rc::Rc;
//! use nova_extensions::{Config, ExtensionHost, NoopCache};
//!
//! let host = ExtensionHost::new(Config::load(), Rc::new(MyUi), Rc::new(NoopCache))?;
//! host.start("weather")?;
//! host.handle_query("wt berlin");
//! ```

// Public modules
pub mod cli;
pub mod config;
pub mod extensions;
pub mod logging;

// Internal modules
mod error;

// Re-export commonly used types for convenience
pub use config::Config;
pub use error::{NovaError, NovaResult};
pub use extensions::{
    ExitCause, ExtensionError, ExtensionHost, ExtensionResult, LauncherUi, NoopCache, WorkerCache,
};
