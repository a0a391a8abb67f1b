//! Interfaces the runtime calls into but does not implement.

use super::ipc::ResultAction;
use super::manifest::IconHandle;

/// The launcher window, as seen from the extension runtime.
pub trait LauncherUi {
    /// Show a "Loading..." row while a worker is computing.
    fn show_placeholder(&self, icon: Option<&IconHandle>);

    /// Execute or render what a worker returned.
    fn run_action(&self, action: &ResultAction);

    /// Hide the launcher.
    fn hide(&self);
}

/// Anything caching the set of available workers.
pub trait WorkerCache {
    fn invalidate_worker_set(&self);
}

/// Cache that ignores invalidations.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl WorkerCache for NoopCache {
    fn invalidate_worker_set(&self) {}
}
