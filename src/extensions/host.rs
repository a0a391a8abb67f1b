//! Extension host - manages all extension workers.
//!
//! The ExtensionHost is responsible for:
//! - Scanning the extensions directory and loading manifests
//! - Indexing trigger keywords
//! - Starting and stopping worker processes
//! - Connecting each worker's channel to a controller
//! - Remembering why each worker last stopped

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use crate::config::Config;

use super::collaborators::{LauncherUi, WorkerCache};
use super::controller::{Controller, ControllerConfig};
use super::error::{ExtensionError, ExtensionResult};
use super::exit::ExitCause;
use super::manifest::ExtensionManifest;
use super::registry::Registry;
use super::renderer::{DeferredResultRenderer, PlaceholderAction};
use super::runtime::{ExtensionRuntime, LaunchSpec, RuntimeOptions};
use super::ExtensionId;

/// Called with the classified cause whenever a worker stops or fails to start.
pub type ExitCallback = Rc<dyn Fn(&str, &ExitCause)>;

/// A query resolved to the worker and trigger that handle it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedQuery {
    pub extension_id: ExtensionId,
    pub trigger_id: String,
    /// Query text after the keyword.
    pub argument: String,
}

#[derive(Debug, Clone)]
struct IndexedTrigger {
    extension_id: ExtensionId,
    trigger_id: String,
}

struct RunningWorker {
    generation: u64,
    runtime: ExtensionRuntime,
}

/// The extension host manages all extension workers.
///
/// Must be used from inside a `tokio::task::LocalSet`. Clones share state.
#[derive(Clone)]
pub struct ExtensionHost {
    inner: Rc<HostInner>,
}

struct HostInner {
    config: Config,
    cache: Rc<dyn WorkerCache>,
    registry: Rc<Registry>,
    renderer: Rc<DeferredResultRenderer>,

    /// Loaded manifests by extension ID.
    manifests: HashMap<ExtensionId, ExtensionManifest>,

    /// Extension directories by ID.
    extension_dirs: HashMap<ExtensionId, PathBuf>,

    /// Trigger keyword to owning extension.
    keyword_index: HashMap<String, IndexedTrigger>,

    runtimes: RefCell<HashMap<ExtensionId, RunningWorker>>,
    last_exit: RefCell<HashMap<ExtensionId, ExitCause>>,
    next_generation: Cell<u64>,
    on_exit: RefCell<Option<ExitCallback>>,
}

impl ExtensionHost {
    /// Create a new extension host and scan the extensions directory.
    pub fn new(config: Config, ui: Rc<dyn LauncherUi>, cache: Rc<dyn WorkerCache>) -> ExtensionResult<Self> {
        let extensions_dir = config.extensions_dir();
        let (manifests, extension_dirs) = scan_extensions(&extensions_dir)?;
        let keyword_index = index_triggers(&manifests);

        tracing::info!(
            "Loaded {} extension(s) from {}",
            manifests.len(),
            extensions_dir.display()
        );

        let renderer = Rc::new(DeferredResultRenderer::with_loading_delay(
            ui,
            config.timing.loading_delay(),
        ));

        Ok(Self {
            inner: Rc::new(HostInner {
                config,
                cache,
                registry: Rc::new(Registry::new()),
                renderer,
                manifests,
                extension_dirs,
                keyword_index,
                runtimes: RefCell::new(HashMap::new()),
                last_exit: RefCell::new(HashMap::new()),
                next_generation: Cell::new(0),
                on_exit: RefCell::new(None),
            }),
        })
    }

    /// Register a callback for worker exits and start failures.
    pub fn set_exit_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &ExitCause) + 'static,
    {
        *self.inner.on_exit.borrow_mut() = Some(Rc::new(callback));
    }

    pub fn registry(&self) -> &Rc<Registry> {
        &self.inner.registry
    }

    pub fn renderer(&self) -> &Rc<DeferredResultRenderer> {
        &self.inner.renderer
    }

    /// Get the number of loaded extensions.
    pub fn extension_count(&self) -> usize {
        self.inner.manifests.len()
    }

    /// Loaded extension ids, sorted.
    pub fn extension_ids(&self) -> Vec<ExtensionId> {
        let mut ids: Vec<_> = self.inner.manifests.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn manifest(&self, ext_id: &str) -> Option<&ExtensionManifest> {
        self.inner.manifests.get(ext_id)
    }

    pub fn extension_dir(&self, ext_id: &str) -> Option<&Path> {
        self.inner.extension_dirs.get(ext_id).map(PathBuf::as_path)
    }

    /// Launch the worker of an extension and connect its session.
    ///
    /// Starting a running extension does nothing.
    pub fn start(&self, ext_id: &str) -> ExtensionResult<()> {
        let inner = &self.inner;
        if self.is_running(ext_id) {
            tracing::debug!("Extension '{}' is already running", ext_id);
            return Ok(());
        }

        let manifest = inner
            .manifests
            .get(ext_id)
            .ok_or_else(|| ExtensionError::ExtensionNotFound(ext_id.to_string()))?;
        let extension_dir = inner
            .extension_dirs
            .get(ext_id)
            .ok_or_else(|| ExtensionError::ExtensionNotFound(ext_id.to_string()))?;

        if let Err(e) = manifest.validate() {
            inner.record_exit(ext_id, ExitCause::Invalid { message: e.to_string() });
            return Err(e);
        }
        if let Err(e) = manifest.check_compatibility() {
            inner.record_exit(ext_id, ExitCause::Incompatible { message: e.to_string() });
            return Err(e);
        }

        let mut env: BTreeMap<String, String> = inner.config.env.clone();
        env.extend(manifest.runtime.env.clone());
        let spec = LaunchSpec {
            ext_id: ext_id.to_string(),
            command: resolve_command(&manifest.runtime.command, extension_dir),
            working_dir: Some(extension_dir.clone()),
            env,
        };
        let options = RuntimeOptions {
            kill_delay: inner.config.timing.kill_delay(),
            cache: Some(Rc::clone(&inner.cache)),
        };

        let generation = inner.next_generation.get() + 1;
        inner.next_generation.set(generation);

        let weak: Weak<HostInner> = Rc::downgrade(inner);
        let id = ext_id.to_string();
        let runtime = ExtensionRuntime::spawn(
            spec,
            options,
            Box::new(move |cause| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_exit(&id, generation, cause);
                }
            }),
        )?;

        let config = ControllerConfig::from_manifest(
            manifest,
            extension_dir,
            inner.config.preference_overrides(ext_id),
        );
        if let Err(e) = Controller::connect(
            ext_id,
            config,
            runtime.channel().clone(),
            &inner.registry,
            &inner.renderer,
        ) {
            runtime.stop();
            return Err(e);
        }

        inner.last_exit.borrow_mut().remove(ext_id);
        inner
            .runtimes
            .borrow_mut()
            .insert(ext_id.to_string(), RunningWorker { generation, runtime });
        Ok(())
    }

    /// Start every loaded extension, logging failures. Returns how many started.
    pub fn start_all(&self) -> usize {
        let mut started = 0;
        for ext_id in self.extension_ids() {
            match self.start(&ext_id) {
                Ok(()) => started += 1,
                Err(e) => tracing::warn!("Failed to start extension '{}': {}", ext_id, e),
            }
        }
        started
    }

    /// Ask a worker to stop. The exit is reported once the process is gone.
    pub fn stop(&self, ext_id: &str) -> ExtensionResult<()> {
        let runtime = self
            .inner
            .runtimes
            .borrow()
            .get(ext_id)
            .map(|worker| worker.runtime.clone())
            .ok_or_else(|| ExtensionError::ExtensionNotFound(ext_id.to_string()))?;
        runtime.stop();
        Ok(())
    }

    pub fn stop_all(&self) {
        let runtimes: Vec<_> = self
            .inner
            .runtimes
            .borrow()
            .values()
            .map(|worker| worker.runtime.clone())
            .collect();
        for runtime in runtimes {
            runtime.stop();
        }
    }

    pub fn is_running(&self, ext_id: &str) -> bool {
        self.inner
            .runtimes
            .borrow()
            .get(ext_id)
            .is_some_and(|worker| worker.runtime.is_running())
    }

    pub fn runtime(&self, ext_id: &str) -> Option<ExtensionRuntime> {
        self.inner
            .runtimes
            .borrow()
            .get(ext_id)
            .map(|worker| worker.runtime.clone())
    }

    pub fn running_ids(&self) -> Vec<ExtensionId> {
        let mut ids: Vec<_> = self.inner.runtimes.borrow().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Why the extension last stopped, if it has stopped since it was last started.
    pub fn last_exit(&self, ext_id: &str) -> Option<ExitCause> {
        self.inner.last_exit.borrow().get(ext_id).cloned()
    }

    /// Split `query` into keyword and argument and find the owning trigger.
    pub fn resolve(&self, query: &str) -> Option<ResolvedQuery> {
        let query = query.trim_start();
        let (keyword, argument) = match query.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim_start()),
            None => (query, ""),
        };

        let trigger = self.inner.keyword_index.get(keyword)?;
        Some(ResolvedQuery {
            extension_id: trigger.extension_id.clone(),
            trigger_id: trigger.trigger_id.clone(),
            argument: argument.to_string(),
        })
    }

    /// Route a query to the worker owning its keyword.
    ///
    /// Returns `None` when no trigger matches or the worker is not connected.
    pub fn handle_query(&self, query: &str) -> Option<PlaceholderAction> {
        let resolved = self.resolve(query)?;
        let Some(controller) = self.inner.registry.get(&resolved.extension_id) else {
            tracing::debug!("Extension '{}' is not connected", resolved.extension_id);
            return None;
        };
        Some(controller.query(&resolved.argument, Some(&resolved.trigger_id)))
    }

    /// The query text changed.
    pub fn on_query_change(&self) {
        self.inner.renderer.on_query_change();
    }
}

impl HostInner {
    fn handle_exit(&self, ext_id: &str, generation: u64, cause: ExitCause) {
        let removed = {
            let mut runtimes = self.runtimes.borrow_mut();
            match runtimes.get(ext_id) {
                Some(worker) if worker.generation == generation => runtimes.remove(ext_id),
                _ => None,
            }
        };
        if removed.is_none() {
            tracing::debug!("Ignoring exit of a replaced '{}' worker: {}", ext_id, cause);
            return;
        }
        self.record_exit(ext_id, cause);
    }

    fn record_exit(&self, ext_id: &str, cause: ExitCause) {
        self.last_exit
            .borrow_mut()
            .insert(ext_id.to_string(), cause.clone());

        let callback = self.on_exit.borrow().clone();
        if let Some(callback) = callback {
            callback(ext_id, &cause);
        }
    }
}

impl std::fmt::Debug for ExtensionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionHost")
            .field("extensions", &self.extension_ids())
            .field("running", &self.running_ids())
            .finish()
    }
}

type ScanResult = (
    HashMap<ExtensionId, ExtensionManifest>,
    HashMap<ExtensionId, PathBuf>,
);

/// Scan the extensions directory and load all manifests.
fn scan_extensions(extensions_dir: &Path) -> ExtensionResult<ScanResult> {
    let mut manifests = HashMap::new();
    let mut extension_dirs = HashMap::new();

    if !extensions_dir.exists() {
        // No extensions directory - that's fine, just no extensions
        return Ok((manifests, extension_dirs));
    }

    let mut entries: Vec<_> = std::fs::read_dir(extensions_dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    entries.sort();

    for path in entries {
        match ExtensionManifest::load(&path) {
            Ok(manifest) => {
                if let Err(e) = manifest.validate() {
                    tracing::warn!("Invalid manifest in {}: {}", path.display(), e);
                    continue;
                }

                let ext_id = manifest.extension.name.clone();
                if manifests.contains_key(&ext_id) {
                    tracing::warn!(
                        "Extension '{}' in {} is already loaded, skipping",
                        ext_id,
                        path.display()
                    );
                    continue;
                }

                extension_dirs.insert(ext_id.clone(), path);
                manifests.insert(ext_id, manifest);
            }
            Err(ExtensionError::ManifestNotFound(_)) => {
                // Not an extension directory, skip
                continue;
            }
            Err(e) => {
                tracing::warn!("Failed to load extension from {}: {}", path.display(), e);
                continue;
            }
        }
    }

    Ok((manifests, extension_dirs))
}

fn index_triggers(manifests: &HashMap<ExtensionId, ExtensionManifest>) -> HashMap<String, IndexedTrigger> {
    let mut ids: Vec<_> = manifests.keys().collect();
    ids.sort();

    let mut index: HashMap<String, IndexedTrigger> = HashMap::new();
    for ext_id in ids {
        for trigger in &manifests[ext_id].triggers {
            if let Some(owner) = index.get(&trigger.keyword) {
                tracing::warn!(
                    "Keyword '{}' of '{}' is already bound to '{}'",
                    trigger.keyword,
                    ext_id,
                    owner.extension_id
                );
                continue;
            }
            index.insert(
                trigger.keyword.clone(),
                IndexedTrigger {
                    extension_id: ext_id.clone(),
                    trigger_id: trigger.id.clone(),
                },
            );
        }
    }
    index
}

/// Resolve a relative program path such as `./main.py` against the extension directory.
fn resolve_command(command: &[String], extension_dir: &Path) -> Vec<String> {
    let mut resolved = command.to_vec();
    if let Some(program) = resolved.first_mut() {
        let path = Path::new(program.as_str());
        if path.is_relative() && path.components().count() > 1 {
            *program = extension_dir.join(path).to_string_lossy().into_owned();
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::collaborators::NoopCache;
    use crate::extensions::testing::RecordingUi;
    use std::fs;
    use tempfile::tempdir;
    use tokio::task::LocalSet;

    fn create_test_extension(dir: &Path, name: &str, keyword: &str, extra: &str) {
        let ext_dir = dir.join(name);
        fs::create_dir_all(&ext_dir).unwrap();

        let manifest = format!(
            r#"
[extension]
name = "{name}"
title = "{name} Extension"
version = "1.0.0"
{extra}

[runtime]
command = ["/bin/sh", "-c", "sleep 30"]

[[triggers]]
id = "main"
keyword = "{keyword}"
"#
        );

        fs::write(ext_dir.join("manifest.toml"), manifest).unwrap();
    }

    fn host_for(dir: &Path) -> ExtensionHost {
        let mut config = Config::default();
        config.general.extensions_dir = Some(dir.to_path_buf());
        ExtensionHost::new(config, Rc::new(RecordingUi::default()), Rc::new(NoopCache)).unwrap()
    }

    #[test]
    fn test_scan_extensions() {
        let temp = tempdir().unwrap();
        create_test_extension(temp.path(), "ext1", "one", "");
        create_test_extension(temp.path(), "ext2", "two", "");
        fs::create_dir_all(temp.path().join("not-an-extension")).unwrap();
        fs::write(temp.path().join("stray.txt"), "x").unwrap();

        let host = host_for(temp.path());

        assert_eq!(host.extension_count(), 2);
        assert_eq!(host.extension_ids(), vec!["ext1", "ext2"]);
        assert!(host.manifest("ext1").is_some());
    }

    #[test]
    fn test_invalid_manifest_is_skipped() {
        let temp = tempdir().unwrap();
        create_test_extension(temp.path(), "good", "g", "");
        let bad = temp.path().join("bad");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join("manifest.toml"), "[extension]\nname = \"bad\"\n").unwrap();

        let host = host_for(temp.path());
        assert_eq!(host.extension_ids(), vec!["good"]);
    }

    #[test]
    fn test_nonexistent_extensions_dir() {
        let host = host_for(Path::new("/nonexistent/path"));
        assert_eq!(host.extension_count(), 0);
        assert!(host.resolve("anything").is_none());
    }

    #[test]
    fn test_resolve_keyword() {
        let temp = tempdir().unwrap();
        create_test_extension(temp.path(), "weather", "wt", "");
        let host = host_for(temp.path());

        assert_eq!(
            host.resolve("  wt   berlin tomorrow"),
            Some(ResolvedQuery {
                extension_id: "weather".to_string(),
                trigger_id: "main".to_string(),
                argument: "berlin tomorrow".to_string(),
            })
        );
        assert_eq!(host.resolve("wt").unwrap().argument, "");
        assert!(host.resolve("wtx berlin").is_none());
    }

    #[test]
    fn test_duplicate_keyword_keeps_first_extension() {
        let temp = tempdir().unwrap();
        create_test_extension(temp.path(), "alpha", "k", "");
        create_test_extension(temp.path(), "beta", "k", "");
        let host = host_for(temp.path());

        assert_eq!(host.resolve("k x").unwrap().extension_id, "alpha");
    }

    #[test]
    fn test_resolve_command() {
        let dir = Path::new("/ext/demo");
        let cmd = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert_eq!(resolve_command(&cmd(&["./main.py"]), dir), cmd(&["/ext/demo/./main.py"]));
        assert_eq!(resolve_command(&cmd(&["python3", "main.py"]), dir), cmd(&["python3", "main.py"]));
        assert_eq!(resolve_command(&cmd(&["/bin/sh"]), dir), cmd(&["/bin/sh"]));
    }

    #[tokio::test]
    async fn test_incompatible_extension_records_cause() {
        LocalSet::new()
            .run_until(async {
                let temp = tempdir().unwrap();
                create_test_extension(temp.path(), "future", "f", "api_version = \">=9.0\"");
                let host = host_for(temp.path());

                let reported = Rc::new(RefCell::new(Vec::new()));
                let sink = Rc::clone(&reported);
                host.set_exit_callback(move |id, cause| {
                    sink.borrow_mut().push((id.to_string(), cause.kind()));
                });

                let err = host.start("future").unwrap_err();
                assert!(matches!(err, ExtensionError::Incompatible { .. }));
                assert!(matches!(host.last_exit("future"), Some(ExitCause::Incompatible { .. })));
                assert!(!host.is_running("future"));
                assert_eq!(*reported.borrow(), vec![("future".to_string(), "incompatible")]);
            })
            .await;
    }

    #[tokio::test]
    async fn test_replaced_worker_exit_is_ignored() {
        LocalSet::new()
            .run_until(async {
                let temp = tempdir().unwrap();
                create_test_extension(temp.path(), "sleeper", "s", "");
                let host = host_for(temp.path());

                let reported = Rc::new(Cell::new(0));
                let sink = Rc::clone(&reported);
                host.set_exit_callback(move |_, _| sink.set(sink.get() + 1));

                host.start("sleeper").unwrap();
                let current = host.inner.runtimes.borrow()["sleeper"].generation;

                host.inner.handle_exit(
                    "sleeper",
                    current - 1,
                    ExitCause::Terminated {
                        message: "old worker".to_string(),
                    },
                );
                assert!(host.is_running("sleeper"));
                assert_eq!(host.last_exit("sleeper"), None);
                assert_eq!(reported.get(), 0);

                host.stop("sleeper").unwrap();
                while host.last_exit("sleeper").is_none() {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                }
                assert_eq!(host.last_exit("sleeper"), Some(ExitCause::Stopped));
                assert_eq!(reported.get(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_start_unknown_extension() {
        LocalSet::new()
            .run_until(async {
                let temp = tempdir().unwrap();
                let host = host_for(temp.path());
                assert!(matches!(
                    host.start("missing"),
                    Err(ExtensionError::ExtensionNotFound(_))
                ));
                assert!(matches!(host.stop("missing"), Err(ExtensionError::ExtensionNotFound(_))));
            })
            .await;
    }
}
