//! End-to-end: host, controller and renderer against the reference worker.

use std::cell::{Cell, RefCell};
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::task::LocalSet;

use nova_extensions::extensions::{IconHandle, PlaceholderAction, ResultAction};
use nova_extensions::{Config, ExitCause, ExtensionHost, LauncherUi, WorkerCache};

const WORKER: &str = env!("CARGO_BIN_EXE_nova-echo-worker");
const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
enum UiCall {
    Placeholder,
    Action(Value),
    Hide,
}

#[derive(Default)]
struct RecordingUi {
    calls: RefCell<Vec<UiCall>>,
}

impl RecordingUi {
    fn calls(&self) -> Vec<UiCall> {
        self.calls.borrow().clone()
    }

    fn actions(&self) -> Vec<Value> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                UiCall::Action(value) => Some(value.clone()),
                _ => None,
            })
            .collect()
    }
}

impl LauncherUi for RecordingUi {
    fn show_placeholder(&self, _icon: Option<&IconHandle>) {
        self.calls.borrow_mut().push(UiCall::Placeholder);
    }

    fn run_action(&self, action: &ResultAction) {
        self.calls.borrow_mut().push(UiCall::Action(action.0.clone()));
    }

    fn hide(&self) {
        self.calls.borrow_mut().push(UiCall::Hide);
    }
}

#[derive(Default)]
struct CountingCache {
    invalidations: Cell<usize>,
}

impl WorkerCache for CountingCache {
    fn invalidate_worker_set(&self) {
        self.invalidations.set(self.invalidations.get() + 1);
    }
}

struct Fixture {
    _dir: TempDir,
    host: ExtensionHost,
    ui: Rc<RecordingUi>,
    cache: Rc<CountingCache>,
}

fn write_echo_extension(root: &Path) {
    let dir = root.join("echo");
    fs::create_dir_all(&dir).unwrap();
    let manifest = format!(
        r#"
[extension]
name = "echo"
title = "Echo"
version = "0.1.0"
api_version = "^1.0"

[runtime]
command = ["{WORKER}"]
debounce_ms = 0

[[triggers]]
id = "main"
keyword = "echo"

[[preferences]]
id = "greeting"
type = "text"
default = "hello"
"#
    );
    fs::write(dir.join("manifest.toml"), manifest).unwrap();
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    write_echo_extension(dir.path());

    let mut config = Config::default();
    config.general.extensions_dir = Some(dir.path().to_path_buf());
    config.timing.loading_delay_ms = 5_000;
    config
        .preferences
        .entry("echo".to_string())
        .or_default()
        .insert("greeting".to_string(), json!("hi"));

    let ui = Rc::new(RecordingUi::default());
    let cache = Rc::new(CountingCache::default());
    let host = ExtensionHost::new(config, ui.clone(), cache.clone()).unwrap();
    Fixture {
        _dir: dir,
        host,
        ui,
        cache,
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_query_round_trip() {
    LocalSet::new()
        .run_until(async {
            let f = fixture();
            f.host.start("echo").unwrap();
            assert!(f.host.is_running("echo"));
            assert_eq!(f.host.running_ids(), vec!["echo"]);

            assert_eq!(f.host.handle_query("echo hello world"), Some(PlaceholderAction::KeepOpen));
            wait_until("a response", || f.ui.calls().contains(&UiCall::Hide)).await;

            assert_eq!(
                f.ui.calls(),
                vec![
                    UiCall::Action(json!({
                        "type": "echo",
                        "query": "hello world",
                        "trigger": "main",
                        "preferences": {"greeting": "hi"},
                    })),
                    UiCall::Hide,
                ]
            );

            f.host.stop_all();
            wait_until("shutdown", || f.host.running_ids().is_empty()).await;
        })
        .await;
}

#[tokio::test]
async fn test_superseded_query_never_renders() {
    LocalSet::new()
        .run_until(async {
            let f = fixture();
            f.host.start("echo").unwrap();

            f.host.on_query_change();
            assert!(f.host.handle_query("echo slow first").is_some());
            f.host.on_query_change();
            assert!(f.host.handle_query("echo second").is_some());

            wait_until("a response", || !f.ui.actions().is_empty()).await;
            // Give the slow answer time to arrive and be discarded.
            tokio::time::sleep(Duration::from_millis(800)).await;

            let actions = f.ui.actions();
            assert_eq!(actions.len(), 1);
            assert_eq!(actions[0]["query"], json!("second"));
            assert_eq!(f.ui.calls().iter().filter(|c| **c == UiCall::Hide).count(), 1);

            f.host.stop_all();
            wait_until("shutdown", || f.host.running_ids().is_empty()).await;
        })
        .await;
}

#[tokio::test]
async fn test_stop_records_cause_and_unregisters() {
    LocalSet::new()
        .run_until(async {
            let f = fixture();
            let reported = Rc::new(RefCell::new(Vec::new()));
            let sink = Rc::clone(&reported);
            f.host
                .set_exit_callback(move |id, cause| sink.borrow_mut().push((id.to_string(), cause.clone())));

            f.host.start("echo").unwrap();
            let pid = f.host.runtime("echo").unwrap().pid();
            f.host.start("echo").unwrap();
            assert_eq!(f.host.runtime("echo").unwrap().pid(), pid);
            assert!(f.host.registry().contains("echo"));

            f.host.stop("echo").unwrap();
            wait_until("exit", || f.host.last_exit("echo").is_some()).await;

            assert_eq!(f.host.last_exit("echo"), Some(ExitCause::Stopped));
            assert!(!f.host.is_running("echo"));
            assert!(f.host.running_ids().is_empty());
            assert!(!f.host.registry().contains("echo"));
            assert_eq!(f.cache.invalidations.get(), 1);
            assert_eq!(*reported.borrow(), vec![("echo".to_string(), ExitCause::Stopped)]);
            assert!(f.host.handle_query("echo again").is_none());
        })
        .await;
}

#[tokio::test]
async fn test_unknown_keyword_is_ignored() {
    LocalSet::new()
        .run_until(async {
            let f = fixture();
            assert!(f.host.handle_query("nope something").is_none());
            // Known keyword, but the worker is not running.
            assert!(f.host.handle_query("echo something").is_none());
            assert!(f.ui.calls().is_empty());
        })
        .await;
}
