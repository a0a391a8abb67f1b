//! Fakes shared by the unit tests of this module.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

use super::collaborators::LauncherUi;
use super::controller::{Controller, ControllerConfig};
use super::ipc::{MessageChannel, ResultAction};
use super::manifest::IconHandle;
use super::registry::Registry;
use super::renderer::DeferredResultRenderer;

#[derive(Debug, Clone, PartialEq)]
pub enum UiCall {
    Placeholder(Option<IconHandle>),
    RunAction(Value),
    Hide,
}

#[derive(Default)]
pub struct RecordingUi {
    calls: RefCell<Vec<UiCall>>,
}

impl RecordingUi {
    pub fn calls(&self) -> Vec<UiCall> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, pred: impl Fn(&UiCall) -> bool) -> usize {
        self.calls.borrow().iter().filter(|c| pred(c)).count()
    }
}

impl LauncherUi for RecordingUi {
    fn show_placeholder(&self, icon: Option<&IconHandle>) {
        self.calls.borrow_mut().push(UiCall::Placeholder(icon.cloned()));
    }

    fn run_action(&self, action: &ResultAction) {
        self.calls.borrow_mut().push(UiCall::RunAction(action.0.clone()));
    }

    fn hide(&self) {
        self.calls.borrow_mut().push(UiCall::Hide);
    }
}

pub fn renderer_with(ui: RecordingUi) -> (Rc<RecordingUi>, Rc<DeferredResultRenderer>) {
    let ui = Rc::new(ui);
    let renderer = Rc::new(DeferredResultRenderer::new(ui.clone()));
    (ui, renderer)
}

/// Worker end of an in-memory channel.
pub struct FakeWorker {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeWorker {
    /// Next JSON line, or `None` on EOF.
    pub async fn recv(&mut self) -> Option<Value> {
        let mut line = String::new();
        match self.reader.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(serde_json::from_str(&line).expect("host sent valid JSON")),
        }
    }

    pub async fn recv_within(&mut self, limit: Duration) -> Option<Value> {
        tokio::time::timeout(limit, self.recv()).await.ok().flatten()
    }

    pub async fn send(&mut self, message: Value) {
        let mut line = serde_json::to_vec(&message).unwrap();
        line.push(b'\n');
        self.writer.write_all(&line).await.unwrap();
        self.writer.flush().await.unwrap();
    }
}

pub fn fake_pair(label: &str) -> (MessageChannel, FakeWorker) {
    let (host, worker) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(worker);
    let fake = FakeWorker {
        reader: BufReader::new(read),
        writer: write,
    };
    (MessageChannel::new(label, host), fake)
}

/// Connect a controller to a fake worker and consume its preferences message.
pub async fn connect_fake(
    ext_id: &str,
    debounce: Duration,
    registry: &Rc<Registry>,
    renderer: &Rc<DeferredResultRenderer>,
) -> (Rc<Controller>, FakeWorker) {
    let (channel, mut worker) = fake_pair(ext_id);
    let config = ControllerConfig {
        debounce,
        ..Default::default()
    };
    let controller = Controller::connect(ext_id, config, channel, registry, renderer).unwrap();
    let hello = worker.recv().await.unwrap();
    assert_eq!(hello["type"], "preferences");
    (controller, worker)
}

/// Let spawned local tasks run.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
}
