//! Newline-delimited JSON framing over one end of a duplex byte stream.
//!
//! A [`MessageChannel`] owns its stream exclusively. Outbound messages go
//! through a single writer task so write order is preserved; inbound lines are
//! parsed by a reader task started with [`MessageChannel::listen`]. Every task
//! is spawned with `spawn_local`, so channels must be created inside a
//! `tokio::task::LocalSet`.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::extensions::error::ExtensionResult;

/// Handler invoked for every well-formed inbound message.
pub type MessageHandler = Rc<dyn Fn(Map<String, Value>)>;

type CloseHandler = Box<dyn FnOnce()>;
type BoxedReader = Box<dyn AsyncRead + Unpin>;

/// One end of a private host/worker channel.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct MessageChannel {
    inner: Rc<ChannelInner>,
}

struct ChannelInner {
    label: String,
    closed: Cell<bool>,
    reader: RefCell<Option<BoxedReader>>,
    outbound: RefCell<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    reader_task: RefCell<Option<JoinHandle<()>>>,
    on_close: RefCell<Option<CloseHandler>>,
}

impl MessageChannel {
    /// Wrap a stream. The writer task starts immediately; reading starts on `listen`.
    pub fn new<S>(label: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + 'static,
    {
        let label = label.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        let inner = Rc::new(ChannelInner {
            label,
            closed: Cell::new(false),
            reader: RefCell::new(Some(Box::new(read_half))),
            outbound: RefCell::new(Some(tx)),
            reader_task: RefCell::new(None),
            on_close: RefCell::new(None),
        });

        tokio::task::spawn_local(writer_loop(Rc::downgrade(&inner), write_half, rx));

        Self { inner }
    }

    /// Wrap one end of a Unix socket pair.
    pub fn from_unix(
        label: impl Into<String>,
        stream: std::os::unix::net::UnixStream,
    ) -> ExtensionResult<Self> {
        stream.set_nonblocking(true)?;
        let stream = tokio::net::UnixStream::from_std(stream)?;
        Ok(Self::new(label, stream))
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Whether two handles refer to the same channel.
    pub fn same_channel(&self, other: &MessageChannel) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Serialize `message` as one JSON line and queue it for writing.
    ///
    /// Unserializable messages are dropped. Sending on a closed or broken
    /// channel never fails the caller; it only makes sure the channel is closed.
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) {
        if self.is_closed() {
            return;
        }

        let mut line = match serde_json::to_vec(message) {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!("[{}] dropping unserializable message: {}", self.inner.label, e);
                return;
            }
        };
        line.push(b'\n');

        let queued = self
            .inner
            .outbound
            .borrow()
            .as_ref()
            .map(|tx| tx.send(line).is_ok())
            .unwrap_or(false);

        if !queued {
            tracing::debug!("[{}] writer is gone, closing channel", self.inner.label);
            self.close();
        }
    }

    /// Register the message handler and start reading.
    ///
    /// Only the first call has an effect; a closed channel never reads again.
    pub fn listen<F>(&self, on_message: F)
    where
        F: Fn(Map<String, Value>) + 'static,
    {
        if self.is_closed() {
            return;
        }

        let Some(reader) = self.inner.reader.borrow_mut().take() else {
            tracing::warn!("[{}] listen() called twice, ignoring", self.inner.label);
            return;
        };

        let handler: MessageHandler = Rc::new(on_message);
        let task = tokio::task::spawn_local(reader_loop(
            Rc::downgrade(&self.inner),
            self.inner.label.clone(),
            reader,
            handler,
        ));
        *self.inner.reader_task.borrow_mut() = Some(task);
    }

    /// Register the close callback, replacing any previous one.
    ///
    /// If the channel is already closed the callback runs immediately.
    pub fn set_on_close<F>(&self, on_close: F)
    where
        F: FnOnce() + 'static,
    {
        if self.is_closed() {
            on_close();
            return;
        }
        *self.inner.on_close.borrow_mut() = Some(Box::new(on_close));
    }

    /// Close the channel. Safe to call any number of times.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl ChannelInner {
    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        tracing::debug!("[{}] closing channel", self.label);

        // Dropping the sender lets the writer flush what is queued, then shut
        // down its half so the peer sees EOF.
        drop(self.outbound.borrow_mut().take());
        drop(self.reader.borrow_mut().take());
        if let Some(task) = self.reader_task.borrow_mut().take() {
            task.abort();
        }

        let callback = self.on_close.borrow_mut().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.get_mut().take() {
            task.abort();
        }
    }
}

impl fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageChannel")
            .field("label", &self.inner.label)
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}

async fn writer_loop<W>(
    inner: Weak<ChannelInner>,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        let result = match writer.write_all(&line).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            if let Some(inner) = inner.upgrade() {
                tracing::debug!("[{}] write failed: {}", inner.label, e);
                inner.close();
            }
            return;
        }
    }

    let _ = writer.shutdown().await;
}

async fn reader_loop(
    inner: Weak<ChannelInner>,
    label: String,
    reader: BoxedReader,
    handler: MessageHandler,
) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => {
                tracing::debug!("[{}] peer closed the channel", label);
                break;
            }
            Ok(_) if line.last() != Some(&b'\n') => {
                tracing::debug!("[{}] dropping incomplete trailing line", label);
                break;
            }
            Ok(_) => dispatch_line(&label, &line, &handler),
            Err(e) => {
                tracing::debug!("[{}] read failed: {}", label, e);
                break;
            }
        }

        match inner.upgrade() {
            Some(inner) if !inner.closed.get() => {}
            _ => return,
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.close();
    }
}

fn dispatch_line(label: &str, line: &[u8], handler: &MessageHandler) {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return;
    }

    match serde_json::from_slice::<Value>(trimmed) {
        Ok(Value::Object(message)) => handler(message),
        Ok(other) => {
            tracing::warn!("[{}] ignoring non-object message: {}", label, other);
        }
        Err(e) => {
            tracing::warn!("[{}] ignoring malformed message: {}", label, e);
        }
    }
}
