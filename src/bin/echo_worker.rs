//! Reference worker: answers every query with an `echo` action.
//!
//! A query starting with `slow ` is answered after a delay, which makes it
//! easy to watch a newer query supersede an older one.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use tokio::sync::Notify;
use tokio::task::LocalSet;

use nova_extensions::extensions::ipc::client;

const SLOW_PREFIX: &str = "slow ";
const SLOW_DELAY: Duration = Duration::from_millis(400);

fn main() -> Result<()> {
    nova_extensions::logging::init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build the event loop")?;
    LocalSet::new().block_on(&runtime, run())
}

async fn run() -> Result<()> {
    let (ext_id, channel) = client::connect_from_env().context("Not started by a Nova host")?;
    tracing::info!("Worker '{}' attached", ext_id);

    let closed = Rc::new(Notify::new());
    let notify = Rc::clone(&closed);
    channel.set_on_close(move || notify.notify_one());

    let preferences = Rc::new(RefCell::new(Map::new()));
    let handle = channel.clone();
    channel.listen(move |message| {
        let kind = message
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);
        match kind.as_deref() {
            Some("preferences") => {
                if let Some(Value::Object(prefs)) = message.get("preferences") {
                    *preferences.borrow_mut() = prefs.clone();
                }
            }
            Some("input_trigger") => {
                let query = message
                    .get("args")
                    .and_then(|args| args.get(0))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let trigger = message
                    .get("args")
                    .and_then(|args| args.get(1))
                    .cloned()
                    .unwrap_or(Value::Null);
                let action = json!({
                    "type": "echo",
                    "query": query,
                    "trigger": trigger,
                    "preferences": Value::Object(preferences.borrow().clone()),
                });

                if query.starts_with(SLOW_PREFIX) {
                    let channel = handle.clone();
                    tokio::task::spawn_local(async move {
                        tokio::time::sleep(SLOW_DELAY).await;
                        if let Err(e) = client::respond(&channel, &message, action) {
                            tracing::warn!("{}", e);
                        }
                    });
                } else if let Err(e) = client::respond(&handle, &message, action) {
                    tracing::warn!("{}", e);
                }
            }
            other => tracing::warn!("Unexpected message type {:?}", other),
        }
    });

    closed.notified().await;
    tracing::info!("Host closed the channel, exiting");
    Ok(())
}
