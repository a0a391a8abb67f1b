//! `nova-extd run` and `nova-extd serve`.
//!
//! Queries are read line by line from stdin. Every line counts as an edit of
//! the launcher query, so an unanswered previous query is abandoned.

use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use console::style;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::LocalSet;

use crate::config::Config;
use crate::extensions::{ExtensionHost, IconHandle, LauncherUi, NoopCache, ResultAction};

/// How long to wait for the answer to the last query once stdin is closed.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Launcher stand-in printing everything to the terminal.
pub struct StdoutUi;

impl LauncherUi for StdoutUi {
    fn show_placeholder(&self, _icon: Option<&IconHandle>) {
        println!("{}", style("Loading...").dim());
    }

    fn run_action(&self, action: &ResultAction) {
        match serde_json::to_string(&action.0) {
            Ok(json) => println!("{}", json),
            Err(e) => tracing::error!("Failed to print action: {}", e),
        }
    }

    fn hide(&self) {
        println!("{}", style("(hidden)").dim());
    }
}

/// Run `future` on a single-threaded runtime inside a `LocalSet`.
pub fn block_on<F>(future: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build the event loop")?;
    LocalSet::new().block_on(&runtime, future)
}

/// Start one extension and feed it stdin queries.
pub async fn run_extension(config: Config, ext_id: String) -> Result<()> {
    let host = new_host(config)?;
    if host.manifest(&ext_id).is_none() {
        bail!("Extension '{}' is not installed", ext_id);
    }
    host.start(&ext_id)
        .with_context(|| format!("Failed to start extension '{}'", ext_id))?;

    println!(
        "{} {}",
        style("✓").green().bold(),
        style(format!("Started {}", ext_id)).cyan()
    );
    query_loop(&host, |_| {}).await
}

/// Serve every extension, routing stdin queries by keyword.
pub async fn serve(config: Config) -> Result<()> {
    let autostart = config.general.autostart;
    let host = new_host(config)?;

    if autostart {
        let started = host.start_all();
        println!(
            "{} {}",
            style("✓").green().bold(),
            style(format!("Started {} of {} extension(s)", started, host.extension_count())).cyan()
        );
    }

    let lazy = host.clone();
    query_loop(&host, move |query| {
        if autostart {
            return;
        }
        if let Some(resolved) = lazy.resolve(query) {
            if !lazy.is_running(&resolved.extension_id) {
                if let Err(e) = lazy.start(&resolved.extension_id) {
                    tracing::warn!("Failed to start '{}': {}", resolved.extension_id, e);
                }
            }
        }
    })
    .await
}

fn new_host(config: Config) -> Result<ExtensionHost> {
    let host = ExtensionHost::new(config, Rc::new(StdoutUi), Rc::new(NoopCache))?;
    host.set_exit_callback(|ext_id, cause| {
        if cause.is_error() {
            eprintln!("{} {}: {}", style("✗").red().bold(), ext_id, cause);
        } else {
            eprintln!("{}", style(format!("{} stopped", ext_id)).dim());
        }
    });
    Ok(host)
}

async fn query_loop<F>(host: &ExtensionHost, before_query: F) -> Result<()>
where
    F: Fn(&str),
{
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let query = line.trim();
                if query.is_empty() {
                    continue;
                }

                host.on_query_change();
                before_query(query);
                if host.handle_query(query).is_none() {
                    eprintln!("{}", style(format!("No running extension handles '{}'", query)).yellow());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                shutdown(host).await;
                return Ok(());
            }
        }
    }

    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while host.renderer().has_active_dispatch() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    shutdown(host).await;
    Ok(())
}

/// Stop every worker and wait until all of them have exited.
async fn shutdown(host: &ExtensionHost) {
    host.stop_all();
    while !host.running_ids().is_empty() {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
