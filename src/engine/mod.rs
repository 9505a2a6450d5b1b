/*!
 * Execution engine
 *
 * Walks the process graph to start, stop and inspect processes. Every
 * top-level call builds a fresh invocation context whose memo table makes
 * sure each process is driven at most once per verb, however many
 * dependents ask for it; other requesters await the same result.
 */

mod start;
mod status;
mod stop;

pub use start::StartRequest;
pub use status::{ProcessStatus, RunState, StatusOptions};

use concert_core_interface::{LineStream, RemoteChannel};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{ConcertError, Result};
use crate::graph::{ProcessGraph, ProcessSpec};
use crate::pool::ConnectionPool;
use crate::progress::Progress;
use crate::resolve::quote;

/// Result of driving one process, shared with every waiter
pub(crate) type Outcome = std::result::Result<bool, Arc<ConcertError>>;

/// Per-invocation memo: process name -> result of its single execution
#[derive(Default)]
pub(crate) struct Memo {
    cells: Mutex<HashMap<String, Arc<OnceCell<Outcome>>>>,
}

impl Memo {
    fn cell(&self, name: &str) -> Arc<OnceCell<Outcome>> {
        // A poisoned lock only means another task panicked mid-insert
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Run `drive` for `name` unless it already ran or is running, and return
    /// the shared outcome either way
    pub(crate) async fn once<F, Fut>(&self, name: &str, drive: F) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let cell = self.cell(name);
        if cell.initialized() {
            debug!("{} already handled in this invocation", name);
        }
        cell.get_or_init(drive).await.clone()
    }
}

/// Turn the outcome of a top-level call back into a plain result
fn finish(outcome: Outcome) -> Result<bool> {
    outcome.map_err(ConcertError::from_shared)
}

/// Collect the outcomes of a fan-out, failing on the first error in
/// declaration order; `Ok` carries whether every branch succeeded
fn join_outcomes<'a>(
    names: impl IntoIterator<Item = &'a str>,
    outcomes: Vec<Outcome>,
) -> Result<bool> {
    let mut all_ok = true;
    for (name, outcome) in names.into_iter().zip(outcomes) {
        match outcome {
            Ok(ok) => all_ok &= ok,
            Err(source) => {
                return Err(ConcertError::Dependency {
                    process: name.to_string(),
                    source,
                })
            }
        }
    }
    Ok(all_ok)
}

/// The execution engine
pub struct Engine {
    graph: Arc<ProcessGraph>,
    pool: Arc<ConnectionPool>,
    config: EngineConfig,
    progress: Progress,
}

impl Engine {
    pub fn new(
        graph: Arc<ProcessGraph>,
        pool: Arc<ConnectionPool>,
        config: EngineConfig,
        progress: Progress,
    ) -> Self {
        Self {
            graph,
            pool,
            config,
            progress,
        }
    }

    pub fn graph(&self) -> &ProcessGraph {
        &self.graph
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Start `name` and, first, everything it depends on
    ///
    /// Returns whether every started process succeeded. Fatal errors
    /// (configuration, protocol, readiness) abort the walk.
    pub async fn start(&self, name: &str, request: &StartRequest) -> Result<bool> {
        self.graph.get(name)?;
        let run = start::StartRun::new(self, request);
        finish(run.start(name.to_string(), 0).await)
    }

    /// Stop `name` (or every process when `None`), dependents first
    ///
    /// `force` selects the kill signal from the beginning.
    pub async fn stop(&self, name: Option<&str>, force: bool) -> Result<bool> {
        let run = stop::StopRun::new(self, force);
        match name {
            Some(name) => {
                self.graph.get(name)?;
                finish(run.stop(name.to_string(), 0).await)
            }
            None => {
                let names: Vec<&str> = self.graph.names().collect();
                let outcomes =
                    futures::future::join_all(names.iter().map(|n| run.stop(n.to_string(), 0)))
                        .await;
                join_outcomes(names, outcomes)
            }
        }
    }

    /// Liveness of every persistent process
    pub async fn status(&self, options: StatusOptions) -> Result<Vec<ProcessStatus>> {
        status::collect(self, options).await
    }

    /// Follow the output file of `name`, starting with its last `num_lines` lines
    pub async fn watch(&self, name: &str, num_lines: usize) -> Result<LineStream> {
        let spec = self.graph.get(name)?;
        if !spec.persistent {
            warn!("{} is not persistent and has no output file", name);
        }
        let channel = self.pool.get(&spec.machine).await?;
        let command = format!(
            "tail -n {} -F {}",
            num_lines,
            quote(&spec.stdout_path())
        );
        Ok(channel.stream(&command).await?)
    }

    fn marker_path(&self, spec: &ProcessSpec) -> String {
        self.config
            .helper_dir
            .join(format!("concert_launcher_{}.starting", spec.name))
            .display()
            .to_string()
    }
}

/// Boxed recursive step of a graph walk
pub(crate) type Step<'a> = BoxFuture<'a, Outcome>;

/// Create the start marker on the process's host
async fn create_marker(channel: &dyn RemoteChannel, path: &str) -> Result<()> {
    channel.run(&format!("touch {}", quote(path))).await?;
    Ok(())
}

/// Remove the start marker; failures are only logged
async fn remove_marker(channel: &dyn RemoteChannel, path: &str) {
    if let Err(e) = channel.run(&format!("rm -f {}", quote(path))).await {
        warn!("[{}] could not remove {}: {}", channel.host(), path, e);
    }
}
