//! Status fan-out: one connection per host, one listing per session

use concert_core_interface::RemoteChannel;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::Engine;
use crate::error::Result;
use crate::graph::ProcessSpec;
use crate::pool::PS_TREE_NAME;
use crate::session::{Tmux, WindowState};

/// What to collect besides liveness
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusOptions {
    /// Run the process-tree inspector for every live window
    pub pstree: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    Running,
    Dead,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Running => write!(f, "RUNNING"),
            RunState::Dead => write!(f, "DEAD"),
        }
    }
}

/// Status of one persistent process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub name: String,
    pub session: String,
    pub host: String,
    pub state: RunState,
    /// Pane pid, absent when the window does not exist
    pub pid: Option<u32>,
    /// Exit status of a dead window
    pub exit_status: Option<i32>,
    /// Output of the process-tree inspector
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pstree: Option<String>,
}

impl ProcessStatus {
    fn new(spec: &ProcessSpec, window: Option<WindowState>) -> Self {
        let state = match window {
            Some(w) if !w.dead => RunState::Running,
            _ => RunState::Dead,
        };
        Self {
            name: spec.name.clone(),
            session: spec.session.clone(),
            host: spec.machine.host_id().to_string(),
            state,
            pid: window.map(|w| w.pid),
            exit_status: window.and_then(|w| w.exit_status),
            pstree: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    /// Tab separated: name, session, host, state, pid, exit status
    pub fn line(&self) -> String {
        let dash = || "-".to_string();
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.name,
            self.session,
            self.host,
            self.state,
            self.pid.map(|p| p.to_string()).unwrap_or_else(dash),
            self.exit_status.map(|c| c.to_string()).unwrap_or_else(dash),
        )
    }
}

pub(super) async fn collect(engine: &Engine, options: StatusOptions) -> Result<Vec<ProcessStatus>> {
    // host -> session -> processes, preserving document order inside each group
    let mut by_host: BTreeMap<&str, BTreeMap<&str, Vec<&ProcessSpec>>> = BTreeMap::new();
    for spec in engine.graph.iter().filter(|p| p.persistent) {
        by_host
            .entry(spec.machine.host_id())
            .or_default()
            .entry(spec.session.as_str())
            .or_default()
            .push(spec);
    }

    let hosts = by_host
        .into_values()
        .map(|sessions| collect_host(engine, sessions, options));
    let mut found: BTreeMap<String, ProcessStatus> = BTreeMap::new();
    for host in join_all(hosts).await {
        for status in host? {
            found.insert(status.name.clone(), status);
        }
    }

    Ok(engine
        .graph
        .names()
        .filter_map(|name| found.remove(name))
        .collect())
}

async fn collect_host(
    engine: &Engine,
    sessions: BTreeMap<&str, Vec<&ProcessSpec>>,
    options: StatusOptions,
) -> Result<Vec<ProcessStatus>> {
    let Some(first) = sessions.values().flatten().next() else {
        return Ok(Vec::new());
    };
    let channel = engine.pool.get(&first.machine).await?;
    let tmux = Tmux::new(channel.clone(), &engine.config.helper_dir);

    let listings = sessions.iter().map(|(session, specs)| {
        let tmux = &tmux;
        async move {
            let windows = tmux.list(session).await?;
            Ok::<_, crate::error::ConcertError>(
                specs
                    .iter()
                    .map(|spec| ProcessStatus::new(spec, windows.get(&spec.name).copied()))
                    .collect::<Vec<_>>(),
            )
        }
    });

    let mut statuses = Vec::new();
    for listing in join_all(listings).await {
        statuses.extend(listing?);
    }

    if options.pstree {
        let trees = statuses.iter().map(|status| {
            let channel = channel.clone();
            let helper = engine.pool.resources().path_of(PS_TREE_NAME);
            async move {
                match (status.is_running(), status.pid) {
                    (true, Some(pid)) => {
                        process_tree(channel, &helper.display().to_string(), pid).await
                    }
                    _ => Ok(None),
                }
            }
        });
        let trees = join_all(trees).await;
        for (status, tree) in statuses.iter_mut().zip(trees) {
            status.pstree = tree?;
        }
    }

    Ok(statuses)
}

async fn process_tree(
    channel: Arc<dyn RemoteChannel>,
    helper: &str,
    pid: u32,
) -> Result<Option<String>> {
    let output = channel.run(&format!("python3 {} {}", helper, pid)).await?;
    if output.success() {
        Ok(Some(output.stdout))
    } else {
        debug!(
            "[{}] process tree for {} failed: {}",
            channel.host(),
            pid,
            output.diagnostic()
        );
        Ok(None)
    }
}
