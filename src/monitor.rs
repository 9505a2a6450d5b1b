/*!
 * Monitor session
 *
 * A local tmux session `<session>_mon` with one pane per persistent process.
 * Each pane waits for the process's grouped session to exist and attaches to
 * it, over `ssh -tt` when the process runs on another host. Panes are laid
 * out on a grid that fills a row of columns first, then grows rows.
 */

use serde::Serialize;
use tracing::{debug, info};

use crate::engine::Engine;
use crate::error::Result;
use crate::graph::{Machine, ProcessSpec};
use crate::resolve::quote;
use crate::session::Tmux;

/// Columns of the monitor grid
pub const GRID_COLUMNS: usize = 3;

/// Window name of the monitor session's only window
const MONITOR_WINDOW: &str = "monitor";

/// Where the next pane goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// First pane: create the session
    NewSession,
    /// Split pane `pane` of the first window
    Split { pane: usize, horizontal: bool },
}

/// Pane placement arithmetic for the monitor grid
#[derive(Debug, Clone)]
pub struct GridLayout {
    cols: usize,
    num_rows: usize,
    num_panes: usize,
    pane_to_split: usize,
}

impl Default for GridLayout {
    fn default() -> Self {
        Self::new(GRID_COLUMNS)
    }
}

impl GridLayout {
    pub fn new(cols: usize) -> Self {
        Self {
            cols: cols.max(1),
            num_rows: 1,
            num_panes: 0,
            pane_to_split: 0,
        }
    }

    pub fn num_panes(&self) -> usize {
        self.num_panes
    }

    /// Placement of the next pane, advancing the grid
    pub fn place(&mut self) -> Placement {
        if self.num_panes == 0 {
            self.num_panes = 1;
            return Placement::NewSession;
        }

        let placement = Placement::Split {
            pane: self.pane_to_split,
            horizontal: self.num_rows == 1,
        };
        self.pane_to_split += self.num_rows;
        self.num_panes += 1;
        if self.num_panes == self.cols * self.num_rows {
            self.pane_to_split = self.num_rows - 1;
            self.num_rows += 1;
        }
        placement
    }
}

/// What `open` did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorReport {
    pub session: String,
    /// Whether the session was (re)created; false when an existing one was kept
    pub created: bool,
    pub panes: usize,
}

/// Name of the monitor session for a graph session
pub fn monitor_session(session: &str) -> String {
    format!("{}_mon", session)
}

/// Shell loop run in the pane of `spec`
pub fn pane_command(spec: &ProcessSpec) -> String {
    let target = format!("{0}:{0}", spec.name);
    let attach = format!(
        "while ! tmux has-session -t {t}; do echo waiting for session {n} to exist..; sleep 1; done; unset TMUX; tmux a -t {t}",
        t = target,
        n = spec.name
    );
    match &spec.machine {
        Machine::Local => attach,
        Machine::Remote(remote) => {
            let port = remote
                .port
                .map(|p| format!("-p {} ", p))
                .unwrap_or_default();
            format!(
                "ssh {}{} -tt {}",
                port,
                remote.ssh_destination(),
                quote(&attach)
            )
        }
    }
}

/// Open the monitor session for `root` and its dependencies, or for every
/// persistent process when `root` is `None`
///
/// An existing monitor session is kept unless `replace` is set.
pub async fn open(engine: &Engine, root: Option<&str>, replace: bool) -> Result<MonitorReport> {
    let graph = engine.graph();
    let processes: Vec<&ProcessSpec> = match root {
        Some(name) => graph.dependency_closure(name)?,
        None => graph.dependency_order(),
    };
    let session = monitor_session(&graph.context().session);

    let channel = engine.pool().get(&Machine::Local).await?;
    let tmux = Tmux::new(channel, &engine.config().helper_dir);
    let progress = engine.progress();

    if !tmux.list(&session).await?.is_empty() {
        if !replace {
            info!("monitor session {} already exists", session);
            progress.report(&session, 0, "already exists (use --replace to recreate)");
            return Ok(MonitorReport {
                session,
                created: false,
                panes: 0,
            });
        }
        tmux.kill_session(&session).await?;
    }

    let mut grid = GridLayout::default();
    for spec in processes.into_iter().filter(|p| p.persistent) {
        progress.report(&spec.name, 0, "adding to monitor");
        let command = pane_command(spec);
        match grid.place() {
            Placement::NewSession => {
                tmux.new_plain_session(&session, MONITOR_WINDOW, &command)
                    .await?;
            }
            Placement::Split { pane, horizontal } => {
                debug!("splitting pane {} of {} (horizontal: {})", pane, session, horizontal);
                tmux.split_pane(&session, pane, horizontal, &command).await?;
                tmux.tile(&session).await?;
            }
        }
    }

    if grid.num_panes() > 0 {
        progress.report(&session, 0, &format!("monitoring session created (tmux a -t {})", session));
    }
    Ok(MonitorReport {
        session,
        created: grid.num_panes() > 0,
        panes: grid.num_panes(),
    })
}
