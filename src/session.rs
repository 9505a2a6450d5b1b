/*!
 * tmux session protocol
 *
 * Encodes the process lifecycle onto tmux: one window per persistent process
 * inside its session, started through the wrapper helper so the exit status
 * stays queryable, and "signals" delivered as control keys.
 */

use concert_core_interface::{RemoteChannel, RemoteChannelExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ConcertError, Result};
use crate::resolve::quote;

/// Fields requested from `tmux list-windows`, space separated
const LIST_FORMAT: &str =
    "#{session_name} #{window_name} #{pane_pid} #{pane_dead} #{pane_dead_status}";

/// Scrollback kept for every process window
pub const HISTORY_LIMIT: u32 = 10_000;

/// File name of the launch wrapper helper
pub const WRAPPER_NAME: &str = "concert_launcher_wrapper.bash";

/// Liveness information of one window, re-queried on every use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowState {
    pub pid: u32,
    pub dead: bool,
    /// Exit status of the command once the window is dead
    pub exit_status: Option<i32>,
}

/// Control keys used to emulate signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// C-c, SIGINT through the terminal
    Interrupt,
    /// C-\, SIGQUIT through the terminal
    Kill,
}

impl Signal {
    fn key(self) -> &'static str {
        match self {
            Signal::Interrupt => "C-c",
            Signal::Kill => r"'C-\'",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Kill => "SIGQUIT",
        }
    }
}

/// tmux adapter bound to one host's channel
#[derive(Clone)]
pub struct Tmux {
    channel: Arc<dyn RemoteChannel>,
    wrapper: PathBuf,
}

impl Tmux {
    pub fn new(channel: Arc<dyn RemoteChannel>, helper_dir: &Path) -> Self {
        Self {
            channel,
            wrapper: helper_dir.join(WRAPPER_NAME),
        }
    }

    pub fn host(&self) -> &str {
        self.channel.host()
    }

    /// All windows of `session` in one round trip; an absent session is empty
    pub async fn list(&self, session: &str) -> Result<BTreeMap<String, WindowState>> {
        let command = format!("tmux list-windows -t {} -F '{}'", session, LIST_FORMAT);
        let output = self.channel.run(&command).await?;

        match output.exit_code {
            0 => {}
            1 => {
                debug!("[{}] session {} not found", self.host(), session);
                return Ok(BTreeMap::new());
            }
            code => {
                return Err(ConcertError::CommandFailed {
                    host: self.host().to_string(),
                    command,
                    code,
                })
            }
        }

        let windows = parse_list(session, &output.stdout);
        debug!("[{}] session {} has {} windows", self.host(), session, windows.len());
        Ok(windows)
    }

    pub async fn window(&self, session: &str, window: &str) -> Result<Option<WindowState>> {
        Ok(self.list(session).await?.remove(window))
    }

    pub async fn exists(&self, session: &str, window: &str) -> Result<bool> {
        Ok(self.window(session, window).await?.is_some())
    }

    /// Exists and not dead
    pub async fn alive(&self, session: &str, window: &str) -> Result<bool> {
        Ok(matches!(self.window(session, window).await?, Some(w) if !w.dead))
    }

    /// Start `command` in `session:window`
    ///
    /// Creates the session or window when absent and respawns a dead window.
    /// A live window is a protocol violation: callers check liveness first.
    pub async fn spawn_or_respawn(&self, session: &str, window: &str, command: &str) -> Result<()> {
        let windows = self.list(session).await?;
        let wrapped = self.wrapped(window, command);
        let window_options = format!(
            "set-option -t {s}:{w} remain-on-exit on \\; set-option -t {s}:{w} history-limit {h}",
            s = session,
            w = window,
            h = HISTORY_LIMIT
        );

        match windows.get(window) {
            _ if windows.is_empty() => {
                info!("[{}] creating session {} with window {}", self.host(), session, window);
                let command = format!(
                    "tmux new-session -d -s {s} -n {w} {cmd} \\; {opts} \\; set-option -t {s} mouse on",
                    s = session,
                    w = window,
                    cmd = wrapped,
                    opts = window_options
                );
                let output = self.channel.run(&command).await?;
                if !output.success() {
                    // Another spawner may have created the session since the listing
                    if self.list(session).await?.is_empty() {
                        return Err(ConcertError::CommandFailed {
                            host: self.host().to_string(),
                            command,
                            code: output.exit_code,
                        });
                    }
                    debug!("[{}] session {} appeared concurrently", self.host(), session);
                    self.new_window(session, window, &wrapped, &window_options)
                        .await?;
                }
            }
            None => {
                self.new_window(session, window, &wrapped, &window_options)
                    .await?;
            }
            Some(state) if state.dead => {
                info!("[{}] respawning dead window {}:{}", self.host(), session, window);
                self.channel
                    .run_checked(&format!(
                        "tmux respawn-window -t {}:{} {}",
                        session, window, wrapped
                    ))
                    .await?;
            }
            Some(_) => {
                return Err(ConcertError::ProtocolViolation {
                    session: session.to_string(),
                    window: window.to_string(),
                })
            }
        }

        self.ensure_grouped_session(session, window).await
    }

    async fn new_window(&self, session: &str, window: &str, wrapped: &str, options: &str) -> Result<()> {
        info!("[{}] creating window {}:{}", self.host(), session, window);
        self.channel
            .run_checked(&format!(
                "tmux new-window -d -t {s}: -n {w} {cmd} \\; {opts}",
                s = session,
                w = window,
                cmd = wrapped,
                opts = options
            ))
            .await?;
        Ok(())
    }

    /// Grouped session named after the window so it can be attached on its own
    async fn ensure_grouped_session(&self, session: &str, window: &str) -> Result<()> {
        self.channel
            .run_checked(&format!(
                "tmux has-session -t ={w} 2>/dev/null || tmux new-session -d -t {s} -s {w} \\; set-option -t {w} status off",
                s = session,
                w = window
            ))
            .await?;
        Ok(())
    }

    /// Type the signal's control key into the window
    pub async fn send_signal(&self, session: &str, window: &str, signal: Signal) -> Result<()> {
        info!(
            "[{}] sending {} to {}:{}",
            self.host(),
            signal.name(),
            session,
            window
        );
        self.channel
            .run_checked(&format!(
                "tmux send-keys -t {}:{} {}",
                session,
                window,
                signal.key()
            ))
            .await?;
        Ok(())
    }

    /// Kill a whole session; absent sessions are ignored
    pub async fn kill_session(&self, session: &str) -> Result<bool> {
        let output = self
            .channel
            .run(&format!("tmux kill-session -t {} 2>/dev/null", session))
            .await?;
        Ok(output.success())
    }

    /// Create a detached session whose first window runs `command` as is
    pub async fn new_plain_session(&self, session: &str, window: &str, command: &str) -> Result<()> {
        self.channel
            .run_checked(&format!(
                "tmux new-session -d -s {s} -n {w} {cmd} \\; set-option -t {s} mouse on \\; set-option -t {s} remain-on-exit on",
                s = session,
                w = window,
                cmd = quote(command)
            ))
            .await?;
        Ok(())
    }

    /// Split pane `pane` of the first window, side by side when `horizontal`
    pub async fn split_pane(
        &self,
        session: &str,
        pane: usize,
        horizontal: bool,
        command: &str,
    ) -> Result<()> {
        let direction = if horizontal { "-h" } else { "-v" };
        let output = self
            .channel
            .run(&format!(
                "tmux split-window {} -t {}:0.{} {}",
                direction,
                session,
                pane,
                quote(command)
            ))
            .await?;
        if !output.success() {
            warn!("[{}] split of {}:0.{} failed: {}", self.host(), session, pane, output.diagnostic());
        }
        Ok(())
    }

    /// Re-tile the panes of the first window
    pub async fn tile(&self, session: &str) -> Result<()> {
        self.channel
            .run(&format!("tmux select-layout -t {}:0 tiled", session))
            .await?;
        Ok(())
    }

    fn wrapped(&self, window: &str, command: &str) -> String {
        format!(
            "{} {} {}",
            quote(&self.wrapper.display().to_string()),
            quote(window),
            quote(command)
        )
    }
}

/// Parse `list-windows` output, keeping only windows of `session`
fn parse_list(session: &str, stdout: &str) -> BTreeMap<String, WindowState> {
    let mut windows = BTreeMap::new();
    for line in stdout.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[0] != session {
            continue;
        }
        let Ok(pid) = fields[2].parse::<u32>() else {
            debug!("skipping malformed tmux line: {}", line);
            continue;
        };
        let dead = fields[3] == "1";
        let exit_status = if dead {
            fields.get(4).and_then(|s| s.parse::<i32>().ok())
        } else {
            None
        };
        windows.insert(
            fields[1].to_string(),
            WindowState {
                pid,
                dead,
                exit_status,
            },
        );
    }
    windows
}
