//! Mock channel implementation for testing
//!
//! `MockChannel` simulates the small part of a tmux server the launcher
//! relies on (sessions, windows with pid/dead/exit status, control keys) plus
//! a file table, and records every command in a call log shared by all mock
//! hosts so tests can assert ordering across processes and machines.

use async_trait::async_trait;
use concert_core_interface::{CommandOutput, LineStream, RemoteChannel, Result};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::graph::Machine;
use crate::pool::Connector;

/// One command issued through a mock channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub host: String,
    pub command: String,
}

/// Ordered record of every command issued on every mock host
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, host: &str, command: &str) {
        self.calls.lock().unwrap().push(Call {
            host: host.to_string(),
            command: command.to_string(),
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.command).collect()
    }

    /// Number of commands containing `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.command.contains(pattern))
            .count()
    }

    /// Index of the first command containing `pattern`
    pub fn first(&self, pattern: &str) -> Option<usize> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .position(|c| c.command.contains(pattern))
    }

    /// Index of the last command containing `pattern`
    pub fn last(&self, pattern: &str) -> Option<usize> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rposition(|c| c.command.contains(pattern))
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

/// How a simulated window reacts to control keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Dies on the first key of any kind
    Die,
    /// Ignores C-c, dies on C-\
    IgnoreInterrupt,
    /// Survives `n` liveness listings after the first key, then dies
    DieAfterPolls(u32),
    /// Never dies
    Ignore,
}

#[derive(Debug, Clone)]
struct MockWindow {
    pid: u32,
    dead: bool,
    exit_status: i32,
    reaction: Reaction,
    signalled: bool,
    polls_since_signal: u32,
    /// Listings left before the window dies on its own
    lifetime: Option<u32>,
}

#[derive(Debug, Clone)]
struct Script {
    pattern: String,
    outputs: VecDeque<CommandOutput>,
}

#[derive(Debug, Default)]
struct TmuxState {
    sessions: BTreeMap<String, BTreeMap<String, MockWindow>>,
    grouped: HashSet<String>,
    files: HashMap<PathBuf, Vec<u8>>,
    reactions: HashMap<String, Reaction>,
    lifetimes: HashMap<String, u32>,
    scripts: Vec<Script>,
    stream_lines: Vec<String>,
    next_pid: u32,
}

impl TmuxState {
    fn spawn_window(&mut self, name: &str) -> MockWindow {
        self.next_pid += 1;
        MockWindow {
            pid: 1000 + self.next_pid,
            dead: false,
            exit_status: 0,
            reaction: self.reactions.get(name).copied().unwrap_or(Reaction::Die),
            signalled: false,
            polls_since_signal: 0,
            lifetime: self.lifetimes.get(name).copied(),
        }
    }

    fn tick(&mut self, session: &str) {
        let Some(windows) = self.sessions.get_mut(session) else {
            return;
        };
        for window in windows.values_mut().filter(|w| !w.dead) {
            if let Some(left) = window.lifetime.as_mut() {
                if *left == 0 {
                    window.dead = true;
                    window.exit_status = 1;
                    continue;
                }
                *left -= 1;
            }
            if window.signalled {
                if let Reaction::DieAfterPolls(n) = window.reaction {
                    if window.polls_since_signal >= n {
                        window.dead = true;
                        window.exit_status = 130;
                    }
                    window.polls_since_signal += 1;
                }
            }
        }
    }

    fn list(&mut self, session: &str) -> CommandOutput {
        self.tick(session);
        let Some(windows) = self.sessions.get(session) else {
            return CommandOutput::new(1, "", format!("can't find session: {}", session));
        };
        let lines: Vec<String> = windows
            .iter()
            .map(|(name, w)| {
                if w.dead {
                    format!("{} {} {} 1 {}", session, name, w.pid, w.exit_status)
                } else {
                    format!("{} {} {} 0 ", session, name, w.pid)
                }
            })
            .collect();
        CommandOutput::ok(lines.join("\n"))
    }

    fn send_key(&mut self, session: &str, window: &str, forced: bool) -> CommandOutput {
        let Some(w) = self
            .sessions
            .get_mut(session)
            .and_then(|ws| ws.get_mut(window))
        else {
            return CommandOutput::new(1, "", "can't find window");
        };
        if w.dead {
            return CommandOutput::ok("");
        }
        let dies = match w.reaction {
            Reaction::Die => true,
            Reaction::IgnoreInterrupt => forced,
            Reaction::DieAfterPolls(_) | Reaction::Ignore => false,
        };
        w.signalled = true;
        if dies {
            w.dead = true;
            w.exit_status = if forced { 131 } else { 130 };
        }
        CommandOutput::ok("")
    }

    fn tmux(&mut self, command: &str) -> CommandOutput {
        // Only the first of a chain of `\;`-separated tmux commands matters here
        let head = command.split(" \\; ").next().unwrap_or(command);
        let tokens: Vec<&str> = head.split_whitespace().collect();
        let flag = |name: &str| -> Option<String> {
            tokens
                .iter()
                .position(|t| *t == name)
                .and_then(|i| tokens.get(i + 1))
                .map(|v| v.trim_matches('\'').to_string())
        };
        let target = flag("-t").unwrap_or_default();
        let (session, window) = match target.split_once(':') {
            Some((s, w)) => (s.to_string(), w.to_string()),
            None => (target.clone(), String::new()),
        };

        match tokens.get(1).copied() {
            Some("list-windows") => self.list(&session),
            Some("has-session") => {
                // grouped-session ensure: `has-session -t =W || new-session -d -t S -s W`
                self.grouped.insert(session.trim_start_matches('=').to_string());
                CommandOutput::ok("")
            }
            Some("new-session") => {
                let (Some(s), Some(w)) = (flag("-s"), flag("-n")) else {
                    return CommandOutput::new(1, "", "bad new-session");
                };
                if self.sessions.contains_key(&s) {
                    return CommandOutput::new(1, "", format!("duplicate session: {}", s));
                }
                let win = self.spawn_window(&w);
                self.sessions.insert(s, BTreeMap::from([(w, win)]));
                CommandOutput::ok("")
            }
            Some("new-window") => {
                let Some(w) = flag("-n") else {
                    return CommandOutput::new(1, "", "bad new-window");
                };
                let win = self.spawn_window(&w);
                match self.sessions.get_mut(&session) {
                    Some(windows) => {
                        windows.insert(w, win);
                        CommandOutput::ok("")
                    }
                    None => CommandOutput::new(1, "", "can't find session"),
                }
            }
            Some("respawn-window") => {
                let fresh = self.spawn_window(&window);
                match self
                    .sessions
                    .get_mut(&session)
                    .and_then(|ws| ws.get_mut(&window))
                {
                    Some(w) if w.dead => {
                        *w = fresh;
                        CommandOutput::ok("")
                    }
                    Some(_) => CommandOutput::new(1, "", "respawn window failed: still active"),
                    None => CommandOutput::new(1, "", "can't find window"),
                }
            }
            Some("send-keys") => {
                let forced = head.contains("C-\\");
                self.send_key(&session, &window, forced)
            }
            Some("kill-session") => match self.sessions.remove(&session) {
                Some(_) => CommandOutput::ok(""),
                None => CommandOutput::new(1, "", "can't find session"),
            },
            _ => CommandOutput::ok(""),
        }
    }

    fn scripted(&mut self, command: &str) -> Option<CommandOutput> {
        let script = self
            .scripts
            .iter_mut()
            .find(|s| command.contains(&s.pattern))?;
        if script.outputs.len() > 1 {
            script.outputs.pop_front()
        } else {
            script.outputs.front().cloned()
        }
    }

    fn run(&mut self, command: &str) -> CommandOutput {
        if let Some(path) = command.strip_prefix("test -f ") {
            let path = PathBuf::from(path.trim_matches('\''));
            return CommandOutput::status(if self.files.contains_key(&path) { 0 } else { 1 });
        }
        if let Some(path) = command.strip_prefix("touch ") {
            self.files
                .insert(PathBuf::from(path.trim_matches('\'')), Vec::new());
            return CommandOutput::ok("");
        }
        if let Some(path) = command.strip_prefix("rm -f ") {
            self.files.remove(&PathBuf::from(path.trim_matches('\'')));
            return CommandOutput::ok("");
        }
        if command.starts_with("tmux ") {
            return self.tmux(command);
        }
        self.scripted(command).unwrap_or_default()
    }
}

/// In-memory tmux host for tests
#[derive(Debug, Clone)]
pub struct MockChannel {
    host: String,
    state: Arc<Mutex<TmuxState>>,
    log: CallLog,
}

impl MockChannel {
    /// Create an empty host recording into `log`
    pub fn new(host: impl Into<String>, log: CallLog) -> Self {
        Self {
            host: host.into(),
            state: Arc::new(Mutex::new(TmuxState::default())),
            log,
        }
    }

    pub fn log(&self) -> &CallLog {
        &self.log
    }

    /// Make windows named `window` react to control keys with `reaction`
    pub fn set_reaction(&self, window: &str, reaction: Reaction) {
        self.state
            .lock()
            .unwrap()
            .reactions
            .insert(window.to_string(), reaction);
    }

    /// Make windows named `window` die by themselves after `polls` listings
    pub fn set_lifetime(&self, window: &str, polls: u32) {
        self.state
            .lock()
            .unwrap()
            .lifetimes
            .insert(window.to_string(), polls);
    }

    /// Answer non-tmux commands containing `pattern` with the given outputs
    ///
    /// Outputs are consumed in order; the last one repeats forever.
    pub fn script(&self, pattern: &str, outputs: Vec<CommandOutput>) {
        assert!(!outputs.is_empty());
        self.state.lock().unwrap().scripts.push(Script {
            pattern: pattern.to_string(),
            outputs: outputs.into(),
        });
    }

    /// Lines returned by every `stream` call
    pub fn set_stream_lines(&self, lines: &[&str]) {
        self.state.lock().unwrap().stream_lines = lines.iter().map(|l| l.to_string()).collect();
    }

    /// Put a window into the simulated server directly
    pub fn add_window(&self, session: &str, window: &str, dead: bool) {
        let mut state = self.state.lock().unwrap();
        let mut win = state.spawn_window(window);
        win.dead = dead;
        state
            .sessions
            .entry(session.to_string())
            .or_default()
            .insert(window.to_string(), win);
    }

    pub fn add_file(&self, path: impl Into<PathBuf>) {
        self.state.lock().unwrap().files.insert(path.into(), Vec::new());
    }

    pub fn has_file(&self, path: &Path) -> bool {
        self.state.lock().unwrap().files.contains_key(path)
    }

    pub fn has_session(&self, session: &str) -> bool {
        self.state.lock().unwrap().sessions.contains_key(session)
    }

    pub fn has_grouped_session(&self, name: &str) -> bool {
        self.state.lock().unwrap().grouped.contains(name)
    }

    /// (pid, dead) of a window, if present
    pub fn window(&self, session: &str, window: &str) -> Option<(u32, bool)> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .get(session)
            .and_then(|ws| ws.get(window))
            .map(|w| (w.pid, w.dead))
    }
}

#[async_trait]
impl RemoteChannel for MockChannel {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        self.log.push(&self.host, command);
        let output = self.state.lock().unwrap().run(command);
        // Give other tasks a chance to interleave, like a real round trip
        tokio::task::yield_now().await;
        Ok(output)
    }

    async fn put(&self, data: &[u8], path: &Path, _mode: u32) -> Result<()> {
        self.log
            .push(&self.host, &format!("put {}", path.display()));
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    async fn stream(&self, command: &str) -> Result<LineStream> {
        self.log.push(&self.host, command);
        let lines: Vec<Result<String>> = self
            .state
            .lock()
            .unwrap()
            .stream_lines
            .iter()
            .cloned()
            .map(Ok)
            .collect();
        Ok(stream::iter(lines).boxed())
    }
}

/// Connector handing out one `MockChannel` per host and counting connections
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    log: CallLog,
    hosts: Arc<Mutex<HashMap<String, MockChannel>>>,
    connects: Arc<Mutex<HashMap<String, u32>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> &CallLog {
        &self.log
    }

    /// The simulated host named `host`, created on first access
    pub fn host(&self, host: &str) -> MockChannel {
        self.hosts
            .lock()
            .unwrap()
            .entry(host.to_string())
            .or_insert_with(|| MockChannel::new(host, self.log.clone()))
            .clone()
    }

    /// Number of times a connection to `host` was set up
    pub fn connects(&self, host: &str) -> u32 {
        self.connects.lock().unwrap().get(host).copied().unwrap_or(0)
    }

    pub fn total_connects(&self) -> u32 {
        self.connects.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, machine: &Machine) -> crate::error::Result<Arc<dyn RemoteChannel>> {
        let host = machine.host_id().to_string();
        *self.connects.lock().unwrap().entry(host.clone()).or_insert(0) += 1;
        tokio::task::yield_now().await;
        Ok(Arc::new(self.host(&host)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = "tmux list-windows -t demo -F '#{session_name} #{window_name}'";

    fn channel() -> MockChannel {
        MockChannel::new("local", CallLog::new())
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let ch = channel();
        assert_eq!(ch.run(LIST).await.unwrap().exit_code, 1);

        ch.run("tmux new-session -d -s demo -n db /tmp/w db \"x\" \\; set-option -t demo mouse on")
            .await
            .unwrap();
        ch.run("tmux new-window -d -t demo: -n web /tmp/w web \"y\"")
            .await
            .unwrap();

        let out = ch.run(LIST).await.unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("demo db 1001 0"));
        assert!(lines[1].starts_with("demo web 1002 0"));
    }

    #[tokio::test]
    async fn test_signal_reactions() {
        let ch = channel();
        ch.set_reaction("stubborn", Reaction::IgnoreInterrupt);
        ch.add_window("demo", "stubborn", false);
        ch.add_window("demo", "soft", false);

        ch.run("tmux send-keys -t demo:soft C-c").await.unwrap();
        ch.run("tmux send-keys -t demo:stubborn C-c").await.unwrap();
        assert_eq!(ch.window("demo", "soft").map(|w| w.1), Some(true));
        assert_eq!(ch.window("demo", "stubborn").map(|w| w.1), Some(false));

        ch.run("tmux send-keys -t demo:stubborn 'C-\\'").await.unwrap();
        assert_eq!(ch.window("demo", "stubborn").map(|w| w.1), Some(true));
    }

    #[tokio::test]
    async fn test_respawn_only_dead_windows() {
        let ch = channel();
        ch.add_window("demo", "db", false);
        let out = ch.run("tmux respawn-window -t demo:db /tmp/w db \"x\"").await.unwrap();
        assert_eq!(out.exit_code, 1);

        ch.run("tmux send-keys -t demo:db C-c").await.unwrap();
        let out = ch.run("tmux respawn-window -t demo:db /tmp/w db \"x\"").await.unwrap();
        assert!(out.success());
        assert_eq!(ch.window("demo", "db").map(|w| w.1), Some(false));
    }

    #[tokio::test]
    async fn test_scripts_and_files() {
        let ch = channel();
        ch.script(
            "check",
            vec![CommandOutput::status(1), CommandOutput::ok("up")],
        );
        assert_eq!(ch.run("bash -ic check").await.unwrap().exit_code, 1);
        assert_eq!(ch.run("bash -ic check").await.unwrap().stdout, "up");
        assert_eq!(ch.run("bash -ic check").await.unwrap().stdout, "up");
        assert!(ch.run("anything else").await.unwrap().success());

        ch.run("touch '/tmp/marker'").await.unwrap();
        assert!(ch.has_file(Path::new("/tmp/marker")));
        ch.run("rm -f '/tmp/marker'").await.unwrap();
        assert!(!ch.has_file(Path::new("/tmp/marker")));
        assert_eq!(ch.log().count("marker"), 2);
    }

    #[tokio::test]
    async fn test_connector_counts_and_shares_hosts() {
        let connector = MockConnector::new();
        let a = connector.connect(&Machine::Local).await.unwrap();
        let _b = connector.connect(&Machine::Local).await.unwrap();
        a.run("echo hi").await.unwrap();
        assert_eq!(connector.connects("local"), 2);
        assert_eq!(connector.log().count("echo hi"), 1);
        assert_eq!(connector.host("local").log().count("echo hi"), 1);
    }
}
