/*!
 * Runtime settings for Concert
 *
 * The process graph itself is described in `graph`; this module holds the
 * knobs that shape how the engine and the transports behave.
 */

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tuning for the execution engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Target cadence of readiness probes in milliseconds
    #[serde(default = "default_ready_poll_ms")]
    pub ready_poll_ms: u64,

    /// Liveness poll period while stopping, in milliseconds
    #[serde(default = "default_stop_poll_ms")]
    pub stop_poll_ms: u64,

    /// Failed liveness polls before escalating to the forced signal
    #[serde(default = "default_escalate_after")]
    pub escalate_after: u32,

    /// Directory on every host holding the helper resources and marker files
    #[serde(default = "default_helper_dir")]
    pub helper_dir: PathBuf,

    /// Suppress per-process progress lines
    #[serde(default)]
    pub quiet: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ready_poll_ms: default_ready_poll_ms(),
            stop_poll_ms: default_stop_poll_ms(),
            escalate_after: default_escalate_after(),
            helper_dir: default_helper_dir(),
            quiet: false,
        }
    }
}

impl EngineConfig {
    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_ms)
    }
}

/// SSH connection settings shared by every remote machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshSettings {
    /// Private key tried after the SSH agent
    #[serde(default)]
    pub identity: Option<PathBuf>,

    /// Port used when the machine string does not name one
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            identity: None,
            port: default_ssh_port(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl SshSettings {
    /// Key files tried in order after the agent: explicit identity first,
    /// then the usual defaults under `~/.ssh`
    pub fn identity_candidates(&self) -> Vec<PathBuf> {
        let mut keys: Vec<PathBuf> = self.identity.iter().cloned().collect();
        if let Some(home) = dirs::home_dir() {
            for name in ["id_ed25519", "id_rsa"] {
                let path = home.join(".ssh").join(name);
                if !keys.contains(&path) {
                    keys.push(path);
                }
            }
        }
        keys
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

fn default_ready_poll_ms() -> u64 {
    660
}

fn default_stop_poll_ms() -> u64 {
    1000
}

fn default_escalate_after() -> u32 {
    5
}

fn default_helper_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_ssh_port() -> u16 {
    22
}

fn default_timeout_secs() -> u64 {
    30
}
