//! Concert Core Interface: Remote Channel Abstraction
//!
//! This crate defines the `RemoteChannel` trait, which abstracts command
//! execution on a target host so the launcher can drive processes on the local
//! machine and on SSH-reachable machines through the same operation set.
//!
//! # Architecture
//!
//! The `RemoteChannel` trait provides three categories of operations:
//!
//! 1. **Execution**: Run a shell command and collect exit code, stdout and stderr
//! 2. **Transfer**: Upload a file (helper scripts) to the target host
//! 3. **Streaming**: Follow the output of a long-running command line by line
//!
//! # Example
//!
//! ```rust,no_run
//! use concert_core_interface::{RemoteChannel, RemoteChannelExt};
//!
//! async fn uptime<C: RemoteChannel>(channel: &C) -> concert_core_interface::Result<String> {
//!     let output = channel.run_checked("uptime").await?;
//!     Ok(output.stdout)
//! }
//! ```

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection to {host} failed: {reason}")]
    ConnectionFailed { host: String, reason: String },

    #[error("Authentication to {host} failed: {reason}")]
    AuthenticationFailed { host: String, reason: String },

    #[error("Command `{command}` on {host} returned {code}")]
    NonZeroExit {
        host: String,
        command: String,
        code: i32,
    },

    #[error("Transport error on {host}: {reason}")]
    Transport { host: String, reason: String },

    #[error("Operation not supported: {0}")]
    Unsupported(String),
}

impl ChannelError {
    /// Whether the error comes from the link to the host rather than from
    /// the command that ran on it
    pub fn is_transport(&self) -> bool {
        !matches!(self, ChannelError::NonZeroExit { .. })
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Stream of output lines produced by [`RemoteChannel::stream`]
pub type LineStream = BoxStream<'static, Result<String>>;

/// Outcome of a command executed through a channel
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code of the command (-1 when the channel could not obtain one)
    pub exit_code: i32,

    /// Captured standard output, trailing whitespace trimmed
    pub stdout: String,

    /// Captured standard error, trailing whitespace trimmed
    pub stderr: String,
}

impl CommandOutput {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into().trim_end().to_string(),
            stderr: stderr.into().trim_end().to_string(),
        }
    }

    /// Output of a command that exited 0 with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::new(0, stdout, "")
    }

    /// Output of a command that exited with `code` and printed nothing
    pub fn status(code: i32) -> Self {
        Self::new(code, "", "")
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Text worth showing when the command failed
    ///
    /// Channels that merge stderr into stdout leave `stderr` empty.
    pub fn diagnostic(&self) -> &str {
        if self.stderr.is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }

    /// Non-empty stdout lines
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().filter(|l| !l.trim().is_empty())
    }
}

/// The uniform operation set over a target host
///
/// Implementations:
/// - **LocalChannel**: runs commands as local subprocesses
/// - **SshChannel**: runs commands over a shared SSH session
/// - **MockChannel**: in-memory tmux simulator for tests
///
/// A channel is shared by every process targeting its host, so all methods
/// take `&self` and implementations must tolerate interleaved calls.
#[async_trait]
pub trait RemoteChannel: Send + Sync + 'static {
    /// Host identity this channel is bound to ("local" for the local machine)
    fn host(&self) -> &str;

    /// Run a shell command to completion
    ///
    /// A non-zero exit code is not an error at this level; it is reported in
    /// the returned [`CommandOutput`]. Errors are reserved for failures of the
    /// channel itself.
    async fn run(&self, command: &str) -> Result<CommandOutput>;

    /// Write `data` to `path` on the target host with the given permission bits
    async fn put(&self, data: &[u8], path: &Path, mode: u32) -> Result<()>;

    /// Start a long-running command and stream its stdout line by line
    ///
    /// The stream ends when the command exits.
    async fn stream(&self, command: &str) -> Result<LineStream>;
}

/// Convenience methods derived from the core trait
#[async_trait]
pub trait RemoteChannelExt: RemoteChannel {
    /// Run a command and turn a non-zero exit code into an error
    async fn run_checked(&self, command: &str) -> Result<CommandOutput> {
        let output = self.run(command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ChannelError::NonZeroExit {
                host: self.host().to_string(),
                command: command.to_string(),
                code: output.exit_code,
            })
        }
    }

    /// Check whether a regular file exists on the target host
    async fn file_exists(&self, path: &Path) -> Result<bool> {
        let output = self
            .run(&format!("test -f '{}'", path.display()))
            .await?;
        Ok(output.success())
    }
}

// Blanket implementation for all RemoteChannel implementations
impl<T: RemoteChannel + ?Sized> RemoteChannelExt for T {}
