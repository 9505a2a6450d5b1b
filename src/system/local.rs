//! Local subprocess implementation of RemoteChannel
//!
//! Commands for the "local" pseudo-host run as `bash -c <command>` children of
//! the concert process, so the same shell command lines work on local and
//! remote machines.

use concert_core_interface::{
    ChannelError, CommandOutput, LineStream, RemoteChannel, Result,
};
use futures::stream::{self, StreamExt};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::graph::LOCAL_HOST;

/// Local implementation of RemoteChannel
///
/// # Example
///
/// ```rust,no_run
/// use concert::system::LocalChannel;
/// use concert_core_interface::RemoteChannel;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let channel = LocalChannel::new();
///     let output = channel.run("tmux -V").await?;
///     println!("{}", output.stdout);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalChannel;

impl LocalChannel {
    pub fn new() -> Self {
        Self
    }

    fn shell(command: &str) -> Command {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command).stdin(Stdio::null());
        cmd
    }
}

#[async_trait::async_trait]
impl RemoteChannel for LocalChannel {
    fn host(&self) -> &str {
        LOCAL_HOST
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        debug!("[local] running: {}", command);
        let output = Self::shell(command).output().await?;

        // Killed by a signal: no exit code, report like a shell would
        let code = output.status.code().unwrap_or(-1);
        let result = CommandOutput::new(
            code,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
        debug!("[local] exit code {} for: {}", code, command);
        Ok(result)
    }

    async fn put(&self, data: &[u8], path: &Path, mode: u32) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, data).await?;
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
        debug!("[local] wrote {} bytes to {}", data.len(), path.display());
        Ok(())
    }

    async fn stream(&self, command: &str) -> Result<LineStream> {
        debug!("[local] streaming: {}", command);
        let mut child = Self::shell(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| ChannelError::Transport {
            host: LOCAL_HOST.to_string(),
            reason: "child stdout not captured".to_string(),
        })?;
        let lines = BufReader::new(stdout).lines();

        // The child rides along in the state so dropping the stream kills it
        let stream = stream::unfold((lines, child), |(mut lines, child)| async move {
            match lines.next_line().await {
                Ok(Some(line)) => Some((Ok(line), (lines, child))),
                Ok(None) => None,
                Err(e) => Some((Err(ChannelError::Io(e)), (lines, child))),
            }
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concert_core_interface::RemoteChannelExt;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_run_collects_output_and_code() {
        let channel = LocalChannel::new();
        let out = channel
            .run("echo hello; echo oops >&2; exit 3")
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.stderr, "oops");
        assert_eq!(channel.host(), "local");
    }

    #[tokio::test]
    async fn test_put_sets_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("helper.bash");
        let channel = LocalChannel::new();

        channel.put(b"#!/bin/bash\necho hi\n", &path, 0o755).await.unwrap();

        assert!(channel.file_exists(&path).await.unwrap());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        let out = channel.run_checked(&path.display().to_string()).await.unwrap();
        assert_eq!(out.stdout, "hi");
    }

    #[tokio::test]
    async fn test_stream_yields_lines_until_exit() {
        let channel = LocalChannel::new();
        let lines: Vec<String> = channel
            .stream("printf 'a\\nb\\nc\\n'")
            .await
            .unwrap()
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_file_exists_missing() {
        let channel = LocalChannel::new();
        assert!(!channel
            .file_exists(Path::new("/nonexistent/concert/helper"))
            .await
            .unwrap());
    }
}
