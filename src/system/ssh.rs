//! SSH implementation of RemoteChannel
//!
//! Commands run as exec requests on a shared `ssh2` session. `ssh2` is
//! blocking, so every operation is moved onto tokio's blocking pool.

use concert_core_interface::{ChannelError, CommandOutput, LineStream, RemoteChannel, Result};
use futures::stream::{self, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use ssh2::Session;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::SshSettings;
use crate::graph::RemoteHost;

/// Environment variable holding the passphrase of encrypted key files
pub const PASSPHRASE_ENV: &str = "CONCERT_SSH_PASSPHRASE";

/// SSH authentication method
#[derive(Debug, Clone)]
pub enum SshAuth {
    /// SSH agent authentication
    Agent,

    /// Public key authentication with private key file
    KeyFile {
        /// Path to private key file
        key_path: PathBuf,
        /// Optional passphrase for the key
        passphrase: Option<SecretString>,
    },
}

/// Connection parameters for one remote host
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Host identity as written in the configuration (`user@host[:port]`)
    pub identity: String,

    /// Hostname or IP address
    pub host: String,

    /// Port (default: 22)
    pub port: u16,

    /// Username
    pub username: String,

    /// Authentication methods, tried in order until one succeeds
    pub auth: Vec<SshAuth>,

    /// Connection timeout in seconds
    pub timeout_secs: u64,
}

impl SshConfig {
    /// Build the configuration for `remote`
    ///
    /// The agent is tried first, then every existing key file from
    /// `settings`. The user defaults to `$USER` when the machine string does
    /// not name one.
    pub fn for_host(remote: &RemoteHost, settings: &SshSettings) -> Result<Self> {
        let username = match &remote.user {
            Some(user) => user.clone(),
            None => std::env::var("USER").map_err(|_| ChannelError::ConnectionFailed {
                host: remote.identity().to_string(),
                reason: "no user in machine string and $USER is not set".to_string(),
            })?,
        };

        let passphrase = std::env::var(PASSPHRASE_ENV).ok().map(SecretString::from);
        let mut auth = vec![SshAuth::Agent];
        auth.extend(
            settings
                .identity_candidates()
                .into_iter()
                .filter(|p| p.exists())
                .map(|key_path| SshAuth::KeyFile {
                    key_path,
                    passphrase: passphrase.clone(),
                }),
        );

        Ok(Self {
            identity: remote.identity().to_string(),
            host: remote.host.clone(),
            port: remote.port.unwrap_or(settings.port),
            username,
            auth,
            timeout_secs: settings.timeout_secs,
        })
    }

    fn connection_failed(&self, reason: impl Into<String>) -> ChannelError {
        ChannelError::ConnectionFailed {
            host: self.identity.clone(),
            reason: reason.into(),
        }
    }
}

fn transport_error(host: &str, reason: impl Into<String>) -> ChannelError {
    ChannelError::Transport {
        host: host.to_string(),
        reason: reason.into(),
    }
}

fn join_error(host: &str, e: tokio::task::JoinError) -> ChannelError {
    transport_error(host, format!("Task join error: {}", e))
}

/// Blocking SSH connection and authentication
fn open_session(config: &SshConfig) -> Result<Session> {
    let addr = format!("{}:{}", config.host, config.port);
    let timeout = Duration::from_secs(config.timeout_secs);

    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| config.connection_failed(format!("cannot resolve {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| config.connection_failed(format!("no address for {}", addr)))?;
    let tcp = TcpStream::connect_timeout(&socket_addr, timeout)
        .map_err(|e| config.connection_failed(format!("{}: {}", addr, e)))?;

    let mut session = Session::new()
        .map_err(|e| config.connection_failed(format!("Failed to create SSH session: {}", e)))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(config.timeout_secs as u32 * 1000); // milliseconds
    session
        .handshake()
        .map_err(|e| config.connection_failed(format!("handshake: {}", e)))?;

    let mut failures = Vec::new();
    for method in &config.auth {
        let attempt = match method {
            SshAuth::Agent => agent_auth(&session, &config.username),
            SshAuth::KeyFile {
                key_path,
                passphrase,
            } => {
                let pass: Option<&str> = passphrase.as_ref().map(|p| p.expose_secret());
                session
                    .userauth_pubkey_file(&config.username, None, key_path, pass)
                    .map_err(|e| format!("key {}: {}", key_path.display(), e))
            }
        };
        match attempt {
            Ok(()) if session.authenticated() => break,
            Ok(()) => failures.push("not authenticated".to_string()),
            Err(reason) => failures.push(reason),
        }
    }

    if !session.authenticated() {
        return Err(ChannelError::AuthenticationFailed {
            host: config.identity.clone(),
            reason: failures.join("; "),
        });
    }

    // Blocking reads of long-running commands must not time out
    session.set_timeout(0);
    Ok(session)
}

fn agent_auth(session: &Session, username: &str) -> std::result::Result<(), String> {
    let mut agent = session
        .agent()
        .map_err(|e| format!("Failed to connect to SSH agent: {}", e))?;
    agent
        .connect()
        .map_err(|e| format!("Failed to connect to SSH agent: {}", e))?;
    agent
        .list_identities()
        .map_err(|e| format!("Failed to list SSH agent identities: {}", e))?;
    let identities = agent
        .identities()
        .map_err(|e| format!("Failed to get SSH agent identities: {}", e))?;

    for identity in identities {
        if agent.userauth(username, &identity).is_ok() {
            return Ok(());
        }
    }
    Err("No valid identity found in SSH agent".to_string())
}

/// Run `command` to completion on `session`
///
/// stderr is merged into the stdout stream on the server side: reading the two
/// streams one after the other stalls once the unread one fills its window.
fn exec_blocking(session: &Session, host: &str, command: &str) -> Result<CommandOutput> {
    let transport = |what: &str, e: ssh2::Error| transport_error(host, format!("{}: {}", what, e));

    let mut channel = session
        .channel_session()
        .map_err(|e| transport("open channel", e))?;
    channel
        .handle_extended_data(ssh2::ExtendedData::Merge)
        .map_err(|e| transport("merge stderr", e))?;
    channel.exec(command).map_err(|e| transport("exec", e))?;

    let output = read_merged(&mut channel)?;

    channel.wait_close().map_err(|e| transport("close", e))?;
    let code = channel.exit_status().map_err(|e| transport("exit status", e))?;

    Ok(CommandOutput::new(code, output, String::new()))
}

/// Drain the merged output stream, replacing invalid UTF-8
fn read_merged(mut reader: impl Read) -> std::io::Result<String> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// SSH implementation of RemoteChannel
///
/// One session per host is shared by every process on it; `stream` opens a
/// dedicated session so a long-lived `tail -F` never holds up other commands.
pub struct SshChannel {
    config: SshConfig,
    session: Arc<Session>,
}

impl SshChannel {
    /// Connect and authenticate
    pub async fn connect(config: SshConfig) -> Result<Self> {
        let host = config.identity.clone();
        info!("Opening SSH connection to {}", host);

        let session = tokio::task::spawn_blocking({
            let config = config.clone();
            move || open_session(&config)
        })
        .await
        .map_err(|e| join_error(&host, e))??;

        Ok(Self {
            config,
            session: Arc::new(session),
        })
    }
}

#[async_trait::async_trait]
impl RemoteChannel for SshChannel {
    fn host(&self) -> &str {
        &self.config.identity
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        let session = self.session.clone();
        let host = self.config.identity.clone();
        let command = command.to_string();
        debug!("[{}] running: {}", host, command);

        let output = tokio::task::spawn_blocking({
            let host = host.clone();
            move || exec_blocking(&session, &host, &command)
        })
        .await
        .map_err(|e| join_error(&host, e))??;

        debug!("[{}] exit code {}", host, output.exit_code);
        Ok(output)
    }

    async fn put(&self, data: &[u8], path: &Path, mode: u32) -> Result<()> {
        let session = self.session.clone();
        let host = self.config.identity.clone();
        let data = data.to_vec();
        let path = path.to_path_buf();
        debug!("[{}] uploading {} bytes to {}", host, data.len(), path.display());

        tokio::task::spawn_blocking({
            let host = host.clone();
            move || -> Result<()> {
                let mut remote = session
                    .scp_send(&path, (mode & 0o777) as i32, data.len() as u64, None)
                    .map_err(|e| transport_error(&host, format!("scp {}: {}", path.display(), e)))?;
                remote.write_all(&data)?;
                remote
                    .send_eof()
                    .and_then(|_| remote.wait_eof())
                    .and_then(|_| remote.close())
                    .and_then(|_| remote.wait_close())
                    .map_err(|e| transport_error(&host, format!("scp {}: {}", path.display(), e)))?;
                Ok(())
            }
        })
        .await
        .map_err(|e| join_error(&host, e))?
    }

    async fn stream(&self, command: &str) -> Result<LineStream> {
        let config = self.config.clone();
        let host = config.identity.clone();
        let command = command.to_string();
        let (tx, rx) = mpsc::channel::<Result<String>>(64);
        debug!("[{}] streaming: {}", host, command);

        let session = tokio::task::spawn_blocking(move || open_session(&config))
            .await
            .map_err(|e| join_error(&host, e))??;

        tokio::task::spawn_blocking(move || {
            let mut channel = match session.channel_session() {
                Ok(channel) => channel,
                Err(e) => {
                    let _ = tx.blocking_send(Err(transport_error(&host, e.to_string())));
                    return;
                }
            };
            if let Err(e) = channel.exec(&command) {
                let _ = tx.blocking_send(Err(transport_error(&host, e.to_string())));
                return;
            }

            let reader = BufReader::new(&mut channel);
            for line in reader.lines() {
                let item = line.map_err(ChannelError::Io);
                let failed = item.is_err();
                // Receiver dropped: the caller stopped watching
                if tx.blocking_send(item).is_err() || failed {
                    break;
                }
            }
            let _ = channel.close();
        });

        let lines = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(lines.boxed())
    }
}
