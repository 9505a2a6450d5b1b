/*!
 * Connection and helper-resource pool
 *
 * One channel per host identity, opened on first use and kept for the rest of
 * the invocation. Opening a channel also makes sure the helper resources are
 * present on that host.
 */

use async_trait::async_trait;
use concert_core_interface::{RemoteChannel, RemoteChannelExt};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::SshSettings;
use crate::error::Result;
use crate::graph::Machine;
use crate::session::WRAPPER_NAME;
use crate::system::LocalChannel;

/// File name of the process-tree inspector helper
pub const PS_TREE_NAME: &str = "concert_launcher_print_ps_tree.py";

const WRAPPER_SOURCE: &str = include_str!("../resources/concert_launcher_wrapper.bash");
const PS_TREE_SOURCE: &str = include_str!("../resources/concert_launcher_print_ps_tree.py");

/// Opens channels to machines
///
/// The seam between the pool and the transports; tests substitute a mock.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, machine: &Machine) -> Result<Arc<dyn RemoteChannel>>;
}

/// Connector backed by local subprocesses and SSH
#[derive(Debug, Clone, Default)]
pub struct SystemConnector {
    ssh: SshSettings,
}

impl SystemConnector {
    pub fn new(ssh: SshSettings) -> Self {
        Self { ssh }
    }
}

#[async_trait]
impl Connector for SystemConnector {
    async fn connect(&self, machine: &Machine) -> Result<Arc<dyn RemoteChannel>> {
        match machine {
            Machine::Local => Ok(Arc::new(LocalChannel::new())),
            #[cfg(feature = "ssh")]
            Machine::Remote(remote) => {
                use crate::system::{SshChannel, SshConfig};
                let config = SshConfig::for_host(remote, &self.ssh)?;
                Ok(Arc::new(SshChannel::connect(config).await?))
            }
            #[cfg(not(feature = "ssh"))]
            Machine::Remote(remote) => {
                let _ = &self.ssh;
                Err(concert_core_interface::ChannelError::Unsupported(format!(
                    "{}: built without the `ssh` feature",
                    remote.identity()
                ))
                .into())
            }
        }
    }
}

/// A helper file expected on every target host
#[derive(Debug, Clone)]
pub struct HelperResource {
    pub name: &'static str,
    pub contents: &'static str,
    pub mode: u32,
}

/// The fixed helper set and the directory it lives in on every host
#[derive(Debug, Clone)]
pub struct HelperResources {
    dir: PathBuf,
    helpers: Vec<HelperResource>,
}

impl HelperResources {
    /// Launch wrapper and process-tree inspector under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            helpers: vec![
                HelperResource {
                    name: WRAPPER_NAME,
                    contents: WRAPPER_SOURCE,
                    mode: 0o755,
                },
                HelperResource {
                    name: PS_TREE_NAME,
                    contents: PS_TREE_SOURCE,
                    mode: 0o644,
                },
            ],
        }
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Upload every helper missing on the channel's host
    ///
    /// Returns the number of uploads. Existing files are never overwritten.
    pub async fn bootstrap(&self, channel: &dyn RemoteChannel) -> Result<usize> {
        let mut uploaded = 0;
        for helper in &self.helpers {
            let path = self.path_of(helper.name);
            if channel.file_exists(&path).await? {
                debug!("[{}] {} present", channel.host(), path.display());
                continue;
            }
            info!("[{}] uploading {}", channel.host(), path.display());
            channel
                .put(helper.contents.as_bytes(), &path, helper.mode)
                .await?;
            uploaded += 1;
        }
        Ok(uploaded)
    }
}

type ChannelCell = Arc<OnceCell<Arc<dyn RemoteChannel>>>;

/// Per-host channel cache
///
/// Each host has its own cell: setting up one connection never holds up a
/// lookup for another host, and concurrent first uses of one host share a
/// single connect. A failed setup leaves the cell empty for the next caller.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    resources: HelperResources,
    channels: Mutex<HashMap<String, ChannelCell>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, resources: HelperResources) -> Self {
        Self {
            connector,
            resources,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn resources(&self) -> &HelperResources {
        &self.resources
    }

    fn cell(&self, host: &str) -> ChannelCell {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// The pooled channel for `machine`, connecting and bootstrapping on first use
    pub async fn get(&self, machine: &Machine) -> Result<Arc<dyn RemoteChannel>> {
        let host = machine.host_id();
        let cell = self.cell(host);
        if let Some(channel) = cell.get() {
            return Ok(channel.clone());
        }

        let channel = cell
            .get_or_try_init(|| async {
                info!("Opening connection to {}", host);
                let channel = self.connector.connect(machine).await?;
                self.resources.bootstrap(channel.as_ref()).await?;
                Ok::<_, crate::error::ConcertError>(channel)
            })
            .await?;
        Ok(channel.clone())
    }

    /// Hosts with an open channel
    pub async fn connected_hosts(&self) -> Vec<String> {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let mut hosts: Vec<String> = channels
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(host, _)| host.clone())
            .collect();
        hosts.sort();
        hosts
    }
}
