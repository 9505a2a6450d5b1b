/*!
 * Concert - dependency-aware process launcher over tmux
 *
 * Starts, stops and inspects long-running processes described in a YAML
 * graph, on the local machine and on SSH-reachable hosts:
 * - Dependencies started first, each process driven once per invocation
 * - One tmux window per persistent process, surviving client disconnects
 * - Readiness probes and one-shot commands
 * - Parameter templates with selectable variants
 * - Graceful stop with escalation to a forced signal
 * - Tiled monitor session attaching to every process
 */

pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod logging;
pub mod monitor;
pub mod pool;
pub mod progress;
pub mod resolve;
pub mod session;
pub mod system;

// Re-export commonly used types
pub use config::{EngineConfig, LogLevel, SshSettings};
pub use engine::{Engine, ProcessStatus, RunState, StartRequest, StatusOptions};
pub use error::{ConcertError, Result};
pub use graph::{load_graph, Machine, ProcessGraph, ProcessSpec};
pub use pool::{ConnectionPool, Connector, HelperResources, SystemConnector};
pub use progress::Progress;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
