//! Channel implementations for the RemoteChannel trait
//!
//! This module provides concrete implementations of the `RemoteChannel` trait:
//! - `LocalChannel`: subprocesses on the machine running concert
//! - `SshChannel`: exec requests over an SSH session (feature `ssh`)
//! - `MockChannel`: in-memory tmux simulator for testing (in tests module)

mod local;

#[cfg(feature = "ssh")]
mod ssh;

pub use local::LocalChannel;

#[cfg(feature = "ssh")]
pub use ssh::{SshAuth, SshChannel, SshConfig, PASSPHRASE_ENV};

#[cfg(test)]
pub mod mock;

#[cfg(test)]
pub use mock::{CallLog, MockChannel, MockConnector, Reaction};
