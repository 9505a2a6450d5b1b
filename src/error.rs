/*!
 * Error types for Concert
 */

use concert_core_interface::ChannelError;
use std::fmt;
use std::io;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, ConcertError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_REMOTE: i32 = 3;

#[derive(Debug)]
pub enum ConcertError {
    /// Invalid or unreadable configuration document
    Config(String),

    /// Template placeholder with no value in any parameter layer
    MissingParameter { process: String, key: String },

    /// Process name not present in the graph
    UnknownProcess(String),

    /// `depends` edges forming a cycle (path lists the cycle, first == last)
    DependencyCycle(Vec<String>),

    /// Window alive where a fresh spawn was expected
    ProtocolViolation { session: String, window: String },

    /// Window died while its readiness probe was being polled
    ReadinessFailed { session: String, window: String },

    /// Multiplexer or helper command returned an unexpected exit code
    CommandFailed {
        host: String,
        command: String,
        code: i32,
    },

    /// Failure of the channel to a host
    Channel(ChannelError),

    /// I/O error
    Io(io::Error),

    /// A dependency (or dependent, on stop) of `process` failed
    Dependency {
        process: String,
        source: Arc<ConcertError>,
    },

    /// Failure observed by a caller that waited on another caller's work
    Shared(Arc<ConcertError>),
}

impl ConcertError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ConcertError::Channel(e) if e.is_transport() => EXIT_REMOTE,
            ConcertError::Io(_) => EXIT_REMOTE,
            ConcertError::Dependency { source, .. } => source.exit_code(),
            ConcertError::Shared(inner) => inner.exit_code(),
            _ => EXIT_FATAL,
        }
    }

    /// Check if this error is fatal (aborts the invocation, never retried)
    pub fn is_fatal(&self) -> bool {
        match self {
            ConcertError::Config(_)
            | ConcertError::MissingParameter { .. }
            | ConcertError::UnknownProcess(_)
            | ConcertError::DependencyCycle(_)
            | ConcertError::ProtocolViolation { .. }
            | ConcertError::ReadinessFailed { .. } => true,

            ConcertError::CommandFailed { .. } => false,
            ConcertError::Channel(_) => false,
            ConcertError::Io(_) => false,

            ConcertError::Dependency { source, .. } => source.is_fatal(),
            ConcertError::Shared(inner) => inner.is_fatal(),
        }
    }

    /// The innermost error, looking through dependency and sharing wrappers
    pub fn root_cause(&self) -> &ConcertError {
        match self {
            ConcertError::Dependency { source, .. } => source.root_cause(),
            ConcertError::Shared(inner) => inner.root_cause(),
            other => other,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self.root_cause() {
            ConcertError::Config(_)
            | ConcertError::MissingParameter { .. }
            | ConcertError::UnknownProcess(_)
            | ConcertError::DependencyCycle(_) => ErrorCategory::Configuration,
            ConcertError::ProtocolViolation { .. } => ErrorCategory::Protocol,
            ConcertError::ReadinessFailed { .. } => ErrorCategory::Readiness,
            ConcertError::CommandFailed { .. } => ErrorCategory::RemoteCommand,
            ConcertError::Channel(_) | ConcertError::Io(_) => ErrorCategory::Transport,
            ConcertError::Dependency { .. } | ConcertError::Shared(_) => ErrorCategory::Unknown,
        }
    }

    /// Unwrap an error stored for deduplicated callers
    ///
    /// The caller that drove the work gets the original error back when it is
    /// the last holder; everyone else sees it through `Shared`.
    pub fn from_shared(err: Arc<ConcertError>) -> Self {
        Arc::try_unwrap(err).unwrap_or_else(ConcertError::Shared)
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Configuration document and template errors
    Configuration,
    /// Multiplexer state contradicting the launch protocol
    Protocol,
    /// Readiness probe could not complete
    Readiness,
    /// Helper or multiplexer command failures
    RemoteCommand,
    /// Connection and channel errors
    Transport,
    /// Uncategorized errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Readiness => write!(f, "readiness"),
            ErrorCategory::RemoteCommand => write!(f, "remote-command"),
            ErrorCategory::Transport => write!(f, "transport"),
            ErrorCategory::Unknown => write!(f, "unknown"),
        }
    }
}

impl fmt::Display for ConcertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcertError::Config(msg) => {
                write!(f, "Configuration error: {}", msg)
            }
            ConcertError::MissingParameter { process, key } => {
                write!(
                    f,
                    "Configuration error: process '{}' uses parameter '{}' which has no value",
                    process, key
                )
            }
            ConcertError::UnknownProcess(name) => {
                write!(f, "Unknown process: {}", name)
            }
            ConcertError::DependencyCycle(path) => {
                write!(f, "Dependency cycle: {}", path.join(" -> "))
            }
            ConcertError::ProtocolViolation { session, window } => {
                write!(f, "Window {}:{} exists and is not dead", session, window)
            }
            ConcertError::ReadinessFailed { session, window } => {
                write!(
                    f,
                    "Process {}:{} no longer exists while waiting for readiness",
                    session, window
                )
            }
            ConcertError::CommandFailed {
                host,
                command,
                code,
            } => {
                write!(f, "Command `{}` on {} returned {}", command, host, code)
            }
            ConcertError::Channel(err) => {
                write!(f, "Channel error: {}", err)
            }
            ConcertError::Io(err) => {
                write!(f, "I/O error: {}", err)
            }
            ConcertError::Dependency { process, source } => {
                write!(f, "{} failed: {}", process, source)
            }
            ConcertError::Shared(inner) => inner.fmt(f),
        }
    }
}

impl std::error::Error for ConcertError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConcertError::Io(err) => Some(err),
            ConcertError::Channel(err) => Some(err),
            ConcertError::Dependency { source, .. } => Some(source.as_ref()),
            ConcertError::Shared(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for ConcertError {
    fn from(err: io::Error) -> Self {
        ConcertError::Io(err)
    }
}

impl From<ChannelError> for ConcertError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::NonZeroExit {
                host,
                command,
                code,
            } => ConcertError::CommandFailed {
                host,
                command,
                code,
            },
            other => ConcertError::Channel(other),
        }
    }
}

impl From<serde_yaml::Error> for ConcertError {
    fn from(err: serde_yaml::Error) -> Self {
        ConcertError::Config(format!("YAML parse error: {}", err))
    }
}
