use std::time::Duration;

use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Misuse of the API, detected before any OS resource is touched.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("failed to {what}: {source}")]
    ResourceAllocation {
        what: &'static str,
        #[source]
        source: Errno,
    },

    /// The child could not wire its descriptors and died before the handshake.
    #[error("child wiring failed: {0}")]
    Wire(String),

    #[error("failed to execute {program}: {errno}")]
    Exec { program: String, errno: Errno },

    #[error("child {pid} did not complete the handshake within {waited:?}")]
    HandshakeTimeout { pid: Pid, waited: Duration },

    #[error("{what} failed: {source}")]
    Io {
        what: &'static str,
        #[source]
        source: Errno,
    },

    #[error("waitpid error: {0}")]
    Wait(#[from] Errno),
}

impl Error {
    /// The OS error code behind this failure, if there is one.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::ResourceAllocation { source, .. } | Error::Io { source, .. } => Some(*source),
            Error::Exec { errno, .. } => Some(*errno),
            Error::Wait(errno) => Some(*errno),
            Error::ContractViolation(_) | Error::Wire(_) | Error::HandshakeTimeout { .. } => None,
        }
    }

    pub fn is_exec_failure(&self) -> bool {
        matches!(self, Error::Exec { .. })
    }

    pub(crate) fn io(what: &'static str) -> Self {
        Error::Io {
            what,
            source: Errno::last(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
