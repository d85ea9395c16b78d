//! Launch configuration.

use std::os::fd::OwnedFd;
use std::time::Duration;

/// Default bound on the wait for the child's handshake byte.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default window for an exec-failure report to arrive after the handshake.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(20);

/// Default size of a single read from the child's output.
pub const DEFAULT_CHUNK_SIZE: usize = 255;

/// How the parent learns that `exec` failed in the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectStrategy {
    /// Multiplex the error pipe with every read of normal output.
    #[default]
    Drain,
    /// A `SIGCHLD` handler drains the error pipe into a per-launch cell.
    Signal,
}

impl std::str::FromStr for DetectStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "drain" => Ok(DetectStrategy::Drain),
            "signal" => Ok(DetectStrategy::Signal),
            other => Err(format!("unknown detect strategy: {}", other)),
        }
    }
}

/// Options controlling how a [`Channel`](crate::channel::Channel) launches its child.
#[derive(Debug)]
pub struct LaunchOptions {
    pub handshake: bool,
    pub handshake_timeout: Duration,
    pub grace: Duration,
    pub strategy: DetectStrategy,
    pub chunk_size: usize,
    /// Readable descriptor to use as the child's stdin instead of a fresh pipe.
    pub stdin: Option<OwnedFd>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            handshake: true,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            grace: DEFAULT_GRACE,
            strategy: DetectStrategy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            stdin: None,
        }
    }
}

impl LaunchOptions {
    pub fn with_handshake(mut self, enabled: bool) -> Self {
        self.handshake = enabled;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_strategy(mut self, strategy: DetectStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the read chunk size. Zero is clamped to one byte.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn with_stdin(mut self, fd: OwnedFd) -> Self {
        self.stdin = Some(fd);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = LaunchOptions::default();
        assert!(opts.handshake);
        assert_eq!(opts.handshake_timeout, Duration::from_secs(1));
        assert_eq!(opts.grace, Duration::from_millis(20));
        assert_eq!(opts.strategy, DetectStrategy::Drain);
        assert_eq!(opts.chunk_size, 255);
        assert!(opts.stdin.is_none());
    }

    #[test]
    fn chunk_size_never_zero() {
        assert_eq!(LaunchOptions::default().with_chunk_size(0).chunk_size, 1);
    }

    #[test]
    fn parse_strategy() {
        assert_eq!("drain".parse::<DetectStrategy>(), Ok(DetectStrategy::Drain));
        assert_eq!(" Signal ".parse::<DetectStrategy>(), Ok(DetectStrategy::Signal));
        assert!("select".parse::<DetectStrategy>().is_err());
    }
}
