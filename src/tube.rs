//! Blocking byte I/O over the child's pipes.
//!
//! Provides the line buffer behind [`Channel::read_line`](crate::channel::Channel::read_line)
//! plus the raw read/write/poll loops it is built on. Everything here blocks
//! the calling thread; nothing is thread-safe on its own.

use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;

use crate::error::{Error, Result};

/// Bytes received from the child and not yet handed out as lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Split off the first complete line, newline included.
    pub fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        Some(self.buffer.drain(..=pos).collect())
    }

    /// Everything left, complete line or not.
    pub fn take_rest(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// `poll(2)` that survives signal interruptions.
///
/// `None` waits forever. Returns the number of ready descriptors, zero on
/// timeout.
pub(crate) fn poll_retry(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> Result<usize> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let timeout_ms = match deadline {
            None => -1,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                // Round up so a sub-millisecond remainder still waits.
                remaining.as_micros().div_ceil(1000).min(i32::MAX as u128) as i32
            }
        };
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        match Errno::last() {
            Errno::EINTR => continue,
            source => return Err(Error::Io { what: "poll", source }),
        }
    }
}

/// Read at most `chunk_size` bytes from `fd` into `into`.
///
/// Blocks until data or end of stream; returns 0 at end of stream.
pub fn read_chunk(fd: RawFd, chunk_size: usize, into: &mut LineBuffer) -> Result<usize> {
    let mut tmp = vec![0u8; chunk_size];
    loop {
        let n = unsafe { libc::read(fd, tmp.as_mut_ptr() as *mut libc::c_void, chunk_size) };
        if n < 0 {
            match Errno::last() {
                Errno::EINTR => continue,
                source => return Err(Error::Io { what: "read", source }),
            }
        }
        let n = n as usize;
        into.extend(&tmp[..n]);
        tracing::trace!(fd, bytes = n, "read chunk");
        return Ok(n);
    }
}

/// Write all of `data` to `fd`.
pub fn write_all(fd: RawFd, data: &[u8]) -> Result<()> {
    let mut total = 0;
    while total < data.len() {
        let n = unsafe {
            libc::write(
                fd,
                data[total..].as_ptr() as *const libc::c_void,
                data.len() - total,
            )
        };
        if n < 0 {
            match Errno::last() {
                Errno::EINTR => continue,
                source => return Err(Error::Io { what: "write", source }),
            }
        }
        if n == 0 {
            return Err(Error::Io {
                what: "write",
                source: Errno::EPIPE,
            });
        }
        total += n as usize;
    }
    Ok(())
}
