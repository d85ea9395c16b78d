//! Exec-failure detection.
//!
//! A child whose `exec` fails writes the raw OS error code, as a native-endian
//! `i32`, to its error pipe and exits. The error pipe's write end is
//! close-on-exec, so after a successful `exec` the parent sees a hang-up on
//! the read end and never any data.
//!
//! Two ways of collecting the report are provided:
//!
//! - [`DetectStrategy::Drain`](crate::config::DetectStrategy::Drain): the
//!   parent polls the error pipe together with the output pipe on every read
//!   (see [`wait_report`] and the tube read loop).
//! - [`DetectStrategy::Signal`](crate::config::DetectStrategy::Signal): a
//!   `SIGCHLD` handler drains every registered error pipe into a per-launch
//!   cell (see [`signal`]).

use std::os::fd::RawFd;
use std::time::Duration;

use nix::errno::Errno;

use crate::error::{Error, Result};
use crate::tube::poll_retry;

/// Size of one exec-failure report on the wire.
pub const REPORT_LEN: usize = std::mem::size_of::<i32>();

/// What the error pipe said.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    /// The child's `exec` failed with this error.
    Failed(Errno),
    /// The write end is gone without a report: `exec` happened, or the child
    /// died without reaching it.
    Clean,
    /// Nothing arrived yet.
    Pending,
}

pub fn encode_report(errno: i32) -> [u8; REPORT_LEN] {
    errno.to_ne_bytes()
}

/// Decode a report. A zero code means no failure was reported.
pub fn decode_report(bytes: &[u8]) -> Option<Errno> {
    let raw: [u8; REPORT_LEN] = bytes.get(..REPORT_LEN)?.try_into().ok()?;
    match i32::from_ne_bytes(raw) {
        0 => None,
        code => Some(Errno::from_raw(code)),
    }
}

/// Read one report from `fd`. On a non-blocking descriptor an empty pipe
/// yields [`Report::Pending`].
pub fn read_report(fd: RawFd) -> Result<Report> {
    let mut buf = [0u8; REPORT_LEN];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, REPORT_LEN) };
        if n < 0 {
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::EAGAIN => return Ok(Report::Pending),
                source => {
                    return Err(Error::Io {
                        what: "error pipe read",
                        source,
                    })
                }
            }
        }
        let n = n as usize;
        if n == 0 {
            return Ok(Report::Clean);
        }
        // Writes of at most PIPE_BUF bytes are atomic, so a short read means
        // the child wrote garbage.
        return Ok(match decode_report(&buf[..n]) {
            Some(errno) => Report::Failed(errno),
            None => Report::Clean,
        });
    }
}

/// Wait up to `timeout` for the error pipe to become readable, then read it.
pub fn wait_report(fd: RawFd, timeout: Duration) -> Result<Report> {
    let mut pfd = [libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }];
    if poll_retry(&mut pfd, Some(timeout))? == 0 {
        return Ok(Report::Pending);
    }
    read_report(fd)
}

/// Which of the two watched pipes woke the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
    Output,
    Report(Report),
}

/// Block until the output pipe or the error pipe has something to say.
///
/// The error pipe wins when both are ready, so a failed `exec` is reported
/// instead of the end-of-stream it also causes.
pub fn wait_output_or_report(output_fd: RawFd, error_fd: RawFd) -> Result<Ready> {
    let mut pfds = [
        libc::pollfd {
            fd: output_fd,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: error_fd,
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    poll_retry(&mut pfds, None)?;
    if pfds[1].revents != 0 {
        return Ok(Ready::Report(read_report(error_fd)?));
    }
    Ok(Ready::Output)
}

/// Switch a descriptor to non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(Error::io("fcntl(O_NONBLOCK)"));
    }
    Ok(())
}

/// Signal-driven collection of exec-failure reports.
///
/// Each live launch owns one [`Registration`]: a cell in a fixed static table
/// holding its error pipe's read end, its child pid and the recorded error
/// code. The `SIGCHLD` handler only touches atomics and calls `read(2)`, so it
/// stays async-signal-safe. Every cell has its own pipe, which keeps one
/// child's report from ever landing in another launch's cell.
///
/// A cell is read only once its child pid is bound. Dropping a registration
/// waits for a handler that is mid-read on that cell, so the descriptor is
/// never closed under it.
///
/// The handler (and the `SIGPIPE` ignore policy) is installed when the first
/// registration is made and the previous dispositions are restored when the
/// last one is dropped.
pub mod signal {
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
    use std::sync::Mutex;

    use nix::errno::Errno;
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use nix::unistd::Pid;

    use super::{decode_report, set_nonblocking, REPORT_LEN};
    use crate::error::{Error, Result};

    /// Maximum number of simultaneously live signal-strategy launches.
    pub const MAX_LIVE: usize = 64;

    const FREE: i32 = -1;
    /// Cell is being released; neither claimable nor readable.
    const CLOSING: i32 = -2;

    struct Cell {
        error_fd: AtomicI32,
        /// Child the cell belongs to; 0 until the fork has happened.
        pid: AtomicI32,
        errno: AtomicI32,
        /// Set while the handler is reading `error_fd`.
        busy: AtomicBool,
    }

    impl Cell {
        const fn new() -> Self {
            Self {
                error_fd: AtomicI32::new(FREE),
                pid: AtomicI32::new(0),
                errno: AtomicI32::new(0),
                busy: AtomicBool::new(false),
            }
        }

        /// Pull a pending report out of the error pipe. Runs in the handler.
        fn collect(&self) {
            if self.pid.load(Ordering::Acquire) == 0 || self.errno.load(Ordering::Acquire) != 0 {
                return;
            }
            let fd = self.error_fd.load(Ordering::SeqCst);
            if fd < 0 {
                return;
            }
            let mut buf = [0u8; REPORT_LEN];
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, REPORT_LEN) };
            if n == REPORT_LEN as isize {
                if let Some(errno) = decode_report(&buf) {
                    self.errno.store(errno as i32, Ordering::Release);
                }
            }
        }
    }

    static CELLS: [Cell; MAX_LIVE] = [const { Cell::new() }; MAX_LIVE];

    struct Activation {
        live: usize,
        prev_chld: Option<SigAction>,
        prev_pipe: Option<SigAction>,
    }

    static ACTIVATION: Mutex<Activation> = Mutex::new(Activation {
        live: 0,
        prev_chld: None,
        prev_pipe: None,
    });

    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe fn errno_location() -> *mut libc::c_int {
        libc::__errno_location()
    }

    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    unsafe fn errno_location() -> *mut libc::c_int {
        libc::__error()
    }

    extern "C" fn on_child_exit(_: libc::c_int) {
        let saved = unsafe { *errno_location() };
        for cell in CELLS.iter() {
            if cell
                .busy
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }
            cell.collect();
            cell.busy.store(false, Ordering::SeqCst);
        }
        unsafe { *errno_location() = saved };
    }

    fn activate(state: &mut Activation) -> Result<()> {
        let handler = SigAction::new(
            SigHandler::Handler(on_child_exit),
            SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let prev_chld = unsafe { sigaction(Signal::SIGCHLD, &handler) }.map_err(|source| {
            Error::ResourceAllocation {
                what: "install SIGCHLD handler",
                source,
            }
        })?;
        let prev_pipe = match unsafe { sigaction(Signal::SIGPIPE, &ignore) } {
            Ok(prev) => prev,
            Err(source) => {
                let _ = unsafe { sigaction(Signal::SIGCHLD, &prev_chld) };
                return Err(Error::ResourceAllocation {
                    what: "ignore SIGPIPE",
                    source,
                });
            }
        };
        state.prev_chld = Some(prev_chld);
        state.prev_pipe = Some(prev_pipe);
        tracing::debug!("signal-driven exec-failure detection activated");
        Ok(())
    }

    fn deactivate(state: &mut Activation) {
        if let Some(prev) = state.prev_chld.take() {
            let _ = unsafe { sigaction(Signal::SIGCHLD, &prev) };
        }
        if let Some(prev) = state.prev_pipe.take() {
            let _ = unsafe { sigaction(Signal::SIGPIPE, &prev) };
        }
        tracing::debug!("signal-driven exec-failure detection deactivated");
    }

    /// Number of live registrations.
    pub fn live_count() -> usize {
        ACTIVATION.lock().map(|state| state.live).unwrap_or(0)
    }

    /// One launch's cell in the registry. Dropping it frees the cell.
    #[derive(Debug)]
    pub struct Registration {
        index: usize,
    }

    impl Registration {
        /// Claim a cell watching `error_fd` and switch that descriptor to
        /// non-blocking mode. Must happen before `fork`, so a report can never
        /// arrive ahead of its cell.
        pub fn register(error_fd: i32) -> Result<Self> {
            set_nonblocking(error_fd)?;
            let mut state = ACTIVATION.lock().unwrap_or_else(|e| e.into_inner());
            let index = CELLS
                .iter()
                .position(|cell| {
                    cell.error_fd
                        .compare_exchange(FREE, error_fd, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                })
                .ok_or(Error::ResourceAllocation {
                    what: "claim exec-failure registry cell",
                    source: Errno::EAGAIN,
                })?;
            CELLS[index].errno.store(0, Ordering::Release);
            CELLS[index].pid.store(0, Ordering::Release);

            if state.live == 0 {
                if let Err(e) = activate(&mut state) {
                    CELLS[index].error_fd.store(FREE, Ordering::Release);
                    return Err(e);
                }
            }
            state.live += 1;
            Ok(Registration { index })
        }

        /// Arm the cell for `pid`. Until then the handler leaves the error pipe
        /// alone and a report stays there for the caller's own read.
        pub fn bind_pid(&self, pid: Pid) {
            CELLS[self.index].pid.store(pid.as_raw(), Ordering::Release);
        }

        /// The error recorded by the handler, if any.
        pub fn recorded(&self) -> Option<Errno> {
            match CELLS[self.index].errno.load(Ordering::Acquire) {
                0 => None,
                raw => Some(Errno::from_raw(raw)),
            }
        }
    }

    impl Drop for Registration {
        fn drop(&mut self) {
            let cell = &CELLS[self.index];
            // The descriptor is closed right after this returns, so a handler
            // running on another thread must be out of `read` first.
            cell.error_fd.store(CLOSING, Ordering::SeqCst);
            while cell.busy.load(Ordering::SeqCst) {
                std::hint::spin_loop();
            }
            cell.pid.store(0, Ordering::Release);
            cell.errno.store(0, Ordering::Release);
            cell.error_fd.store(FREE, Ordering::SeqCst);

            let mut state = ACTIVATION.lock().unwrap_or_else(|e| e.into_inner());
            state.live = state.live.saturating_sub(1);
            if state.live == 0 {
                deactivate(&mut state);
            }
        }
    }

    #[cfg(test)]
    pub(crate) static TEST_GUARD: Mutex<()> = Mutex::new(());

}
