//! Fork/exec launch sequence.
//!
//! The parent prepares everything that needs memory (the argument vector, a
//! raw copy of the descriptor table) before calling `fork`. Between `fork`
//! and `exec` the child only makes async-signal-safe libc calls: it wires its
//! pipe ends onto stdin/stdout, optionally writes the handshake byte, and
//! execs. If `exec` returns, the child writes the error code to the error
//! pipe and leaves with `_exit`, skipping every destructor and atexit hook.

use std::ffi::CString;
use std::os::fd::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::unistd::{fork, ForkResult, Pid};

use crate::detect::encode_report;
use crate::error::{Error, Result};
use crate::pipe::RawTable;
use crate::tube::poll_retry;

/// Sentinel the child writes to its stdout right before `exec`.
pub const HANDSHAKE_BYTE: u8 = 0x06;

/// Exit code of a child whose wiring or `exec` failed.
pub const EXEC_FAILED_EXIT: i32 = 127;

/// A NUL-terminated `argv` built ahead of `fork`.
#[derive(Debug)]
pub struct ArgVector {
    args: Vec<CString>,
    ptrs: Vec<*const libc::c_char>,
}

impl ArgVector {
    /// Argument 0 names the program, searched for on `PATH`; the rest are
    /// passed through verbatim.
    pub fn new<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        if args.is_empty() {
            return Err(Error::ContractViolation(
                "need at least one argument for the program name".into(),
            ));
        }
        let args = args
            .iter()
            .map(|a| {
                CString::new(a.as_ref()).map_err(|_| {
                    Error::ContractViolation(format!(
                        "argument contains an interior NUL byte: {:?}",
                        a.as_ref()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let ptrs = args
            .iter()
            .map(|a| a.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        Ok(Self { args, ptrs })
    }

    pub fn program(&self) -> &str {
        self.args[0].to_str().unwrap_or("<non-utf8>")
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// Fork and start the target program in the child.
///
/// Returns the child's pid in the parent. The child never returns from here.
/// The parent still owns every descriptor in `table` afterwards and must close
/// the child's ends itself.
///
/// # Safety
/// The descriptors in `table` must be open (or `-1`) for the duration of the
/// call.
pub unsafe fn spawn(argv: &ArgVector, table: RawTable, handshake: bool) -> Result<Pid> {
    match fork().map_err(|source| Error::ResourceAllocation {
        what: "fork",
        source,
    })? {
        ForkResult::Child => exec_child(argv, table, handshake),
        ForkResult::Parent { child } => Ok(child),
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

/// Best-effort failure report, then exit. Never blocks: with nobody reading,
/// the report is dropped.
unsafe fn report_and_exit(error_write: RawFd, errno: i32) -> ! {
    if error_write >= 0 {
        let flags = libc::fcntl(error_write, libc::F_GETFL);
        if flags != -1 {
            libc::fcntl(error_write, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        let report = encode_report(errno);
        libc::write(
            error_write,
            report.as_ptr() as *const libc::c_void,
            report.len(),
        );
    }
    libc::_exit(EXEC_FAILED_EXIT)
}

/// Move a descriptor out of the stdio range so the `dup2` calls below cannot
/// clobber it. The copy stays close-on-exec.
unsafe fn lift_above_stdio(fd: RawFd, error_write: RawFd) -> RawFd {
    if fd < 0 || fd > libc::STDERR_FILENO {
        return fd;
    }
    let lifted = libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, libc::STDERR_FILENO + 1);
    if lifted == -1 {
        report_and_exit(error_write, last_errno());
    }
    lifted
}

unsafe fn exec_child(argv: &ArgVector, table: RawTable, handshake: bool) -> ! {
    for fd in [table.parent_read, table.parent_write, table.error_read] {
        if fd >= 0 {
            libc::close(fd);
        }
    }

    let error_write = lift_above_stdio(table.error_write, -1);
    let child_read = lift_above_stdio(table.child_read, error_write);
    let child_write = lift_above_stdio(table.child_write, error_write);

    if libc::dup2(child_read, libc::STDIN_FILENO) == -1
        || libc::dup2(child_write, libc::STDOUT_FILENO) == -1
    {
        report_and_exit(error_write, last_errno());
    }
    libc::close(child_read);
    libc::close(child_write);

    // Don't hand the parent's SIGPIPE policy to the target program.
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);

    if handshake {
        let byte = [HANDSHAKE_BYTE];
        libc::write(
            libc::STDOUT_FILENO,
            byte.as_ptr() as *const libc::c_void,
            1,
        );
    }

    libc::execvp(argv.ptrs[0], argv.ptrs.as_ptr());
    report_and_exit(error_write, last_errno())
}

/// Outcome of waiting for the handshake byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Received,
    /// Output closed before the byte arrived: the child died while wiring.
    Eof,
    TimedOut,
}

/// Wait up to `timeout` for the child's handshake byte on `fd` and consume it.
pub fn await_handshake(fd: RawFd, timeout: Duration) -> Result<Handshake> {
    let mut pfd = [libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }];
    if poll_retry(&mut pfd, Some(timeout))? == 0 {
        return Ok(Handshake::TimedOut);
    }

    let mut byte = [0u8; 1];
    loop {
        let n = unsafe { libc::read(fd, byte.as_mut_ptr() as *mut libc::c_void, 1) };
        if n < 0 {
            match Errno::last() {
                Errno::EINTR => continue,
                source => {
                    return Err(Error::Io {
                        what: "handshake read",
                        source,
                    })
                }
            }
        }
        if n == 0 {
            return Ok(Handshake::Eof);
        }
        if byte[0] != HANDSHAKE_BYTE {
            return Err(Error::Wire(format!(
                "unexpected handshake byte {:#04x}",
                byte[0]
            )));
        }
        return Ok(Handshake::Received);
    }
}
