//! A child process reached only through its stdin/stdout pipes.
//!
//! [`Channel::spawn`] runs the whole launch synchronously: allocate the pipe
//! set, fork, wire and exec the child, then confirm that `exec` really
//! happened before returning. A failed `exec` surfaces as [`Error::Exec`]
//! carrying the real OS error, never as a generic broken pipe.
//!
//! Dropping a `Channel` closes every descriptor it still owns and reaps the
//! child exactly once. Reaping blocks until the child exits; closing the
//! child's stdin first lets well-behaved filters finish on their own.

use std::os::fd::OwnedFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::config::{DetectStrategy, LaunchOptions};
use crate::detect::{self, signal::Registration, Ready, Report};
use crate::error::{Error, Result};
use crate::launch::{self, ArgVector, Handshake};
use crate::pipe::{PipeSet, Role};
use crate::tube::{self, LineBuffer};
use crate::types::ExitStatus;

/// Duplex, line-oriented connection to one child process.
///
/// Not meant to be shared: every call blocks and assumes it is the only
/// operation in flight on this channel.
#[derive(Debug)]
pub struct Channel {
    pid: Pid,
    program: String,
    pipes: PipeSet,
    buffer: LineBuffer,
    eof: bool,
    strategy: DetectStrategy,
    registration: Option<Registration>,
    chunk_size: usize,
    reaped: bool,
    status: Option<ExitStatus>,
}

impl Channel {
    /// Launch `args[0]` (searched on `PATH`) with the remaining arguments,
    /// using the default options.
    pub fn spawn<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        Self::spawn_with(args, LaunchOptions::default())
    }

    pub fn spawn_with<S: AsRef<str>>(args: &[S], mut opts: LaunchOptions) -> Result<Self> {
        let argv = ArgVector::new(args)?;
        let mut pipes = PipeSet::allocate(true, opts.stdin.take())?;

        let registration = match opts.strategy {
            DetectStrategy::Signal => {
                let fd = pipes
                    .raw(Role::ErrorRead)
                    .ok_or_else(|| Error::ContractViolation("error pipe missing".into()))?;
                Some(Registration::register(fd)?)
            }
            DetectStrategy::Drain => None,
        };

        // On failure `pipes` and `registration` drop here: nothing leaks and
        // there is no child to wait for.
        let pid = unsafe { launch::spawn(&argv, pipes.raw_table(), opts.handshake)? };
        pipes.close_child_ends();
        if let Some(reg) = &registration {
            reg.bind_pid(pid);
        }
        tracing::debug!(%pid, program = argv.program(), strategy = ?opts.strategy, "spawned child");

        // From here on, Drop reaps the child whatever happens next.
        let mut channel = Channel {
            pid,
            program: argv.program().to_string(),
            pipes,
            buffer: LineBuffer::new(),
            eof: false,
            strategy: opts.strategy,
            registration,
            chunk_size: opts.chunk_size.max(1),
            reaped: false,
            status: None,
        };
        channel.await_ready(&opts)?;
        Ok(channel)
    }

    fn exec_error(&self, errno: Errno) -> Error {
        Error::Exec {
            program: self.program.clone(),
            errno,
        }
    }

    fn await_ready(&mut self, opts: &LaunchOptions) -> Result<()> {
        if !opts.handshake {
            return Ok(());
        }
        let out = self
            .pipes
            .raw(Role::ParentRead)
            .ok_or_else(|| Error::ContractViolation("output pipe missing".into()))?;

        match launch::await_handshake(out, opts.handshake_timeout)? {
            Handshake::Received => {}
            Handshake::Eof => {
                let detail = match self.pipes.raw(Role::ErrorRead) {
                    Some(fd) => match detect::wait_report(fd, opts.grace)? {
                        Report::Failed(errno) => format!("descriptor setup failed: {}", errno),
                        Report::Clean | Report::Pending => "no report".to_string(),
                    },
                    None => "no report".to_string(),
                };
                return Err(Error::Wire(format!(
                    "child {} exited before the handshake ({})",
                    self.pid, detail
                )));
            }
            Handshake::TimedOut => {
                let _ = nix::sys::signal::kill(self.pid, Signal::SIGKILL);
                return Err(Error::HandshakeTimeout {
                    pid: self.pid,
                    waited: opts.handshake_timeout,
                });
            }
        }
        tracing::debug!(pid = %self.pid, "handshake received");

        match self.strategy {
            DetectStrategy::Drain => self.drain_window(opts.grace),
            DetectStrategy::Signal => {
                std::thread::sleep(opts.grace);
                match self.pending_exec_failure()? {
                    Some(errno) => Err(self.exec_error(errno)),
                    None => Ok(()),
                }
            }
        }
    }

    /// Give an exec-failure report up to `grace` to arrive on the error pipe.
    fn drain_window(&mut self, grace: Duration) -> Result<()> {
        let Some(fd) = self.pipes.raw(Role::ErrorRead) else {
            return Ok(());
        };
        match detect::wait_report(fd, grace)? {
            Report::Failed(errno) => Err(self.exec_error(errno)),
            Report::Clean => {
                // Close-on-exec took the write end: exec happened.
                self.pipes.error_read.close();
                Ok(())
            }
            Report::Pending => Ok(()),
        }
    }

    /// An exec failure that has been reported but not yet surfaced.
    fn pending_exec_failure(&mut self) -> Result<Option<Errno>> {
        if let Some(errno) = self.registration.as_ref().and_then(|r| r.recorded()) {
            return Ok(Some(errno));
        }
        let Some(fd) = self.pipes.raw(Role::ErrorRead) else {
            return Ok(None);
        };
        match detect::wait_report(fd, Duration::ZERO)? {
            Report::Failed(errno) => Ok(Some(errno)),
            Report::Clean if self.registration.is_none() => {
                self.pipes.error_read.close();
                Ok(None)
            }
            Report::Clean | Report::Pending => Ok(None),
        }
    }

    /// The child's process id.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Write `data` to the child's stdin. Writing nothing is a no-op.
    pub fn write(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        let data = data.as_ref();
        if data.is_empty() {
            return Ok(());
        }
        let fd = self.pipes.raw(Role::ParentWrite).ok_or_else(|| {
            Error::ContractViolation("child input is closed or not owned by this channel".into())
        })?;
        match tube::write_all(fd, data) {
            Ok(()) => Ok(()),
            Err(err) => match self.pending_exec_failure() {
                Ok(Some(errno)) => Err(self.exec_error(errno)),
                _ => Err(err),
            },
        }
    }

    /// Write `data` followed by a newline.
    pub fn write_line(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        let mut line = data.as_ref().to_vec();
        line.push(b'\n');
        self.write(line)
    }

    /// Next line of output with its trailing newline, as raw bytes.
    ///
    /// At end of stream returns whatever partial line is left, then empty
    /// results from then on.
    pub fn read_line_bytes(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(line) = self.buffer.take_line() {
                return Ok(line);
            }
            if self.eof {
                return Ok(self.buffer.take_rest());
            }
            let Some(out) = self.pipes.raw(Role::ParentRead) else {
                return Ok(self.buffer.take_rest());
            };

            if self.strategy == DetectStrategy::Drain {
                if let Some(err_fd) = self.pipes.raw(Role::ErrorRead) {
                    match detect::wait_output_or_report(out, err_fd)? {
                        Ready::Output => {}
                        Ready::Report(Report::Failed(errno)) => {
                            return Err(self.exec_error(errno))
                        }
                        Ready::Report(Report::Clean) => {
                            self.pipes.error_read.close();
                            continue;
                        }
                        Ready::Report(Report::Pending) => continue,
                    }
                }
            }

            if tube::read_chunk(out, self.chunk_size, &mut self.buffer)? == 0 {
                self.eof = true;
                if self.strategy == DetectStrategy::Signal {
                    if let Some(errno) = self.pending_exec_failure()? {
                        return Err(self.exec_error(errno));
                    }
                }
            }
        }
    }

    /// Next line of output, decoded lossily as UTF-8.
    pub fn read_line(&mut self) -> Result<String> {
        let line = self.read_line_bytes()?;
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Close the child's stdin so it sees end of input.
    pub fn close_input(&mut self) {
        self.pipes.parent_write.close();
    }

    /// Hand the read end of the child's stdout to the caller, e.g. to feed
    /// another child's stdin directly.
    pub fn take_output(&mut self) -> Result<OwnedFd> {
        if !self.buffer.is_empty() {
            return Err(Error::ContractViolation(
                "output has buffered bytes that would be lost".into(),
            ));
        }
        self.pipes
            .parent_read
            .take()
            .ok_or_else(|| Error::ContractViolation("output already taken".into()))
    }

    pub fn kill(&self, signal: Signal) -> Result<()> {
        if self.reaped {
            return Err(Error::ContractViolation(format!(
                "child {} was already reaped",
                self.pid
            )));
        }
        nix::sys::signal::kill(self.pid, signal).map_err(|source| Error::Io {
            what: "kill",
            source,
        })
    }

    /// Exit status, once the child has been reaped.
    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    fn record(&mut self, status: ExitStatus) -> ExitStatus {
        self.reaped = true;
        self.status = Some(status);
        tracing::debug!(pid = %self.pid, %status, "reaped child");
        status
    }

    /// Close every descriptor and wait for the child to exit.
    ///
    /// The child is reaped only once; later calls return the same status.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        self.release();
        if let Some(status) = self.status {
            return Ok(status);
        }
        if self.reaped {
            return Err(Error::Wait(Errno::ECHILD));
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(ws) => {
                    if let Some(status) = ExitStatus::from_wait(ws) {
                        return Ok(self.record(status));
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    // Never wait on this pid again, whatever happened to it.
                    self.reaped = true;
                    return Err(Error::Wait(errno));
                }
            }
        }
    }

    /// Reap the child if it has already exited, without blocking.
    /// Descriptors stay open so buffered output can still be read.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if self.reaped {
            return Ok(self.status);
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(ws) => Ok(ExitStatus::from_wait(ws).map(|status| self.record(status))),
            Err(Errno::EINTR) => Ok(None),
            Err(errno) => {
                self.reaped = true;
                Err(Error::Wait(errno))
            }
        }
    }

    /// Drop the registry cell, then every descriptor. The cell must go first
    /// so the signal handler never reads a closed (or reused) descriptor.
    fn release(&mut self) {
        self.registration.take();
        self.pipes.close_all();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.reaped {
            self.release();
            return;
        }
        if let Err(e) = self.wait() {
            tracing::warn!(pid = %self.pid, error = %e, "failed to reap child");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::signal::TEST_GUARD;

    fn sh(script: &str) -> Channel {
        Channel::spawn(&["sh", "-c", script]).expect("sh should start")
    }

    #[test]
    fn echo_round_trip() {
        let mut ch = Channel::spawn(&["cat"]).unwrap();
        assert!(ch.pid().as_raw() > 0);
        ch.write("hello\n").unwrap();
        assert_eq!(ch.read_line().unwrap(), "hello\n");
        ch.write_line("again").unwrap();
        assert_eq!(ch.read_line().unwrap(), "again\n");
        ch.close_input();
        assert_eq!(ch.read_line().unwrap(), "");
        assert_eq!(ch.wait().unwrap(), ExitStatus::Exited(0));
    }

    #[test]
    fn child_is_running_after_spawn() {
        let mut ch = Channel::spawn(&["cat"]).unwrap();
        assert_eq!(ch.try_wait().unwrap(), None);
        nix::sys::signal::kill(ch.pid(), None).expect("child should exist");
    }

    #[test]
    fn handshake_byte_not_visible() {
        let mut ch = sh("printf 'first\\n'");
        assert_eq!(ch.read_line().unwrap(), "first\n");
    }

    #[test]
    fn partial_line_is_joined() {
        let mut ch = sh("printf ab; sleep 0.05; printf 'c\\n'");
        assert_eq!(ch.read_line().unwrap(), "abc\n");
        assert_eq!(ch.read_line().unwrap(), "");
    }

    #[test]
    fn tail_without_newline() {
        let mut ch = sh("printf tail");
        assert_eq!(ch.read_line().unwrap(), "tail");
        assert_eq!(ch.read_line().unwrap(), "");
        assert_eq!(ch.read_line().unwrap(), "");
    }

    #[test]
    fn small_chunks_still_yield_lines() {
        let opts = LaunchOptions::default().with_chunk_size(1);
        let mut ch = Channel::spawn_with(&["sh", "-c", "printf 'one\\ntwo\\n'"], opts).unwrap();
        assert_eq!(ch.read_line().unwrap(), "one\n");
        assert_eq!(ch.read_line().unwrap(), "two\n");
        assert_eq!(ch.read_line().unwrap(), "");
    }

    #[test]
    fn empty_write_is_noop() {
        let mut ch = Channel::spawn(&["cat"]).unwrap();
        ch.write("").unwrap();
        ch.close_input();
        ch.write("").unwrap();
        assert!(matches!(ch.write("x"), Err(Error::ContractViolation(_))));
    }

    #[test]
    fn missing_program_is_exec_failure() {
        let opts = LaunchOptions::default().with_grace(Duration::from_millis(500));
        let err = Channel::spawn_with(&["procduplex-no-such-program"], opts).unwrap_err();
        assert!(err.is_exec_failure(), "got {:?}", err);
        assert_eq!(err.errno(), Some(Errno::ENOENT));
    }

    #[test]
    fn missing_program_without_handshake_fails_on_read() {
        let opts = LaunchOptions::default().with_handshake(false);
        let mut ch = Channel::spawn_with(&["procduplex-no-such-program"], opts).unwrap();
        let err = ch.read_line().unwrap_err();
        assert_eq!(err.errno(), Some(Errno::ENOENT));
        assert!(err.is_exec_failure());
        assert_eq!(ch.wait().unwrap(), ExitStatus::Exited(launch::EXEC_FAILED_EXIT));
    }

    #[test]
    fn wait_is_idempotent() {
        let mut ch = Channel::spawn(&["true"]).unwrap();
        let first = ch.wait().unwrap();
        assert_eq!(first, ExitStatus::Exited(0));
        assert_eq!(ch.wait().unwrap(), first);
        assert_eq!(ch.try_wait().unwrap(), Some(first));
        assert!(ch.kill(Signal::SIGTERM).is_err());
    }

    #[test]
    fn exit_code_reported() {
        let mut ch = sh("exit 3");
        assert_eq!(ch.wait().unwrap(), ExitStatus::Exited(3));
    }

    #[test]
    fn kill_then_wait() {
        let mut ch = Channel::spawn(&["sleep", "30"]).unwrap();
        ch.kill(Signal::SIGTERM).unwrap();
        assert_eq!(ch.wait().unwrap(), ExitStatus::Signaled(Signal::SIGTERM));
    }

    #[test]
    fn take_output_hands_over_descriptor() {
        let mut ch = sh("printf 'x\\n'");
        let fd = ch.take_output().unwrap();
        assert!(ch.take_output().is_err());
        assert_eq!(ch.read_line().unwrap(), "");
        let mut buf = LineBuffer::new();
        while tube::read_chunk(std::os::fd::AsRawFd::as_raw_fd(&fd), 16, &mut buf).unwrap() > 0 {}
        assert_eq!(buf.take_line().as_deref(), Some(&b"x\n"[..]));
    }

    #[test]
    fn signal_strategy_round_trip() {
        let _g = TEST_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        let opts = LaunchOptions::default().with_strategy(DetectStrategy::Signal);
        let mut ch = Channel::spawn_with(&["cat"], opts).unwrap();
        ch.write_line("ping").unwrap();
        assert_eq!(ch.read_line().unwrap(), "ping\n");
    }

    #[test]
    fn signal_strategy_reports_missing_program() {
        let _g = TEST_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        let opts = LaunchOptions::default()
            .with_strategy(DetectStrategy::Signal)
            .with_grace(Duration::from_millis(200));
        let err = Channel::spawn_with(&["procduplex-no-such-program"], opts).unwrap_err();
        assert!(err.is_exec_failure(), "got {:?}", err);
        assert_eq!(err.errno(), Some(Errno::ENOENT));
    }
}
