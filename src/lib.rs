//! procduplex — a blocking, line-oriented duplex channel to a forked child.
//!
//! A [`Channel`](channel::Channel) launches one program with its stdin and
//! stdout connected to pipes, and then offers `write` and `read_line` on
//! them. The hard part is telling "the child started but has said nothing
//! yet" apart from "the child never started". A failed `exec` happens after
//! `fork`, so the only way the parent hears about it is an out-of-band error
//! pipe. A handshake byte confirms that the child got as far as `exec`.
//!
//! # Module overview
//!
//! - [`error`] — Error types used throughout the crate.
//! - [`types`] — `ExitStatus` of a reaped child.
//! - [`config`] — `LaunchOptions` and the exec-failure `DetectStrategy`.
//! - [`pipe`] — Pipe topology: named, close-once descriptor slots.
//! - [`launch`] — Fork/exec sequence and handshake.
//! - [`detect`] — Exec-failure reports: synchronous drain and the `SIGCHLD` registry.
//! - [`tube`] — Line buffering and raw blocking I/O.
//! - [`channel`] — The caller-owned `Channel`.
//! - [`pipeline`] — Producer/consumer driver wiring two channels together.
//! - [`logging`] — `tracing` subscriber setup for the binary.

pub mod channel;
pub mod config;
pub mod detect;
pub mod error;
pub mod launch;
pub mod logging;
pub mod pipe;
pub mod pipeline;
pub mod tube;
pub mod types;

pub use channel::Channel;
pub use config::{DetectStrategy, LaunchOptions};
pub use error::{Error, Result};
pub use types::ExitStatus;
