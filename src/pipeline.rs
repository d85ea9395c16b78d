//! Two-stage producer/consumer pipeline built from two channels.
//!
//! The producer's stdout is handed straight to the consumer as its stdin, so
//! data flows between the two children without passing through this process.
//! After a fixed run time the producer is sent `SIGTERM`; the consumer then
//! sees end of input and finishes on its own.

use std::fmt;
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::channel::Channel;
use crate::config::LaunchOptions;
use crate::error::Result;
use crate::types::ExitStatus;

#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub producer: Vec<String>,
    pub consumer: Vec<String>,
    /// How long the producer runs before it is terminated.
    pub duration: Duration,
}

/// Which end of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Producer,
    Consumer,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Producer => write!(f, "producer"),
            Stage::Consumer => write!(f, "consumer"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    pub pid: i32,
    pub status: ExitStatus,
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}] {}", self.stage, self.pid, self.status)
    }
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub producer: StageReport,
    pub consumer: StageReport,
    /// Everything the consumer wrote, line by line.
    pub output: Vec<String>,
}

/// A stage that did not finish cleanly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageFailure {
    #[error("{stage} didn't exit normally ({signal})")]
    Abnormal { stage: Stage, signal: Signal },
    #[error("{stage} exited with status {code}")]
    NonZero { stage: Stage, code: i32 },
}

impl PipelineReport {
    /// Check how both stages ended, producer first. Death by any signal,
    /// including the `SIGTERM` sent at the end of the run, is abnormal.
    pub fn check(&self) -> std::result::Result<(), StageFailure> {
        self.producer.check()?;
        self.consumer.check()
    }
}

impl StageReport {
    fn check(&self) -> std::result::Result<(), StageFailure> {
        match self.status {
            ExitStatus::Exited(0) => Ok(()),
            ExitStatus::Exited(code) => Err(StageFailure::NonZero {
                stage: self.stage,
                code,
            }),
            ExitStatus::Signaled(signal) => Err(StageFailure::Abnormal {
                stage: self.stage,
                signal,
            }),
        }
    }
}

/// Run `spec` to completion.
pub fn run(spec: &PipelineSpec) -> Result<PipelineReport> {
    let mut producer = Channel::spawn(&spec.producer)?;
    producer.close_input();
    let feed = producer.take_output()?;

    let mut consumer =
        Channel::spawn_with(&spec.consumer, LaunchOptions::default().with_stdin(feed))?;
    tracing::debug!(
        producer = %producer.pid(),
        consumer = %consumer.pid(),
        duration = ?spec.duration,
        "pipeline running"
    );

    std::thread::sleep(spec.duration);

    // The producer may already be gone; that is fine, it gets reaped below.
    if producer.try_wait()?.is_none() {
        producer.kill(Signal::SIGTERM)?;
    }
    let producer_status = producer.wait()?;

    let mut output = Vec::new();
    loop {
        let line = consumer.read_line()?;
        if line.is_empty() {
            break;
        }
        output.push(line.trim_end_matches('\n').to_string());
    }
    let consumer_status = consumer.wait()?;

    Ok(PipelineReport {
        producer: StageReport {
            stage: Stage::Producer,
            pid: producer.pid().as_raw(),
            status: producer_status,
        },
        consumer: StageReport {
            stage: Stage::Consumer,
            pid: consumer.pid().as_raw(),
            status: consumer_status,
        },
        output,
    })
}
