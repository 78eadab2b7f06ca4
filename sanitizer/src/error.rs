use std::fmt;

use itertools::Itertools;
use thiserror::Error;

use crate::blocking::BlockingEvent;
use crate::location::CallerContext;
use crate::registry::{LeakReport, TaskRecord, ThreadRecord};

/// Any finding or fault a scope can return.
///
/// The three `*Detected` variants are findings produced under
/// [`Action::Raise`](crate::Action::Raise); [`Aggregate`](Error::Aggregate)
/// groups two or more of them; [`Setup`](Error::Setup) means the detection
/// machinery itself could not run and says nothing about the scoped code.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Stall(#[from] StallDetected),
    #[error(transparent)]
    TaskLeak(#[from] TaskLeakDetected),
    #[error(transparent)]
    ThreadLeak(#[from] ThreadLeakDetected),
    #[error(transparent)]
    Aggregate(#[from] AggregateDetected),
    #[error(transparent)]
    Setup(#[from] SetupError),
}

/// The scheduler was held by synchronous work at least once.
#[derive(Debug)]
pub struct StallDetected {
    /// Every confirmed block, in the order the heartbeat confirmed them.
    pub events: Vec<BlockingEvent>,
    pub origin: CallerContext,
}

impl fmt::Display for StallDetected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scheduler blocked {} time(s) within scope {}:",
            self.events.len(),
            self.origin
        )?;
        for event in &self.events {
            write!(f, "\n  {event}")?;
            event.write_stack(f, "      ")?;
        }
        Ok(())
    }
}

impl std::error::Error for StallDetected {}

/// One or more tasks were created in the scope and never completed.
#[derive(Debug)]
pub struct TaskLeakDetected {
    pub report: LeakReport<TaskRecord>,
}

impl fmt::Display for TaskLeakDetected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.report.fmt(f)
    }
}

impl std::error::Error for TaskLeakDetected {}

/// One or more threads were started in the scope and were still running
/// after the grace period.
#[derive(Debug)]
pub struct ThreadLeakDetected {
    pub report: LeakReport<ThreadRecord>,
}

impl fmt::Display for ThreadLeakDetected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.report.fmt(f)
    }
}

impl std::error::Error for ThreadLeakDetected {}

/// Two or more detectors raised in the same scope.
///
/// Findings keep the fixed order blocking, tasks, threads regardless of
/// when each detector fired.
#[derive(Debug)]
pub struct AggregateDetected {
    pub findings: Vec<Error>,
}

impl fmt::Display for AggregateDetected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} findings detected:\n\n{}",
            self.findings.len(),
            self.findings.iter().map(ToString::to_string).join("\n\n")
        )
    }
}

impl std::error::Error for AggregateDetected {}

/// The detection machinery could not be started or torn down.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("blocking detection requires a running tokio runtime")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
    #[error("failed to start the {name} thread")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// A configuration the detectors cannot honor, rejected before anything runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("`{field}` must be non-zero")]
    ZeroDuration { field: &'static str },
    #[error("the cancel action only applies to tasks, not `{field}`")]
    CancelUnsupported { field: &'static str },
}
