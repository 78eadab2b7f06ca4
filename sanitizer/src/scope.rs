//! The scope orchestrator: arms the configured detectors around a stretch
//! of code, drains them afterwards, and turns findings into actions.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt as _;
use static_assertions::assert_impl_all;

use crate::blocking::{self, BlockingDetector, BlockingEvent};
use crate::config::{Action, Config};
use crate::error::{
    AggregateDetected, Error, StallDetected, TaskLeakDetected, ThreadLeakDetected,
};
use crate::location::{CallerContext, Location};
use crate::registry::{LeakReport, TaskRecord, ThreadRecord};
use crate::task::TaskLeakDetector;
use crate::thread::{ThreadLeakDetector, GRACE_PERIOD};
use crate::trace::{self, ScopeId, TaskTrace, Tracked};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Armed,
    Running,
    Draining,
    Reported,
}

impl Phase {
    fn advance(&mut self, next: Phase, origin: &CallerContext) {
        log::trace!("scope {origin}: {self} -> {next}");
        *self = next;
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Idle => "idle",
            Phase::Armed => "armed",
            Phase::Running => "running",
            Phase::Draining => "draining",
            Phase::Reported => "reported",
        })
    }
}

/// A monitored stretch of code.
///
/// Detection only sees resources created through this crate's seams
/// ([`spawn`](crate::spawn), [`task::Builder`](crate::task::Builder),
/// [`thread::spawn`](crate::thread::spawn), [`thread::Builder`](crate::thread::Builder)).
/// Scopes running concurrently do not contaminate each other: resources are
/// stamped with the identity of the scope whose code created them, and each
/// scope only reports its own.
pub struct Scope {
    config: Config,
    origin: CallerContext,
}

impl Scope {
    /// A scope attributed to the calling line.
    #[track_caller]
    pub fn new(config: Config) -> Scope {
        Scope {
            config,
            origin: CallerContext::from_runtime_caller(std::panic::Location::caller()),
        }
    }

    /// A scope attributed to an explicit location, usually
    /// [`location!()`](crate::location). This is what `#[no_leaks]` uses so
    /// reports carry the test function's name.
    pub fn with_origin(config: Config, location: Location) -> Scope {
        Scope {
            config,
            origin: CallerContext::from_location(location),
        }
    }

    /// Runs `future` with the configured detectors armed around it.
    ///
    /// Arms blocking detection first so its own heartbeat and sampler are
    /// registered before the leak baselines are taken, then tasks, then
    /// threads; draining happens in reverse. Thread detection waits a short
    /// grace period before reading the registry, so threads that were
    /// signalled to stop get to exit; the wait is asynchronous and therefore
    /// never looks like a stall itself.
    ///
    /// If `future` panics, teardown still runs, any findings are logged at
    /// error level, and the panic is resumed.
    ///
    /// Blocking detection assumes the scope runs on a current-thread
    /// runtime; on a multi-thread runtime events are still confirmed but
    /// stack attribution is best effort. Thread and blocking detection need
    /// the runtime's time driver.
    ///
    /// # Errors
    ///
    /// Returns a finding for every detector whose action is
    /// [`Action::Raise`], two or more findings as
    /// [`Error::Aggregate`], and [`Error::Setup`] when the machinery itself
    /// could not start (nothing is reported about the scoped code then).
    ///
    /// ```
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// use async_sanitizer::{Config, Scope};
    ///
    /// let result = Scope::new(Config::default())
    ///     .run(async {
    ///         let worker = async_sanitizer::spawn(async { 2 + 2 });
    ///         assert_eq!(worker.await.unwrap(), 4);
    ///     })
    ///     .await;
    /// assert!(result.is_ok());
    /// # }
    /// ```
    pub async fn run<F>(self, future: F) -> Result<F::Output, Error>
    where
        F: Future,
    {
        let Scope { config, origin } = self;
        let scope_id = ScopeId::next();
        let mut phase = Phase::Idle;

        phase.advance(Phase::Armed, &origin);
        let blocking = match config.detect_blocking {
            true => Some(BlockingDetector::start(
                Some(scope_id),
                origin.clone(),
                &config,
            )?),
            false => None,
        };
        let tasks = config.detect_tasks.then(|| {
            TaskLeakDetector::arm(
                scope_id,
                origin.clone(),
                config.task_filter.clone(),
                config.track_task_creation,
            )
        });
        let threads = config.detect_threads.then(|| {
            ThreadLeakDetector::arm(
                scope_id,
                origin.clone(),
                config.thread_filter.clone(),
                config.exclude_background,
            )
        });

        phase.advance(Phase::Running, &origin);
        let root = Tracked::root(
            future,
            root_location(&origin),
            Some(scope_id),
            TaskTrace::new(),
        );
        let outcome = AssertUnwindSafe(root).catch_unwind().await;

        phase.advance(Phase::Draining, &origin);
        let thread_report = match threads {
            Some(detector) => {
                tokio::time::sleep(GRACE_PERIOD).await;
                Some(detector.finish())
            }
            None => None,
        };
        let task_report = tasks.map(TaskLeakDetector::finish);
        let events = match blocking {
            Some(detector) => detector.stop().await,
            None => Vec::new(),
        };

        let scope_context = enrich(origin, &events, task_report.as_ref());
        let finding = report(
            &config,
            &scope_context,
            events,
            task_report,
            thread_report,
        );

        phase.advance(Phase::Reported, &scope_context);
        settle(outcome, finding, &scope_context)
    }

    /// Synchronous counterpart of [`run`](Scope::run) for code that never
    /// touches a runtime. Only thread detection applies: there is no
    /// scheduler to watch and no task to outlive the scope.
    pub fn run_blocking<T>(self, f: impl FnOnce() -> T) -> Result<T, Error> {
        let Scope { config, origin } = self;
        let scope_id = ScopeId::next();
        let mut phase = Phase::Idle;

        phase.advance(Phase::Armed, &origin);
        let threads = config.detect_threads.then(|| {
            ThreadLeakDetector::arm(
                scope_id,
                origin.clone(),
                config.thread_filter.clone(),
                config.exclude_background,
            )
        });

        phase.advance(Phase::Running, &origin);
        let outcome = {
            let _ambient = trace::enter_thread_scope(Some(scope_id));
            std::panic::catch_unwind(AssertUnwindSafe(f))
        };

        phase.advance(Phase::Draining, &origin);
        let thread_report = threads.map(|detector| {
            std::thread::sleep(GRACE_PERIOD);
            detector.finish()
        });

        let finding = report(&config, &origin, Vec::new(), None, thread_report);

        phase.advance(Phase::Reported, &origin);
        settle(outcome, finding, &origin)
    }
}

fn root_location(origin: &CallerContext) -> Location {
    Location {
        fn_name: origin.function,
        file_name: origin.file,
        line_no: origin.line.unwrap_or(0),
        col_no: 0,
    }
}

/// Folds every activity stack the detectors saw into the scope's context.
fn enrich(
    origin: CallerContext,
    events: &[BlockingEvent],
    task_report: Option<&LeakReport<TaskRecord>>,
) -> CallerContext {
    let mut context = origin;
    for event in events {
        context.absorb_stack(&event.stack);
    }
    if let Some(report) = task_report {
        for record in &report.leaked {
            if let Some(stack) = &record.creation_stack {
                context.absorb_stack(stack);
            }
            context.absorb_stack(&record.activity);
        }
    }
    context
}

/// Applies each detector's action to its finding. Raised findings come back
/// in the fixed order blocking, tasks, threads.
fn report(
    config: &Config,
    scope_context: &CallerContext,
    events: Vec<BlockingEvent>,
    task_report: Option<LeakReport<TaskRecord>>,
    thread_report: Option<LeakReport<ThreadRecord>>,
) -> Option<Error> {
    let mut findings = Vec::new();
    if !events.is_empty() {
        if let Some(error) = dispatch_blocking(config.blocking_action, events, scope_context) {
            findings.push(error);
        }
    }
    if let Some(mut report) = task_report {
        report.scope = scope_context.clone();
        if !report.is_empty() {
            if let Some(error) = dispatch_tasks(config.task_action, report) {
                findings.push(error);
            }
        }
    }
    if let Some(mut report) = thread_report {
        report.scope = scope_context.clone();
        if !report.is_empty() {
            if let Some(error) = dispatch_threads(config.thread_action, report) {
                findings.push(error);
            }
        }
    }
    match findings.len() {
        0 => None,
        1 => findings.pop(),
        _ => Some(Error::from(AggregateDetected { findings })),
    }
}

fn dispatch_blocking(
    action: Action,
    events: Vec<BlockingEvent>,
    origin: &CallerContext,
) -> Option<Error> {
    match action {
        Action::Log => {
            // One record per event; the escalation belongs to warn.
            for event in &events {
                log::info!("{}", blocking::event_notice(event));
            }
            None
        }
        Action::Warn => {
            for notice in blocking::warn_notices(&events, origin) {
                log::warn!("{notice}");
            }
            None
        }
        Action::Raise => Some(Error::from(StallDetected {
            events,
            origin: origin.clone(),
        })),
        Action::Cancel => unreachable!("cancel is rejected for blocking when the config is built"),
    }
}

fn dispatch_tasks(action: Action, report: LeakReport<TaskRecord>) -> Option<Error> {
    match action {
        Action::Log => {
            log::info!("{report}");
            None
        }
        Action::Warn => {
            log::warn!("{report}");
            None
        }
        Action::Raise => Some(Error::from(TaskLeakDetected { report })),
        Action::Cancel => {
            for record in &report.leaked {
                match &record.abort {
                    Some(abort) => abort.abort(),
                    None => log::warn!("no abort handle for {record}"),
                }
            }
            log::warn!("aborted: {report}");
            None
        }
    }
}

fn dispatch_threads(action: Action, report: LeakReport<ThreadRecord>) -> Option<Error> {
    match action {
        Action::Log => {
            log::info!("{report}");
            None
        }
        Action::Warn => {
            log::warn!("{report}");
            None
        }
        Action::Raise => Some(Error::from(ThreadLeakDetected { report })),
        Action::Cancel => unreachable!("cancel is rejected for threads when the config is built"),
    }
}

/// Combines the body's outcome with the detectors' finding. A panic wins:
/// findings are demoted to an error-level log entry and the panic resumes.
fn settle<T>(
    outcome: Result<T, Box<dyn std::any::Any + Send>>,
    finding: Option<Error>,
    scope_context: &CallerContext,
) -> Result<T, Error> {
    match outcome {
        Ok(value) => match finding {
            None => Ok(value),
            Some(error) => Err(error),
        },
        Err(panic) => {
            if let Some(error) = finding {
                log::error!("scope {scope_context} panicked; findings kept secondary: {error}");
            }
            std::panic::resume_unwind(panic)
        }
    }
}

assert_impl_all!(Scope: Send);
assert_impl_all!(Config: Send, Sync);
assert_impl_all!(Error: Send, Sync);
assert_impl_all!(BlockingEvent: Send, Sync);
