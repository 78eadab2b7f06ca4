//! Task registration seam and task leak detection.
//!
//! Only tasks spawned through this module are visible to leak detection;
//! a task spawned through [`tokio::spawn`] directly bypasses the registry.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::OnceCell;
use rustc_hash::FxHashSet;
use tokio::task::JoinHandle;

use crate::config::NameFilter;
use crate::location::{CallerContext, Location};
use crate::registry::{
    self, CreationTrackingGuard, LeakKind, LeakReport, TaskCompletionGuard, TaskEntry, TaskId,
    TaskRecord,
};
use crate::trace::{self, ScopeId, TaskTrace, Tracked};

/// Spawns a registered task on the current runtime.
///
/// Drop-in replacement for [`tokio::spawn`]. The task is named
/// `task-<id>`; use [`spawn_named`] or [`Builder`] to pick a name that
/// leak reports and name filters can work with.
///
/// # Panics
///
/// Panics when called outside a tokio runtime, like [`tokio::spawn`] does.
#[track_caller]
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Builder::new().spawn(future)
}

/// Spawns a registered task under the given name.
#[track_caller]
pub fn spawn_named<F>(name: impl Into<String>, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Builder::new().name(name).spawn(future)
}

/// Configures and spawns registered tasks.
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
}

impl Builder {
    pub fn new() -> Self {
        Builder::default()
    }

    /// Name the task will carry in leak reports and name filters.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, like [`tokio::spawn`]
    /// does.
    #[track_caller]
    pub fn spawn<F>(self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        spawn_with(
            self.name,
            false,
            trace::current_scope(),
            std::panic::Location::caller(),
            future,
        )
    }
}

/// Spawns detector machinery. Internal tasks are registered so their
/// activity is traceable, but tagged so no detector ever reports them.
#[track_caller]
pub(crate) fn spawn_internal<F>(
    name: &str,
    scope: Option<ScopeId>,
    future: F,
) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    spawn_with(
        Some(name.to_owned()),
        true,
        scope,
        std::panic::Location::caller(),
        future,
    )
}

fn spawn_with<F>(
    name: Option<String>,
    is_internal: bool,
    scope: Option<ScopeId>,
    caller: &'static std::panic::Location<'static>,
    future: F,
) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let id = registry::next_task_id();
    let name = name.unwrap_or_else(|| format!("task-{id}"));
    let trace = TaskTrace::new();
    let creation_stack = (!is_internal && registry::creation_tracking_enabled())
        .then(trace::current_stack)
        .flatten();

    // Registered before the spawn so the completion guard inside the
    // wrapper can never fire first, whatever thread the task lands on.
    let entry = Arc::new(TaskEntry {
        id,
        name,
        file: caller.file(),
        line: caller.line(),
        created_at: Instant::now(),
        is_internal,
        scope,
        creation_stack,
        trace: trace.clone(),
        abort: OnceCell::new(),
    });
    registry::register_task(entry.clone());

    let wrapped = Tracked::root(
        async move {
            let _completion = TaskCompletionGuard::new(id);
            future.await
        },
        Location::from_caller("<task>", caller),
        scope,
        trace,
    );
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle.spawn(wrapped),
        Err(error) => {
            registry::deregister_task(id);
            panic!("spawning a registered task requires a running tokio runtime: {error}");
        }
    };
    let _ = entry.abort.set(handle.abort_handle());
    handle
}

/// Snapshot-diff detection of tasks that outlive their scope.
pub(crate) struct TaskLeakDetector {
    baseline: FxHashSet<TaskId>,
    scope: ScopeId,
    filter: Option<NameFilter>,
    origin: CallerContext,
    _tracking: Option<CreationTrackingGuard>,
}

impl TaskLeakDetector {
    pub(crate) fn arm(
        scope: ScopeId,
        origin: CallerContext,
        filter: Option<NameFilter>,
        track_creation: bool,
    ) -> Self {
        TaskLeakDetector {
            baseline: registry::task_ids(),
            scope,
            filter,
            origin,
            _tracking: track_creation.then(CreationTrackingGuard::arm),
        }
    }

    /// Everything registered since the baseline that is still live, belongs
    /// to this scope, and passes the name filter. Oldest first.
    pub(crate) fn finish(self) -> LeakReport<TaskRecord> {
        let mut leaked: Vec<TaskRecord> = registry::live_tasks()
            .into_iter()
            .filter(|entry| !self.baseline.contains(&entry.id))
            .filter(|entry| !entry.is_internal)
            .filter(|entry| entry.scope.map_or(true, |scope| scope == self.scope))
            .filter(|entry| {
                self.filter
                    .as_ref()
                    .map_or(true, |filter| filter.accepts(&entry.name))
            })
            .map(|entry| entry.to_record())
            .collect();
        leaked.sort_by_key(|record| (record.created_at, record.id.0));
        LeakReport {
            kind: LeakKind::Task,
            leaked,
            scope: self.origin,
        }
    }
}
