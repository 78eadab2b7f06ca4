use std::fmt;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use once_cell::sync::{Lazy, OnceCell};
use rustc_hash::{FxHashSet, FxHasher};
use tokio::task::AbortHandle;

use crate::location::CallerContext;
use crate::trace::{ScopeId, TaskTrace};
use crate::Location;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Registry-wide identity of a spawned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry-wide identity of a spawned thread.
///
/// Threads are registered before the OS thread exists, so the registry keys
/// them by its own token rather than by [`std::thread::ThreadId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadToken(pub(crate) u64);

impl fmt::Display for ThreadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) fn next_task_id() -> TaskId {
    TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
}

pub(crate) fn next_thread_token() -> ThreadToken {
    ThreadToken(NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed))
}

pub(crate) struct TaskEntry {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) file: &'static str,
    pub(crate) line: u32,
    pub(crate) created_at: Instant,
    pub(crate) is_internal: bool,
    pub(crate) scope: Option<ScopeId>,
    pub(crate) creation_stack: Option<Vec<Location>>,
    pub(crate) trace: Arc<TaskTrace>,
    // Filled in after tokio::spawn returns; registration happens before the
    // task can run, so the handle may lag the entry by a moment.
    pub(crate) abort: OnceCell<AbortHandle>,
}

impl TaskEntry {
    pub(crate) fn to_record(&self) -> TaskRecord {
        TaskRecord {
            id: self.id,
            name: self.name.clone(),
            file: self.file,
            line: self.line,
            creation_stack: self.creation_stack.clone(),
            activity: self.trace.snapshot(),
            created_at: self.created_at,
            abort: self.abort.get().cloned(),
        }
    }
}

pub(crate) struct ThreadEntry {
    pub(crate) token: ThreadToken,
    pub(crate) name: String,
    pub(crate) file: &'static str,
    pub(crate) line: u32,
    pub(crate) created_at: Instant,
    pub(crate) is_internal: bool,
    pub(crate) background: bool,
    pub(crate) scope: Option<ScopeId>,
}

impl ThreadEntry {
    pub(crate) fn to_record(&self) -> ThreadRecord {
        ThreadRecord {
            token: self.token,
            name: self.name.clone(),
            file: self.file,
            line: self.line,
            background: self.background,
            created_at: self.created_at,
        }
    }
}

/// Everything a leak report knows about one leaked task.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub file: &'static str,
    pub line: u32,
    /// Activity stack of the task that spawned this one, captured at spawn
    /// time. Only present when creation tracking was enabled.
    pub creation_stack: Option<Vec<Location>>,
    /// Frames the task was inside of when the leak was detected. Usually
    /// empty: a parked task holds no frames between polls.
    pub(crate) activity: Vec<Location>,
    pub(crate) created_at: Instant,
    pub(crate) abort: Option<AbortHandle>,
}

impl fmt::Display for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (spawned at {}:{})", self.name, self.file, self.line)
    }
}

/// Everything a leak report knows about one leaked thread.
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub token: ThreadToken,
    pub name: String,
    pub file: &'static str,
    pub line: u32,
    pub background: bool,
    pub(crate) created_at: Instant,
}

impl fmt::Display for ThreadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (spawned at {}:{})", self.name, self.file, self.line)?;
        if self.background {
            write!(f, " [background]")?;
        }
        Ok(())
    }
}

/// Which kind of resource a [`LeakReport`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakKind {
    Task,
    Thread,
}

impl LeakKind {
    fn label(self) -> &'static str {
        match self {
            LeakKind::Task => "task",
            LeakKind::Thread => "thread",
        }
    }
}

/// The outcome of one leak check: every resource that outlived the scope.
#[derive(Debug, Clone)]
pub struct LeakReport<R> {
    pub kind: LeakKind,
    /// Leaked resources, oldest first.
    pub leaked: Vec<R>,
    pub scope: CallerContext,
}

impl<R> LeakReport<R> {
    pub fn is_empty(&self) -> bool {
        self.leaked.is_empty()
    }

    pub fn len(&self) -> usize {
        self.leaked.len()
    }

    fn write_header(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} leaked {}{} within scope {}:",
            self.leaked.len(),
            self.kind.label(),
            if self.leaked.len() == 1 { "" } else { "s" },
            self.scope
        )
    }
}

impl fmt::Display for LeakReport<TaskRecord> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_header(f)?;
        for record in &self.leaked {
            write!(f, "\n  - {record}")?;
            if let Some(stack) = &record.creation_stack {
                write!(f, "\n      spawned while inside:")?;
                for frame in stack {
                    write!(f, "\n        {frame}")?;
                }
            }
            if !record.activity.is_empty() {
                write!(f, "\n      currently inside:")?;
                for frame in &record.activity {
                    write!(f, "\n        {frame}")?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for LeakReport<ThreadRecord> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_header(f)?;
        for record in &self.leaked {
            write!(f, "\n  - {record}")?;
        }
        Ok(())
    }
}

static TASKS: Lazy<DashMap<TaskId, Arc<TaskEntry>, BuildHasherDefault<FxHasher>>> =
    Lazy::new(DashMap::default);

static THREADS: Lazy<DashMap<ThreadToken, Arc<ThreadEntry>, BuildHasherDefault<FxHasher>>> =
    Lazy::new(DashMap::default);

pub(crate) fn register_task(entry: Arc<TaskEntry>) {
    TASKS.insert(entry.id, entry);
}

pub(crate) fn deregister_task(id: TaskId) {
    TASKS.remove(&id);
}

pub(crate) fn register_thread(entry: Arc<ThreadEntry>) {
    THREADS.insert(entry.token, entry);
}

pub(crate) fn deregister_thread(token: ThreadToken) {
    THREADS.remove(&token);
}

pub(crate) fn task_ids() -> FxHashSet<TaskId> {
    TASKS.iter().map(|entry| *entry.key()).collect()
}

pub(crate) fn thread_tokens() -> FxHashSet<ThreadToken> {
    THREADS.iter().map(|entry| *entry.key()).collect()
}

pub(crate) fn live_tasks() -> Vec<Arc<TaskEntry>> {
    TASKS.iter().map(|entry| entry.value().clone()).collect()
}

pub(crate) fn live_threads() -> Vec<Arc<ThreadEntry>> {
    THREADS.iter().map(|entry| entry.value().clone()).collect()
}

/// How many scopes currently want creation stacks recorded at spawn time.
/// A counter rather than a flag so overlapping scopes compose.
static CREATION_TRACKING: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn creation_tracking_enabled() -> bool {
    CREATION_TRACKING.load(Ordering::Relaxed) > 0
}

pub(crate) struct CreationTrackingGuard;

impl CreationTrackingGuard {
    pub(crate) fn arm() -> Self {
        CREATION_TRACKING.fetch_add(1, Ordering::Relaxed);
        CreationTrackingGuard
    }
}

impl Drop for CreationTrackingGuard {
    fn drop(&mut self) {
        CREATION_TRACKING.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Deregisters a task when its wrapped future finishes or is dropped.
pub(crate) struct TaskCompletionGuard {
    id: TaskId,
}

impl TaskCompletionGuard {
    pub(crate) fn new(id: TaskId) -> Self {
        TaskCompletionGuard { id }
    }
}

impl Drop for TaskCompletionGuard {
    fn drop(&mut self) {
        deregister_task(self.id);
    }
}

/// Deregisters a thread when its closure returns or unwinds.
pub(crate) struct ThreadCompletionGuard {
    token: ThreadToken,
}

impl ThreadCompletionGuard {
    pub(crate) fn new(token: ThreadToken) -> Self {
        ThreadCompletionGuard { token }
    }
}

impl Drop for ThreadCompletionGuard {
    fn drop(&mut self) {
        deregister_thread(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope_context() -> CallerContext {
        CallerContext {
            file: "tests/app.rs",
            function: "test_case",
            line: Some(7),
            related_files: Default::default(),
        }
    }

    fn task_record(name: &str) -> TaskRecord {
        TaskRecord {
            id: next_task_id(),
            name: name.to_owned(),
            file: "tests/app.rs",
            line: 12,
            creation_stack: None,
            activity: Vec::new(),
            created_at: Instant::now(),
            abort: None,
        }
    }

    #[test]
    fn completion_guard_removes_the_entry() {
        let id = next_task_id();
        register_task(Arc::new(TaskEntry {
            id,
            name: "ephemeral".to_owned(),
            file: "tests/app.rs",
            line: 3,
            created_at: Instant::now(),
            is_internal: false,
            scope: None,
            creation_stack: None,
            trace: TaskTrace::new(),
            abort: OnceCell::new(),
        }));
        assert!(task_ids().contains(&id));
        drop(TaskCompletionGuard::new(id));
        assert!(!task_ids().contains(&id));
    }

    // The counter is global, so this only asserts what stays true when other
    // tests hold guards of their own: tracking is on while any guard lives.
    #[test]
    fn creation_tracking_counts_nested_scopes() {
        let outer = CreationTrackingGuard::arm();
        let inner = CreationTrackingGuard::arm();
        assert!(creation_tracking_enabled());
        drop(inner);
        assert!(creation_tracking_enabled());
        drop(outer);
    }

    #[test]
    fn task_report_lists_records_with_spawn_sites() {
        let report = LeakReport {
            kind: LeakKind::Task,
            leaked: vec![task_record("worker"), task_record("janitor")],
            scope: scope_context(),
        };
        let rendered = report.to_string();
        assert!(rendered.starts_with("2 leaked tasks within scope tests/app.rs:test_case:7:"));
        assert!(rendered.contains("\n  - worker (spawned at tests/app.rs:12)"));
        assert!(rendered.contains("\n  - janitor (spawned at tests/app.rs:12)"));
    }

    #[test]
    fn singular_report_reads_naturally() {
        let report = LeakReport {
            kind: LeakKind::Thread,
            leaked: vec![ThreadRecord {
                token: next_thread_token(),
                name: "poller".to_owned(),
                file: "tests/app.rs",
                line: 9,
                background: true,
                created_at: Instant::now(),
            }],
            scope: scope_context(),
        };
        let rendered = report.to_string();
        assert!(rendered.starts_with("1 leaked thread within scope"));
        assert!(rendered.contains("poller (spawned at tests/app.rs:9) [background]"));
    }
}
