use std::cell::{Cell, RefCell};
use std::future::Future;
use std::hash::BuildHasherDefault;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::thread::ThreadId;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use pin_project_lite::pin_project;
use rustc_hash::FxHasher;

use crate::Location;

/// Identity of one monitored scope.
///
/// Every scope gets a fresh id; resources created through the registration
/// seams inherit the ambient id of the scope whose code created them. Leak
/// detection only attributes resources carrying its own id (or none), so
/// concurrently running scopes never see each other's resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ScopeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// The stack of tracked frames a task is currently inside of.
///
/// Pushed and popped by [`Tracked`] around polls, read cross-thread by the
/// blocking sampler. The mutex is only ever held for push/pop/clone, never
/// across user code.
pub(crate) struct TaskTrace {
    frames: Mutex<Vec<Location>>,
}

impl TaskTrace {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(TaskTrace {
            frames: Mutex::new(Vec::new()),
        })
    }

    fn push(&self, location: Location) {
        self.lock().push(location);
    }

    fn pop(&self) {
        self.lock().pop();
    }

    /// Clones the frames, outermost first.
    pub(crate) fn snapshot(&self) -> Vec<Location> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Location>> {
        self.frames.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

struct ActiveTask {
    trace: Arc<TaskTrace>,
    scope: Option<ScopeId>,
}

thread_local! {
    /// The tracked task currently being polled on this thread, if any.
    static ACTIVE: RefCell<Option<ActiveTask>> = const { RefCell::new(None) };

    /// Ambient scope for plain OS threads (no task is being polled there).
    static THREAD_SCOPE: Cell<Option<ScopeId>> = const { Cell::new(None) };
}

/// Traces of root tasks mid-poll, keyed by the thread polling them. The
/// blocking sampler reads this from outside the runtime to attribute stalls.
static POLLING: Lazy<DashMap<ThreadId, Arc<TaskTrace>, BuildHasherDefault<FxHasher>>> =
    Lazy::new(DashMap::default);

/// The scope the calling context belongs to, if any.
pub(crate) fn current_scope() -> Option<ScopeId> {
    ACTIVE
        .with(|active| active.borrow().as_ref().and_then(|task| task.scope))
        .or_else(|| THREAD_SCOPE.with(Cell::get))
}

/// The activity stack of the task being polled on this thread, if any.
pub(crate) fn current_stack() -> Option<Vec<Location>> {
    ACTIVE.with(|active| {
        active
            .borrow()
            .as_ref()
            .map(|task| task.trace.snapshot())
    })
}

/// Snapshot of whatever `thread` is polling right now. `None` when that
/// thread is not inside a tracked root poll.
pub(crate) fn capture(thread: ThreadId) -> Option<Vec<Location>> {
    POLLING.get(&thread).map(|entry| entry.value().snapshot())
}

/// Installs `scope` as the ambient scope of the current OS thread for the
/// guard's lifetime.
pub(crate) fn enter_thread_scope(scope: Option<ScopeId>) -> ThreadScopeGuard {
    let previous = THREAD_SCOPE.with(|cell| cell.replace(scope));
    ThreadScopeGuard { previous }
}

pub(crate) struct ThreadScopeGuard {
    previous: Option<ScopeId>,
}

impl Drop for ThreadScopeGuard {
    fn drop(&mut self) {
        THREAD_SCOPE.with(|cell| cell.set(self.previous));
    }
}

struct RootCell {
    trace: Arc<TaskTrace>,
    scope: Option<ScopeId>,
}

pin_project! {
    /// A future whose polls are recorded on an activity stack.
    ///
    /// Nested `Tracked`s (what `#[tracked]` produces) push their location
    /// onto the stack of the enclosing root for the duration of each poll.
    /// Roots are created internally at the spawn seam and for scope bodies;
    /// they own the stack and publish it while polling so the blocking
    /// sampler can read it from another thread.
    pub struct Tracked<F> {
        #[pin]
        future: F,
        location: Location,
        root: Option<RootCell>,
    }
}

impl<F> Tracked<F> {
    pub(crate) fn new(future: F, location: Location) -> Self {
        Tracked {
            future,
            location,
            root: None,
        }
    }

    pub(crate) fn root(
        future: F,
        location: Location,
        scope: Option<ScopeId>,
        trace: Arc<TaskTrace>,
    ) -> Self {
        Tracked {
            future,
            location,
            root: Some(RootCell { trace, scope }),
        }
    }
}

impl<F: Future> Future for Tracked<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.root {
            Some(root) => {
                let _enter = RootGuard::enter(root, *this.location);
                this.future.poll(cx)
            }
            None => {
                let _enter = FrameGuard::enter(*this.location);
                this.future.poll(cx)
            }
        }
    }
}

/// Installed around every poll of a root. Restores the previous state on
/// drop, so panics inside the poll unwind cleanly.
struct RootGuard {
    thread: ThreadId,
    displaced_active: Option<ActiveTask>,
    displaced_polling: Option<Arc<TaskTrace>>,
    trace: Arc<TaskTrace>,
}

impl RootGuard {
    fn enter(root: &RootCell, location: Location) -> Self {
        let displaced_active = ACTIVE.with(|active| {
            active.borrow_mut().replace(ActiveTask {
                trace: root.trace.clone(),
                scope: root.scope,
            })
        });
        let thread = std::thread::current().id();
        let displaced_polling = POLLING.insert(thread, root.trace.clone());
        root.trace.push(location);
        RootGuard {
            thread,
            displaced_active,
            displaced_polling,
            trace: root.trace.clone(),
        }
    }
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        self.trace.pop();
        match self.displaced_polling.take() {
            Some(previous) => {
                POLLING.insert(self.thread, previous);
            }
            None => {
                POLLING.remove(&self.thread);
            }
        }
        ACTIVE.with(|active| *active.borrow_mut() = self.displaced_active.take());
    }
}

struct FrameGuard {
    trace: Option<Arc<TaskTrace>>,
}

impl FrameGuard {
    fn enter(location: Location) -> Self {
        let trace = ACTIVE.with(|active| {
            active.borrow().as_ref().map(|task| task.trace.clone())
        });
        if let Some(trace) = &trace {
            trace.push(location);
        }
        FrameGuard { trace }
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if let Some(trace) = &self.trace {
            trace.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(fn_name: &'static str) -> Location {
        Location {
            fn_name,
            file_name: "src/trace.rs",
            line_no: 1,
            col_no: 1,
        }
    }

    #[test]
    fn scope_ids_are_unique() {
        let a = ScopeId::next();
        let b = ScopeId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn thread_scope_guard_restores_previous_value() {
        let outer = ScopeId::next();
        let inner = ScopeId::next();
        let _a = enter_thread_scope(Some(outer));
        assert_eq!(current_scope(), Some(outer));
        {
            let _b = enter_thread_scope(Some(inner));
            assert_eq!(current_scope(), Some(inner));
        }
        assert_eq!(current_scope(), Some(outer));
    }

    #[tokio::test]
    async fn nested_frames_stack_up_during_polls() {
        let trace = TaskTrace::new();
        let root = Tracked::root(
            async {
                let stack = current_stack().unwrap();
                assert_eq!(stack.len(), 1);
                assert_eq!(stack[0].fn_name, "root");

                location("inner")
                    .frame(async {
                        let stack = current_stack().unwrap();
                        let names: Vec<_> =
                            stack.iter().map(|frame| frame.fn_name).collect();
                        assert_eq!(names, vec!["root", "inner"]);
                    })
                    .await;

                let stack = current_stack().unwrap();
                assert_eq!(stack.len(), 1);
            },
            location("root"),
            None,
            trace.clone(),
        );
        root.await;
        assert!(trace.snapshot().is_empty());
        assert!(current_stack().is_none());
    }

    #[tokio::test]
    async fn polling_map_is_cleared_between_polls() {
        let thread = std::thread::current().id();
        let trace = TaskTrace::new();
        Tracked::root(
            async move {
                assert!(capture(std::thread::current().id()).is_some());
            },
            location("root"),
            None,
            trace,
        )
        .await;
        assert!(capture(thread).is_none());
    }

    #[test]
    fn untracked_context_has_no_stack() {
        assert!(current_stack().is_none());
        assert!(current_scope().is_none());
    }
}
