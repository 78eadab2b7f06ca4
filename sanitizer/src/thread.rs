//! Thread registration seam and thread leak detection.
//!
//! Mirrors the [`std::thread`] spawn API. A registered thread is considered
//! live from the spawn call until its closure returns or unwinds, which is
//! when its completion guard deregisters it.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rustc_hash::FxHashSet;

use crate::config::NameFilter;
use crate::location::CallerContext;
use crate::registry::{
    self, LeakKind, LeakReport, ThreadCompletionGuard, ThreadEntry, ThreadRecord, ThreadToken,
};
use crate::trace::{self, ScopeId};

/// How long a scope waits after its body finishes before reading the thread
/// registry, so threads that were just signalled to stop can actually exit.
pub(crate) const GRACE_PERIOD: Duration = Duration::from_millis(50);

/// Spawns a registered thread.
///
/// Drop-in replacement for [`std::thread::spawn`], with the same panic on
/// spawn failure. Threads spawned through std directly are invisible to the
/// detectors.
#[track_caller]
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().spawn(f).expect("failed to spawn thread")
}

/// Configures and spawns registered threads.
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    background: bool,
}

impl Builder {
    pub fn new() -> Self {
        Builder::default()
    }

    /// Name the thread will carry in leak reports, name filters, and the OS.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Marks the thread as a long-lived service thread. Background threads
    /// are exempt from leak reports unless the scope opts in with
    /// [`exclude_background(false)`](crate::ConfigBuilder::exclude_background).
    pub fn background(mut self, on: bool) -> Self {
        self.background = on;
        self
    }

    #[track_caller]
    pub fn spawn<F, T>(self, f: F) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        spawn_with(
            self.name,
            self.background,
            false,
            trace::current_scope(),
            std::panic::Location::caller(),
            f,
        )
    }
}

/// Spawns detector machinery, registered but never reported.
#[track_caller]
pub(crate) fn spawn_internal<F, T>(
    name: &str,
    scope: Option<ScopeId>,
    f: F,
) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    spawn_with(
        Some(name.to_owned()),
        false,
        true,
        scope,
        std::panic::Location::caller(),
        f,
    )
}

fn spawn_with<F, T>(
    name: Option<String>,
    background: bool,
    is_internal: bool,
    scope: Option<ScopeId>,
    caller: &'static std::panic::Location<'static>,
    f: F,
) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let token = registry::next_thread_token();
    let name = name.unwrap_or_else(|| format!("thread-{token}"));

    // Registered before the OS thread exists; the completion guard runs on
    // the new thread, strictly after this insert.
    registry::register_thread(Arc::new(ThreadEntry {
        token,
        name: name.clone(),
        file: caller.file(),
        line: caller.line(),
        created_at: Instant::now(),
        is_internal,
        background,
        scope,
    }));

    let spawned = std::thread::Builder::new().name(name).spawn(move || {
        let _ambient = trace::enter_thread_scope(scope);
        let _completion = ThreadCompletionGuard::new(token);
        f()
    });
    match spawned {
        Ok(handle) => Ok(handle),
        Err(error) => {
            registry::deregister_thread(token);
            Err(error)
        }
    }
}

/// Snapshot-diff detection of threads that outlive their scope.
pub(crate) struct ThreadLeakDetector {
    baseline: FxHashSet<ThreadToken>,
    scope: ScopeId,
    filter: Option<NameFilter>,
    exclude_background: bool,
    origin: CallerContext,
}

impl ThreadLeakDetector {
    pub(crate) fn arm(
        scope: ScopeId,
        origin: CallerContext,
        filter: Option<NameFilter>,
        exclude_background: bool,
    ) -> Self {
        ThreadLeakDetector {
            baseline: registry::thread_tokens(),
            scope,
            filter,
            exclude_background,
            origin,
        }
    }

    /// Everything registered since the baseline that is still running,
    /// belongs to this scope, and passes the filters. Callers are expected
    /// to wait out [`GRACE_PERIOD`] first.
    pub(crate) fn finish(self) -> LeakReport<ThreadRecord> {
        let mut leaked: Vec<ThreadRecord> = registry::live_threads()
            .into_iter()
            .filter(|entry| !self.baseline.contains(&entry.token))
            .filter(|entry| !entry.is_internal)
            .filter(|entry| entry.scope.map_or(true, |scope| scope == self.scope))
            .filter(|entry| !(self.exclude_background && entry.background))
            .filter(|entry| {
                self.filter
                    .as_ref()
                    .map_or(true, |filter| filter.accepts(&entry.name))
            })
            .map(|entry| entry.to_record())
            .collect();
        leaked.sort_by_key(|record| (record.created_at, record.token.0));
        LeakReport {
            kind: LeakKind::Thread,
            leaked,
            scope: self.origin,
        }
    }
}
