//! Leak and blocking detection for concurrent tests.
//!
//! This crate watches a stretch of code, a [`Scope`], for three kinds of
//! concurrency debt that tests otherwise let escape silently:
//!
//! * **task leaks**: tasks created inside the scope that are still pending
//!   when it ends;
//! * **thread leaks**: OS threads started inside the scope that are still
//!   running after a short grace period;
//! * **blocking**: stretches where synchronous work holds the scheduler and
//!   every other task is starved.
//!
//! Detection is cooperative. Leaks are found by snapshot-diffing a registry
//! that only spawns routed through this crate's seams ([`spawn`],
//! [`task::Builder`], [`thread::spawn`], [`thread::Builder`]) ever enter.
//! Blocking is found by a heartbeat that measures how late its own wakeups
//! are, paired with a sampler thread that captures what the scheduler was
//! stuck polling; instrument interesting code paths with `#[tracked]` (or
//! [`frame!`]) so those reports carry activity stacks worth reading.
//!
//! The declarative form wraps a whole test:
//!
//! ```
//! use async_sanitizer::no_leaks;
//!
//! #[no_leaks]
//! #[tokio::test]
//! async fn settles_cleanly() {
//!     let worker = async_sanitizer::spawn(async { 1 + 1 });
//!     assert_eq!(worker.await.unwrap(), 2);
//! }
//! ```
//!
//! The explicit form returns findings as values instead of panicking:
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use async_sanitizer::{Config, Scope};
//!
//! let outcome = Scope::new(Config::tasks_only())
//!     .run(async {
//!         async_sanitizer::spawn(async {
//!             std::future::pending::<()>().await;
//!         });
//!     })
//!     .await;
//! // tasks_only() warns on findings rather than erroring.
//! assert!(outcome.is_ok());
//! # }
//! ```
//!
//! Scopes running in parallel test threads do not contaminate each other:
//! every resource is stamped with the scope it was created under, and each
//! scope only reports its own. The detectors' own machinery is registered
//! through the same seams and never appears in reports.

mod blocking;
mod config;
mod error;
mod location;
mod logging;
mod registry;
mod scope;
pub mod task;
pub mod thread;
mod trace;

pub use async_sanitizer_attributes::{no_leaks, tracked};

pub use crate::blocking::BlockingEvent;
pub use crate::config::{
    Action, Config, ConfigBuilder, NameFilter, DEFAULT_BLOCKING_THRESHOLD, DEFAULT_CHECK_INTERVAL,
};
pub use crate::error::{
    AggregateDetected, ConfigError, Error, SetupError, StallDetected, TaskLeakDetected,
    ThreadLeakDetected,
};
pub use crate::location::{CallerContext, Location};
pub use crate::logging::{init_logging, LOG_ENV};
pub use crate::registry::{LeakKind, LeakReport, TaskId, TaskRecord, ThreadRecord, ThreadToken};
pub use crate::scope::Scope;
pub use crate::task::{spawn, spawn_named};
pub use crate::trace::{ScopeId, Tracked};
