//! Detects stretches where synchronous work holds the scheduler.
//!
//! Two cooperating halves. A heartbeat task sleeps for the configured
//! check interval in a loop and measures how late each wakeup is; lateness
//! beyond the blocking threshold confirms a block. A sampler OS thread
//! watches the heartbeat's wake timestamps from outside the runtime and,
//! mid-stall, snapshots the activity stack of whatever the scheduler thread
//! was polling, so the confirmed event can say what the scheduler was stuck
//! in. Attribution assumes a current-thread runtime; on a multi-thread
//! runtime events are still confirmed but stacks are best effort.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::ThreadId;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::SetupError;
use crate::location::{CallerContext, Location};
use crate::trace::{self, ScopeId};

/// One confirmed stretch of scheduler unresponsiveness.
#[derive(Debug, Clone)]
pub struct BlockingEvent {
    /// 1-based ordinal of the event within its scope.
    pub block_id: u64,
    /// Wall-clock time the heartbeat confirmed the block.
    pub timestamp: SystemTime,
    /// How much longer than the check interval the wakeup took.
    pub duration: Duration,
    /// Activity stack of the future the scheduler was stuck polling,
    /// outermost first. Empty when no snapshot could be taken in time.
    pub stack: Vec<Location>,
    pub origin: CallerContext,
}

impl BlockingEvent {
    /// The deepest tracked frame, the closest description of the blocking
    /// code itself.
    pub fn innermost_frame(&self) -> Option<&Location> {
        self.stack.last()
    }

    pub(crate) fn write_stack<W: fmt::Write>(&self, out: &mut W, indent: &str) -> fmt::Result {
        if self.stack.is_empty() {
            return write!(out, "\n{indent}(no activity stack captured)");
        }
        for frame in &self.stack {
            write!(out, "\n{indent}{frame}")?;
        }
        Ok(())
    }
}

impl fmt::Display for BlockingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block #{}: scheduler held for {:.3}s",
            self.block_id,
            self.duration.as_secs_f64()
        )
    }
}

/// State shared between the heartbeat task and the sampler thread.
struct HeartbeatShared {
    epoch: Instant,
    /// Microseconds since `epoch` of the heartbeat's most recent wakeup.
    last_wake_micros: AtomicU64,
    /// Thread the scope was armed on; the thread whose polls get sampled.
    scheduler_thread: ThreadId,
    /// Stack captured mid-stall, waiting for the heartbeat to confirm or
    /// discard it.
    pending_stack: Mutex<Option<Vec<Location>>>,
}

impl HeartbeatShared {
    fn new() -> Self {
        HeartbeatShared {
            epoch: Instant::now(),
            last_wake_micros: AtomicU64::new(0),
            scheduler_thread: std::thread::current().id(),
            pending_stack: Mutex::new(None),
        }
    }

    fn store_wake(&self, at: Instant) {
        let micros = at.saturating_duration_since(self.epoch).as_micros() as u64;
        self.last_wake_micros.store(micros, Ordering::Release);
    }

    fn since_last_wake(&self) -> Duration {
        let now = Instant::now().saturating_duration_since(self.epoch).as_micros() as u64;
        let last = self.last_wake_micros.load(Ordering::Acquire);
        Duration::from_micros(now.saturating_sub(last))
    }

    /// Grabs the scheduler's current activity stack once per stall. Retries
    /// on later ticks while nothing was captured and the stall persists.
    fn capture_scheduler_stack(&self) {
        let mut pending = self.lock_pending();
        if pending.is_none() {
            if let Some(stack) = trace::capture(self.scheduler_thread) {
                *pending = Some(stack);
            }
        }
    }

    fn take_pending_stack(&self) -> Option<Vec<Location>> {
        self.lock_pending().take()
    }

    fn clear_pending_stack(&self) {
        *self.lock_pending() = None;
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<Vec<Location>>> {
        self.pending_stack
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Running blocking detection for one scope.
pub(crate) struct BlockingDetector {
    shutdown: Option<watch::Sender<bool>>,
    heartbeat: Option<JoinHandle<Vec<BlockingEvent>>>,
    sampler: Option<std::thread::JoinHandle<()>>,
    sampler_stop: Arc<AtomicBool>,
}

impl BlockingDetector {
    /// Spawns the heartbeat task and the sampler thread. Must be called on
    /// the scheduler thread of a running runtime.
    pub(crate) fn start(
        scope: Option<ScopeId>,
        origin: CallerContext,
        config: &Config,
    ) -> Result<BlockingDetector, SetupError> {
        tokio::runtime::Handle::try_current()?;
        let interval = config.blocking_check_interval;
        let threshold = config.blocking_threshold;

        let shared = Arc::new(HeartbeatShared::new());
        shared.store_wake(Instant::now());

        let sampler_stop = Arc::new(AtomicBool::new(false));
        let sampler = {
            let shared = shared.clone();
            let stop = sampler_stop.clone();
            let tick = (interval / 4).max(Duration::from_millis(1));
            crate::thread::spawn_internal("sanitizer-sampler", scope, move || {
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(tick);
                    if shared.since_last_wake() > interval {
                        shared.capture_scheduler_stack();
                    }
                }
            })
            .map_err(|source| SetupError::ThreadSpawn {
                name: "sanitizer-sampler",
                source,
            })?
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let heartbeat = crate::task::spawn_internal(
            "sanitizer-heartbeat",
            scope,
            heartbeat_loop(shared, shutdown_rx, interval, threshold, origin),
        );

        Ok(BlockingDetector {
            shutdown: Some(shutdown),
            heartbeat: Some(heartbeat),
            sampler: Some(sampler),
            sampler_stop,
        })
    }

    /// Stops the heartbeat first, then the sampler, and returns everything
    /// confirmed. The final heartbeat wakeup is still measured, so a stall
    /// running right up to scope exit is not lost.
    pub(crate) async fn stop(mut self) -> Vec<BlockingEvent> {
        let events = match (self.shutdown.take(), self.heartbeat.take()) {
            (Some(shutdown), Some(heartbeat)) => {
                let _ = shutdown.send(true);
                match heartbeat.await {
                    Ok(events) => events,
                    Err(join_error) => {
                        log::debug!("heartbeat task did not shut down cleanly: {join_error}");
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        };
        // The heartbeat is gone, so the short synchronous join below cannot
        // be mistaken for a stall.
        self.sampler_stop.store(true, Ordering::Release);
        if let Some(sampler) = self.sampler.take() {
            if sampler.join().is_err() {
                log::debug!("sampler thread panicked during shutdown");
            }
        }
        events
    }
}

impl Drop for BlockingDetector {
    fn drop(&mut self) {
        // Reached without stop() when the scope future itself was dropped.
        // Findings are unrecoverable at that point; just tear down.
        self.shutdown.take();
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        self.sampler_stop.store(true, Ordering::Release);
        // Detached; the sampler exits at its next tick and deregisters
        // itself through its completion guard.
        self.sampler.take();
    }
}

/// Body of the heartbeat task.
///
/// `previous_wake` starts at spawn time rather than first-poll time: on a
/// current-thread runtime a scope that blocks before ever yielding delays
/// the heartbeat's very first poll, and that delay must count.
fn heartbeat_loop(
    shared: Arc<HeartbeatShared>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
    threshold: Duration,
    origin: CallerContext,
) -> impl std::future::Future<Output = Vec<BlockingEvent>> {
    let started = Instant::now();
    async move {
        let mut events = Vec::new();
        let mut block_id = 0u64;
        let mut previous_wake = started;
        loop {
            let stopping = tokio::select! {
                biased;
                _ = shutdown.changed() => true,
                () = tokio::time::sleep(interval) => false,
            };
            let now = Instant::now();
            let actual_delay = now.saturating_duration_since(previous_wake);
            previous_wake = now;
            shared.store_wake(now);
            if actual_delay > interval + threshold {
                block_id += 1;
                let event = BlockingEvent {
                    block_id,
                    timestamp: SystemTime::now(),
                    duration: actual_delay - interval,
                    stack: shared.take_pending_stack().unwrap_or_default(),
                    origin: origin.clone(),
                };
                log::debug!("{event}");
                events.push(event);
            } else {
                shared.clear_pending_stack();
            }
            if stopping {
                return events;
            }
        }
    }
}

/// One self-contained notice per event: ordinal, duration, and every
/// captured frame.
pub(crate) fn event_notice(event: &BlockingEvent) -> String {
    let mut text = event.to_string();
    let _ = event.write_stack(&mut text, "    ");
    text
}

/// The warn-action escalation for blocking findings: one notice per event,
/// a count summary, and a final notice pointing at the first offending
/// frame.
pub(crate) fn warn_notices(events: &[BlockingEvent], origin: &CallerContext) -> Vec<String> {
    let mut notices = Vec::with_capacity(events.len() + 2);
    notices.extend(events.iter().map(event_notice));
    notices.push(format!(
        "{} blocking event(s) detected within scope {origin}",
        events.len()
    ));
    let first_frame = events.iter().find_map(BlockingEvent::innermost_frame);
    notices.push(match first_frame {
        Some(frame) => format!("scope {origin}: first blocking frame {frame}"),
        None => format!("scope {origin}: no blocking frames captured"),
    });
    notices
}
