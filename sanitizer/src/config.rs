use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;

/// What a scope does with a non-empty finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Record at info level and continue.
    Log,
    /// Record at warn level and continue.
    Warn,
    /// Return the finding as an error from the scope.
    Raise,
    /// Abort the offending tasks, then record at warn level. Tasks only.
    Cancel,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Log => "log",
            Action::Warn => "warn",
            Action::Raise => "raise",
            Action::Cancel => "cancel",
        })
    }
}

/// Restricts leak detection to resources whose name matches.
///
/// Filters are inclusion filters. A resource with no matching filter is
/// invisible to the detector armed with it.
#[derive(Clone)]
pub enum NameFilter {
    Exact(String),
    Contains(String),
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl NameFilter {
    pub fn exact(name: impl Into<String>) -> Self {
        NameFilter::Exact(name.into())
    }

    pub fn contains(fragment: impl Into<String>) -> Self {
        NameFilter::Contains(fragment.into())
    }

    pub fn predicate(test: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        NameFilter::Predicate(Arc::new(test))
    }

    pub(crate) fn accepts(&self, name: &str) -> bool {
        match self {
            NameFilter::Exact(exact) => name == exact,
            NameFilter::Contains(fragment) => name.contains(fragment),
            NameFilter::Predicate(test) => test(name),
        }
    }
}

impl fmt::Debug for NameFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameFilter::Exact(exact) => f.debug_tuple("Exact").field(exact).finish(),
            NameFilter::Contains(fragment) => f.debug_tuple("Contains").field(fragment).finish(),
            NameFilter::Predicate(_) => f.debug_tuple("Predicate").field(&"..").finish(),
        }
    }
}

/// Immutable description of what one scope detects and how it reacts.
///
/// Build one with [`Config::builder`], or use [`Config::default`] (all three
/// detectors on, findings returned as errors) or one of the single-detector
/// presets, which default to warning instead.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) detect_tasks: bool,
    pub(crate) task_action: Action,
    pub(crate) task_filter: Option<NameFilter>,
    pub(crate) track_task_creation: bool,

    pub(crate) detect_threads: bool,
    pub(crate) thread_action: Action,
    pub(crate) thread_filter: Option<NameFilter>,
    pub(crate) exclude_background: bool,

    pub(crate) detect_blocking: bool,
    pub(crate) blocking_action: Action,
    pub(crate) blocking_threshold: Duration,
    pub(crate) blocking_check_interval: Duration,
}

/// Longest scheduler unresponsiveness tolerated before a block is recorded.
pub const DEFAULT_BLOCKING_THRESHOLD: Duration = Duration::from_millis(100);

/// Cadence of the blocking heartbeat.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

impl Default for Config {
    fn default() -> Self {
        Config {
            detect_tasks: true,
            task_action: Action::Raise,
            task_filter: None,
            track_task_creation: false,
            detect_threads: true,
            thread_action: Action::Raise,
            thread_filter: None,
            exclude_background: true,
            detect_blocking: true,
            blocking_action: Action::Raise,
            blocking_threshold: DEFAULT_BLOCKING_THRESHOLD,
            blocking_check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Task leak detection only, warning on findings.
    pub fn tasks_only() -> Config {
        Config {
            detect_threads: false,
            detect_blocking: false,
            task_action: Action::Warn,
            ..Config::default()
        }
    }

    /// Thread leak detection only, warning on findings.
    pub fn threads_only() -> Config {
        Config {
            detect_tasks: false,
            detect_blocking: false,
            thread_action: Action::Warn,
            ..Config::default()
        }
    }

    /// Blocking detection only, warning on findings.
    pub fn blocking_only() -> Config {
        Config {
            detect_tasks: false,
            detect_threads: false,
            blocking_action: Action::Warn,
            ..Config::default()
        }
    }
}

/// Builder for [`Config`]. Invalid combinations are rejected at
/// [`build`](ConfigBuilder::build) time rather than when the scope runs.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn detect_tasks(mut self, on: bool) -> Self {
        self.config.detect_tasks = on;
        self
    }

    pub fn task_action(mut self, action: Action) -> Self {
        self.config.task_action = action;
        self
    }

    pub fn task_filter(mut self, filter: NameFilter) -> Self {
        self.config.task_filter = Some(filter);
        self
    }

    /// Capture the spawning task's activity stack for every task created in
    /// the scope, so leak reports can say where a leak came from.
    pub fn track_task_creation(mut self, on: bool) -> Self {
        self.config.track_task_creation = on;
        self
    }

    pub fn detect_threads(mut self, on: bool) -> Self {
        self.config.detect_threads = on;
        self
    }

    pub fn thread_action(mut self, action: Action) -> Self {
        self.config.thread_action = action;
        self
    }

    pub fn thread_filter(mut self, filter: NameFilter) -> Self {
        self.config.thread_filter = Some(filter);
        self
    }

    /// Whether threads marked background are exempt from leak reports.
    /// Defaults to true.
    pub fn exclude_background(mut self, on: bool) -> Self {
        self.config.exclude_background = on;
        self
    }

    pub fn detect_blocking(mut self, on: bool) -> Self {
        self.config.detect_blocking = on;
        self
    }

    pub fn blocking_action(mut self, action: Action) -> Self {
        self.config.blocking_action = action;
        self
    }

    pub fn blocking_threshold(mut self, threshold: Duration) -> Self {
        self.config.blocking_threshold = threshold;
        self
    }

    pub fn blocking_check_interval(mut self, interval: Duration) -> Self {
        self.config.blocking_check_interval = interval;
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        if self.config.thread_action == Action::Cancel {
            return Err(ConfigError::CancelUnsupported {
                field: "thread_action",
            });
        }
        if self.config.blocking_action == Action::Cancel {
            return Err(ConfigError::CancelUnsupported {
                field: "blocking_action",
            });
        }
        if self.config.blocking_threshold.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "blocking_threshold",
            });
        }
        if self.config.blocking_check_interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "blocking_check_interval",
            });
        }
        Ok(self.config)
    }
}
