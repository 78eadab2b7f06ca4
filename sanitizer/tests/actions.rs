use std::sync::{Mutex, MutexGuard, Once, PoisonError};
use std::time::Duration;

use async_sanitizer::{tracked, Action, Config, Scope};
use log::{Level, LevelFilter, Metadata, Record};
use pretty_assertions::assert_eq;

mod util;

/// Keeps every info-and-up record so tests can count exactly what the
/// action dispatch emitted. This binary must not install env_logger.
struct RecordingLogger {
    records: Mutex<Vec<(Level, String)>>,
}

impl log::Log for RecordingLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            lock(&self.records).push((record.level(), record.args().to_string()));
        }
    }

    fn flush(&self) {}
}

static RECORDER: RecordingLogger = RecordingLogger {
    records: Mutex::new(Vec::new()),
};
static SERIAL: Mutex<()> = Mutex::new(());

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Installs the recorder and wipes earlier records. Tests sharing the
/// recorder stay serialized for as long as the returned guard lives.
fn capture() -> MutexGuard<'static, ()> {
    let serial = lock(&SERIAL);
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        log::set_logger(&RECORDER).expect("no other logger is installed in this binary");
        log::set_max_level(LevelFilter::Info);
    });
    lock(&RECORDER.records).clear();
    serial
}

fn recorded(level: Level) -> Vec<String> {
    lock(&RECORDER.records)
        .iter()
        .filter(|(at, _)| *at == level)
        .map(|(_, text)| text.clone())
        .collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

#[tracked]
async fn outer_chore() {
    inner_spin().await;
}

#[tracked]
async fn inner_spin() {
    util::block_scheduler(Duration::from_millis(300));
}

#[test]
fn log_action_emits_one_record_per_event() {
    let _serial = capture();
    let config = Config::builder()
        .detect_tasks(false)
        .detect_threads(false)
        .blocking_action(Action::Log)
        .build()
        .unwrap();

    runtime()
        .block_on(Scope::new(config).run(async {
            util::block_scheduler(Duration::from_millis(300));
            tokio::time::sleep(Duration::from_millis(50)).await;
            util::block_scheduler(Duration::from_millis(300));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }))
        .unwrap();

    let notices = recorded(Level::Info);
    assert_eq!(notices.len(), 2);
    assert!(notices[0].starts_with("block #1"));
    assert!(notices[1].starts_with("block #2"));
    // The count summary and first-frame notice belong to the warn action.
    assert!(recorded(Level::Warn).is_empty());
}

#[test]
fn warn_notices_carry_the_full_stack() {
    let _serial = capture();
    runtime()
        .block_on(Scope::new(Config::blocking_only()).run(async {
            outer_chore().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }))
        .unwrap();

    let notices = recorded(Level::Warn);
    assert_eq!(notices.len(), 3);
    assert!(notices[0].starts_with("block #1"));
    assert!(notices[0].contains("outer_chore"));
    assert!(notices[0].contains("inner_spin"));
    assert!(notices[1].contains("1 blocking event(s)"));
    assert!(notices[2].contains("first blocking frame"));
    assert!(recorded(Level::Info).is_empty());
}
