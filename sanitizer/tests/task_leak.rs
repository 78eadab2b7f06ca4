use std::future::pending;
use std::time::Duration;

use async_sanitizer::{spawn_named, Action, Config, Error, NameFilter, Scope, TaskLeakDetected};
use pretty_assertions::assert_eq;

mod util;

fn raise_on_tasks() -> Config {
    Config::builder()
        .detect_threads(false)
        .detect_blocking(false)
        .build()
        .unwrap()
}

fn unwrap_task_leak<T: std::fmt::Debug>(result: Result<T, Error>) -> TaskLeakDetected {
    match result {
        Err(Error::TaskLeak(leak)) => leak,
        other => panic!("expected a task leak, got {other:?}"),
    }
}

fn leaked_names(leak: &TaskLeakDetected) -> Vec<&str> {
    leak.report
        .leaked
        .iter()
        .map(|record| record.name.as_str())
        .collect()
}

#[tokio::test]
async fn pending_task_is_a_leak() {
    util::init();
    let result = Scope::new(raise_on_tasks())
        .run(async {
            spawn_named("straggler", pending::<()>());
        })
        .await;

    let leak = unwrap_task_leak(result);
    assert_eq!(leaked_names(&leak), vec!["straggler"]);
    assert!(leak.report.leaked[0].file.ends_with("task_leak.rs"));
}

#[tokio::test]
async fn awaited_task_is_clean() {
    util::init();
    Scope::new(raise_on_tasks())
        .run(async {
            let worker = spawn_named("diligent", async { 40 + 2 });
            assert_eq!(worker.await.unwrap(), 42);
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn aborted_task_is_clean() {
    util::init();
    Scope::new(raise_on_tasks())
        .run(async {
            let worker = spawn_named("doomed", pending::<()>());
            worker.abort();
            // Give the runtime a turn to drop the aborted task.
            tokio::time::sleep(Duration::from_millis(20)).await;
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn leaks_are_reported_oldest_first() {
    util::init();
    let result = Scope::new(raise_on_tasks())
        .run(async {
            spawn_named("first-out", pending::<()>());
            tokio::time::sleep(Duration::from_millis(10)).await;
            spawn_named("second-out", pending::<()>());
        })
        .await;

    let leak = unwrap_task_leak(result);
    assert_eq!(leaked_names(&leak), vec!["first-out", "second-out"]);
}

#[tokio::test]
async fn tasks_spawned_by_scoped_tasks_are_attributed() {
    util::init();
    let result = Scope::new(raise_on_tasks())
        .run(async {
            let parent = spawn_named("nest-parent", async {
                spawn_named("nest-child", pending::<()>());
            });
            parent.await.unwrap();
        })
        .await;

    let leak = unwrap_task_leak(result);
    assert_eq!(leaked_names(&leak), vec!["nest-child"]);
}

#[tokio::test]
async fn name_filter_narrows_detection() {
    util::init();
    let config = Config::builder()
        .detect_threads(false)
        .detect_blocking(false)
        .task_filter(NameFilter::contains("watched"))
        .build()
        .unwrap();

    let result = Scope::new(config)
        .run(async {
            spawn_named("watched-straggler", pending::<()>());
            spawn_named("ignored-straggler", pending::<()>());
        })
        .await;

    let leak = unwrap_task_leak(result);
    assert_eq!(leaked_names(&leak), vec!["watched-straggler"]);
}

#[tokio::test]
async fn cancel_action_aborts_the_leaks() {
    util::init();
    let config = Config::builder()
        .detect_threads(false)
        .detect_blocking(false)
        .task_action(Action::Cancel)
        .build()
        .unwrap();

    let handle = Scope::new(config)
        .run(async { spawn_named("cancel-target", pending::<()>()) })
        .await
        .unwrap();

    let join_error = handle.await.unwrap_err();
    assert!(join_error.is_cancelled());
}

#[tokio::test]
async fn log_action_returns_ok() {
    util::init();
    let config = Config::builder()
        .detect_threads(false)
        .detect_blocking(false)
        .task_action(Action::Log)
        .build()
        .unwrap();

    Scope::new(config)
        .run(async {
            spawn_named("merely-logged", pending::<()>());
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn creation_tracking_points_at_the_spawner() {
    util::init();
    let config = Config::builder()
        .detect_threads(false)
        .detect_blocking(false)
        .track_task_creation(true)
        .build()
        .unwrap();

    let result = Scope::new(config)
        .run(async {
            let parent = spawn_named("tracked-parent", async {
                spawn_named("tracked-child", pending::<()>());
            });
            parent.await.unwrap();
        })
        .await;

    let leak = unwrap_task_leak(result);
    assert_eq!(leaked_names(&leak), vec!["tracked-child"]);
    let stack = leak.report.leaked[0]
        .creation_stack
        .as_ref()
        .expect("creation tracking was on");
    assert!(!stack.is_empty());
    let rendered = util::strip(leak.to_string());
    assert!(rendered.contains("spawned while inside:"));
}

#[tokio::test]
async fn report_text_names_spawn_sites() {
    util::init();
    let result = Scope::new(raise_on_tasks())
        .run(async {
            spawn_named("renderable", pending::<()>());
        })
        .await;

    let rendered = util::strip(unwrap_task_leak(result).to_string());
    assert!(rendered.starts_with("1 leaked task within scope"));
    assert!(rendered.contains("renderable (spawned at "));
    assert!(rendered.contains("task_leak.rs:LINE"));
}
