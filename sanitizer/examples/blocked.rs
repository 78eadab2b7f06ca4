//! Run this example to see a blocking finding, stack and all.

use std::time::Duration;

use async_sanitizer::{tracked, Config, Scope};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    async_sanitizer::init_logging();

    let config = Config::builder()
        .detect_tasks(false)
        .detect_threads(false)
        .build()
        .unwrap();

    let finding = Scope::new(config)
        .run(async {
            parse_everything().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        })
        .await
        .unwrap_err();

    println!("{finding}");
}

#[tracked]
async fn parse_everything() {
    // Stands in for accidentally synchronous work, like a heavy parse or
    // a blocking client call.
    std::thread::sleep(Duration::from_millis(400));
}
