//! Run this example to see leak reports for tasks and threads.

use std::future::pending;
use std::time::Duration;

use async_sanitizer::{Config, Scope};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    async_sanitizer::init_logging();

    let config = Config::builder().detect_blocking(false).build().unwrap();
    let finding = Scope::new(config)
        .run(async {
            async_sanitizer::spawn_named("forgotten-worker", pending::<()>());
            async_sanitizer::thread::Builder::new()
                .name("forgotten-poller")
                .spawn(|| std::thread::sleep(Duration::from_secs(2)))
                .unwrap();
        })
        .await
        .unwrap_err();

    println!("{finding}");
}
