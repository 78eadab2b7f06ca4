#![allow(dead_code)]

use std::time::Duration;

/// Every test binary installs the logger once so warn-action notices are
/// visible when a test fails.
pub fn init() {
    async_sanitizer::init_logging();
}

/// Holds the scheduler synchronously, the way offending code does.
pub fn block_scheduler(duration: Duration) {
    std::thread::sleep(duration);
}

/// Replaces line numbers with `LINE` so report text can be compared
/// without tracking source movement.
pub fn strip(text: impl AsRef<str>) -> String {
    let re = regex::Regex::new(r":\d+").unwrap();
    re.replace_all(text.as_ref(), ":LINE").to_string()
}
