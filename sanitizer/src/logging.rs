use once_cell::sync::OnceCell;

/// Environment variable controlling diagnostic verbosity, e.g.
/// `ASYNC_SANITIZER_LOG=debug`.
pub const LOG_ENV: &str = "ASYNC_SANITIZER_LOG";

/// Installs the crate's logger.
///
/// Reads [`LOG_ENV`] and defaults to `warn`, which is the level leak and
/// blocking notices are emitted at under the warn action. Idempotent, and a
/// logger already installed by the host application wins; `#[no_leaks]`
/// calls this so plain test binaries get the notices without any setup.
pub fn init_logging() {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_init(|| {
        let env = env_logger::Env::new().filter_or(LOG_ENV, "warn");
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_is_idempotent() {
        super::init_logging();
        super::init_logging();
        log::debug!("logger survives repeated initialization");
    }
}
