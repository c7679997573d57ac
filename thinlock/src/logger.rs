use log::SetLoggerError;

/// Attempt to init an env_logger for the runtime.
///
/// Filters come from `RUST_LOG`; by default, use info level logging. Fails if a
/// logger has already been installed.
pub fn try_init() -> Result<(), SetLoggerError> {
    env_logger::try_init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    )
}
