use tracing_subscriber::EnvFilter;

pub(crate) const LOG_ENV: &str = "KEEL_LOG";

pub(crate) fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

/// Logs go to stderr; stdout is reserved for command output.
pub(crate) fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();

    // Already set when running under a test harness.
    let _ = tracing::subscriber::set_global_default(subscriber);
}
