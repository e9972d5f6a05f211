//! Tracing setup shared by the CLI and anyone embedding this crate.

/// Initialize a `tracing-subscriber` formatter honoring `RUST_LOG` (or the
/// crate's own default), with ANSI auto-detected from the terminal.
///
/// Safe to call more than once; subsequent calls are no-ops (the global
/// subscriber can only be installed once per process).
pub fn init() {
    let use_ansi = std::env::var("NO_COLOR").is_err()
        && std::io::IsTerminal::is_terminal(&std::io::stdout());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(use_ansi)
        .try_init();
}
