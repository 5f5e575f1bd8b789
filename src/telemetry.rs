use tracing_subscriber::EnvFilter;

/// Guard returned by [`init`]; bound in `main` for the life of the process.
pub struct TelemetryGuard;

/// Install the global tracing subscriber.
///
/// Logs go to stderr so they never mix with provider output on stdout.
/// `OMC_BRIDGE_LOG` overrides the filter (same syntax as `RUST_LOG`).
pub fn init() -> TelemetryGuard {
    let filter = EnvFilter::try_from_env("OMC_BRIDGE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("omc_bridge=info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();

    TelemetryGuard
}
