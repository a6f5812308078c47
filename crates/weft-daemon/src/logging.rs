use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// The filter comes from `WEFT_LOG` (default `info`). `json` switches the
/// output to line-delimited JSON for log collectors. Safe to call more than
/// once; later calls are no-ops.
pub fn init_logging(json: bool) {
    let filter =
        EnvFilter::try_from_env("WEFT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!(event = "daemon.logging.already_initialized");
    }
}
