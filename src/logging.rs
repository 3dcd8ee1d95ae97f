use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize the tracing subscriber. `RUST_LOG` wins when set; otherwise
/// the crate logs at `default_level`.
pub fn init_logging(default_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("filemesh={default_level}")));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;
    Ok(())
}

/// Initialize logging, falling back to stderr output of the failure when
/// the subscriber cannot be installed (e.g. set twice in tests).
pub fn init_logging_safe(default_level: &str) {
    if let Err(err) = init_logging(default_level) {
        eprintln!("Warning: failed to set up logging: {err}");
    }
}
