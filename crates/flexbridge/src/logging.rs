use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `log_level` is used, falling back to
/// `info` when it is absent or does not parse. Calling this twice is a
/// no-op.
pub fn init_logging(log_level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback_filter(log_level));

    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .try_init();
}

fn fallback_filter(log_level: Option<&str>) -> EnvFilter {
    log_level
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_level() {
        assert_eq!(fallback_filter(Some("debug")).to_string(), "debug");
        assert_eq!(fallback_filter(None).to_string(), "info");
    }

    #[test]
    fn init_twice_is_harmless() {
        init_logging(Some("warn"));
        init_logging(Some("trace"));
    }
}
