use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber filtered at `min_level`.
///
/// `RUST_LOG` takes precedence over `min_level`. Calling it again once a
/// global subscriber is set is a no-op; returns `true` when this call installed it.
pub fn init_logging(min_level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(min_level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        let _ = init_logging("DEBUG");
        assert!(!init_logging("not a level"));
    }
}
