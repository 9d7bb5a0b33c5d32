//! Tracing setup for hosts embedding the maintenance pipelines.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Installs a compact fmt subscriber filtered by `RUST_LOG`, defaulting to `warn`.
///
/// Returns false if a global subscriber was already installed.
pub fn init_tracing() -> bool {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let _ = init_tracing();
        assert!(!init_tracing());
    }
}
