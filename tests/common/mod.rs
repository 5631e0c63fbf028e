//! Shared helpers for integration tests that need a real redis-server.

use std::sync::Once;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "redbed=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Whether a redis-server binary is on the PATH. Tests that spawn real
/// processes skip themselves when it is missing.
pub fn redis_server_available() -> bool {
    std::process::Command::new("redis-server")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}
