//! Process-wide tracing setup for the storage engine and its binaries.

/// Subscriber configuration (filters, output format).
pub mod subscriber;

pub use subscriber::{LogFormat, ObservabilityConfig};

/// Initialize process-wide tracing with defaults (`RUST_LOG`, else `info`; JSON lines).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    subscriber::init(&ObservabilityConfig::default());
}

/// Initialize process-wide tracing with an explicit configuration.
pub fn init_with(config: &ObservabilityConfig) {
    subscriber::init(config);
}
