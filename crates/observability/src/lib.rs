//! Process-wide tracing setup shared by binaries that embed keelson.

/// Subscriber construction (filters, formats).
pub mod tracing;

pub use self::tracing::LogFormat;

/// Install JSON logging filtered by `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init_with(LogFormat::Json);
}

/// Like [`init`] with an explicit output format.
pub fn init_with(format: LogFormat) {
    tracing::init_with(format);
}
