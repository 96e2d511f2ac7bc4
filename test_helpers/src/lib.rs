//! Helpers for tests, most notably a logging bootstrap honoring `RUST_LOG`.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_docs, clippy::explicit_iter_loop, clippy::use_self)]

use observability_deps::tracing;
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static LOG_SETUP: Once = Once::new();

/// Enables debug logging if the RUST_LOG environment variable is
/// set. Does nothing if RUST_LOG is not set. If enable_logging has
/// been set previously, does nothing.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Start logging for tests, redirecting `log` records into `tracing`.
pub fn start_logging() {
    // ensure the global has been initialized
    LOG_SETUP.call_once(|| {
        // honor any existing RUST_LOG level
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        tracing_log::LogTracer::init().expect("registering log forwarder");

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("setting global tracing subscriber");
    })
}

/// Asserts that the given string contains the expected substring,
/// with a readable failure message.
#[macro_export]
macro_rules! assert_contains {
    ($actual:expr, $expected:expr) => {
        let actual_value: String = $actual.to_string();
        let expected_value: String = $expected.to_string();
        assert!(
            actual_value.contains(&expected_value),
            "Can not find expected value in actual.\nExpected:\n{}\nActual:\n{}",
            expected_value,
            actual_value,
        )
    };
}
