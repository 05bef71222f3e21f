// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Provides a `#[test]` attribute that initializes tracing before running the
//! test body, so that `tracing` events show up in the captured test output.
//!
//! Use it by importing it in place of the built-in attribute:
//!
//! ```ignore
//! use test_with_tracing::test;
//!
//! #[test]
//! fn my_test() {
//!     tracing::info!("visible in test output");
//! }
//! ```

pub use test_with_tracing_macro::test;
use tracing_subscriber::EnvFilter;

/// Installs the global test subscriber if one has not been installed yet.
///
/// The filter is taken from `RUST_LOG`, defaulting to everything at `trace`.
#[doc(hidden)]
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trace"));
    // Only the first test in the process wins; later calls are expected to
    // fail.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_ansi(false)
        .try_init();
}
