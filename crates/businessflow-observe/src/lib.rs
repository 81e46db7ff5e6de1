//! Logging and trace export setup shared by BusinessFlow binaries.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, shutdown_tracing};
