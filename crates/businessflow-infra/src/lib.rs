//! Infrastructure layer for BusinessFlow.
//!
//! Contains implementations of the ports defined in `businessflow-core`:
//! the SQLite execution store, the `http` and `ai_inference` connectors, and
//! the `config.toml` loader.

pub mod config;
pub mod connector;
pub mod sqlite;
