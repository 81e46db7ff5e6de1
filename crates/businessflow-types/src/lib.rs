//! Shared domain types for BusinessFlow.
//!
//! This crate contains the core domain types used across the BusinessFlow
//! workflow engine: definitions, runs, step attempts, statuses, engine events,
//! configuration and the storage error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod workflow;
