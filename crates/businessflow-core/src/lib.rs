//! Workflow engine logic and storage ports for BusinessFlow.
//!
//! This crate defines the `ExecutionStore` port that the infrastructure
//! layer implements. It depends only on `businessflow-types`, never on
//! `businessflow-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
