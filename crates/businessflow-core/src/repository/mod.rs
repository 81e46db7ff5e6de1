//! Storage trait definitions (ports) and the in-memory implementation.
//!
//! `ExecutionStore` defines the storage interface that the infrastructure
//! layer (businessflow-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod execution;
pub mod memory;

pub use execution::ExecutionStore;
pub use memory::InMemoryExecutionStore;
