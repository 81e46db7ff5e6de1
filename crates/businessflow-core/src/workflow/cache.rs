//! Read-through cache of definition versions.
//!
//! Definition versions are immutable once published, so entries never go
//! stale. The run -> version mapping is dropped when a run finishes.

use std::sync::Arc;

use businessflow_types::error::StorageError;
use businessflow_types::workflow::WorkflowDefinition;
use dashmap::DashMap;
use uuid::Uuid;

use crate::repository::ExecutionStore;

#[derive(Debug, Default)]
pub struct DefinitionCache {
    definitions: DashMap<(Uuid, u32), Arc<WorkflowDefinition>>,
    runs: DashMap<Uuid, (Uuid, u32)>,
}

impl DefinitionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a definition version.
    pub fn insert(&self, def: WorkflowDefinition) -> Arc<WorkflowDefinition> {
        let def = Arc::new(def);
        self.definitions.insert((def.id, def.version), Arc::clone(&def));
        def
    }

    /// Get a definition version, loading it from `store` on a miss.
    pub async fn definition<S: ExecutionStore>(
        &self,
        store: &S,
        workflow_id: Uuid,
        version: u32,
    ) -> Result<Option<Arc<WorkflowDefinition>>, StorageError> {
        if let Some(def) = self.definitions.get(&(workflow_id, version)) {
            return Ok(Some(Arc::clone(def.value())));
        }
        Ok(store
            .get_definition(&workflow_id, version)
            .await?
            .map(|def| self.insert(def)))
    }

    /// Record which definition version a run executes.
    pub fn bind_run(&self, run_id: Uuid, workflow_id: Uuid, version: u32) {
        self.runs.insert(run_id, (workflow_id, version));
    }

    /// Definition version executed by `run_id`.
    pub async fn for_run<S: ExecutionStore>(
        &self,
        store: &S,
        run_id: Uuid,
    ) -> Result<Option<Arc<WorkflowDefinition>>, StorageError> {
        let key = self.runs.get(&run_id).map(|entry| *entry.value());
        let (workflow_id, version) = match key {
            Some(key) => key,
            None => match store.get_run(&run_id).await? {
                Some(run) => {
                    self.bind_run(run_id, run.workflow_id, run.workflow_version);
                    (run.workflow_id, run.workflow_version)
                }
                None => return Ok(None),
            },
        };
        self.definition(store, workflow_id, version).await
    }

    /// Forget a finished run.
    pub fn release_run(&self, run_id: &Uuid) {
        self.runs.remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryExecutionStore;
    use businessflow_types::execution::{ExecutionRun, RunStatus};
    use businessflow_types::workflow::{RetryPolicy, StepDefinition};
    use chrono::Utc;
    use serde_json::json;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            version: 1,
            name: "cached".into(),
            description: None,
            is_active: true,
            concurrency: Some(2),
            triggers: vec![],
            steps: vec![StepDefinition {
                id: "a".into(),
                name: "a".into(),
                capability: "noop".into(),
                input: json!({}),
                depends_on: vec![],
                condition: None,
                retry: RetryPolicy::default(),
                timeout_ms: None,
            }],
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_loads_through_store_once() {
        let store = InMemoryExecutionStore::new();
        let def = definition();
        store.insert_definition(&def).await.unwrap();

        let cache = DefinitionCache::new();
        let loaded = cache.definition(&store, def.id, 1).await.unwrap().unwrap();
        assert_eq!(loaded.concurrency, Some(2));
        assert!(cache.definition(&store, def.id, 9).await.unwrap().is_none());

        let again = cache.definition(&store, def.id, 1).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&loaded, &again));
    }

    #[tokio::test]
    async fn test_for_run_resolves_version() {
        let store = InMemoryExecutionStore::new();
        let def = definition();
        store.insert_definition(&def).await.unwrap();
        let now = Utc::now();
        let run = ExecutionRun {
            id: Uuid::now_v7(),
            workflow_id: def.id,
            workflow_version: 1,
            workflow_name: def.name.clone(),
            status: RunStatus::Pending,
            context: json!({}),
            correlation_id: None,
            trigger_id: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };
        store.create_run(&run).await.unwrap();

        let cache = DefinitionCache::new();
        assert_eq!(cache.for_run(&store, run.id).await.unwrap().unwrap().id, def.id);
        assert!(cache.for_run(&store, Uuid::now_v7()).await.unwrap().is_none());
        cache.release_run(&run.id);
    }
}
