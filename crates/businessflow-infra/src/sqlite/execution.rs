//! SQLite execution store.
//!
//! Implements `ExecutionStore` from `businessflow-core` using sqlx with split
//! read/write pools. Definitions and JSON payloads are stored as text.
//! Timestamps are fixed-width RFC 3339 (microseconds, `Z`) so they order
//! correctly as strings. The attempt invariant is enforced by the schema:
//! `UNIQUE(run_id, step_id, attempt)` plus a partial unique index over
//! non-terminal rows.

use businessflow_core::repository::ExecutionStore;
use businessflow_types::error::StorageError;
use businessflow_types::execution::{
    ExecutionRun, RunFilter, RunStatus, StepExecution, StepExecutionError, StepStatus,
    StepTransition,
};
use businessflow_types::workflow::WorkflowDefinition;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ExecutionStore`.
#[derive(Debug, Clone)]
pub struct SqliteExecutionStore {
    pool: DatabasePool,
}

impl SqliteExecutionStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Open `database_url` and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = DatabasePool::new(database_url).await.map_err(map_sqlx)?;
        Ok(Self::new(pool))
    }

    async fn step_exists(&self, id: &Uuid) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM step_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;
        Ok(row.is_some())
    }

    async fn run_exists(&self, id: &Uuid) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM execution_runs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;
        Ok(row.is_some())
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    workflow_id: String,
    workflow_version: i64,
    workflow_name: String,
    status: String,
    context: String,
    correlation_id: Option<String>,
    trigger_id: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    finished_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_version: row.try_get("workflow_version")?,
            workflow_name: row.try_get("workflow_name")?,
            status: row.try_get("status")?,
            context: row.try_get("context")?,
            correlation_id: row.try_get("correlation_id")?,
            trigger_id: row.try_get("trigger_id")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_run(self) -> Result<ExecutionRun, StorageError> {
        Ok(ExecutionRun {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            workflow_version: self.workflow_version as u32,
            workflow_name: self.workflow_name,
            status: self
                .status
                .parse::<RunStatus>()
                .map_err(StorageError::Serialization)?,
            context: serde_json::from_str(&self.context)?,
            correlation_id: self.correlation_id,
            trigger_id: self.trigger_id,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct StepRow {
    id: String,
    run_id: String,
    step_id: String,
    attempt: i64,
    status: String,
    input: Option<String>,
    output: Option<String>,
    error: Option<String>,
    not_before: Option<String>,
    queued_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            step_id: row.try_get("step_id")?,
            attempt: row.try_get("attempt")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            not_before: row.try_get("not_before")?,
            queued_at: row.try_get("queued_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_step(self) -> Result<StepExecution, StorageError> {
        Ok(StepExecution {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            step_id: self.step_id,
            attempt: self.attempt as u32,
            status: self
                .status
                .parse::<StepStatus>()
                .map_err(StorageError::Serialization)?,
            input: parse_json(self.input.as_deref())?,
            output: parse_json(self.output.as_deref())?,
            error: self
                .error
                .as_deref()
                .map(serde_json::from_str::<StepExecutionError>)
                .transpose()?,
            not_before: self.not_before.as_deref().map(parse_datetime).transpose()?,
            queued_at: parse_datetime(&self.queued_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn map_sqlx(e: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StorageError::Conflict(db.message().to_string());
        }
    }
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StorageError::Connection(e.to_string())
        }
        other => StorageError::Query(other.to_string()),
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, StorageError> {
    s.parse::<Uuid>()
        .map_err(|e| StorageError::Serialization(format!("invalid UUID '{s}': {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("invalid datetime '{s}': {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_json(s: Option<&str>) -> Result<Option<Value>, StorageError> {
    Ok(s.map(serde_json::from_str).transpose()?)
}

fn to_json<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>, StorageError> {
    Ok(value.map(serde_json::to_string).transpose()?)
}

fn rows_into_runs(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<ExecutionRun>, StorageError> {
    rows.iter()
        .map(|row| RunRow::from_row(row).map_err(map_sqlx)?.into_run())
        .collect()
}

fn rows_into_steps(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<StepExecution>, StorageError> {
    rows.iter()
        .map(|row| StepRow::from_row(row).map_err(map_sqlx)?.into_step())
        .collect()
}

fn rows_into_definitions(
    rows: &[sqlx::sqlite::SqliteRow],
) -> Result<Vec<WorkflowDefinition>, StorageError> {
    rows.iter()
        .map(|row| {
            let json: String = row.try_get("definition").map_err(map_sqlx)?;
            Ok(serde_json::from_str(&json)?)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// ExecutionStore impl
// ---------------------------------------------------------------------------

impl ExecutionStore for SqliteExecutionStore {
    async fn insert_definition(&self, def: &WorkflowDefinition) -> Result<(), StorageError> {
        let json = serde_json::to_string(def)?;
        sqlx::query(
            r#"INSERT INTO workflow_definitions (id, version, name, is_active, definition, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(def.id.to_string())
        .bind(def.version as i64)
        .bind(&def.name)
        .bind(def.is_active)
        .bind(&json)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_definition(
        &self,
        id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, StorageError> {
        let rows = sqlx::query("SELECT definition FROM workflow_definitions WHERE id = ? AND version = ?")
            .bind(id.to_string())
            .bind(version as i64)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        Ok(rows_into_definitions(&rows)?.into_iter().next())
    }

    async fn latest_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, StorageError> {
        let rows = sqlx::query(
            "SELECT definition FROM workflow_definitions WHERE id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;
        Ok(rows_into_definitions(&rows)?.into_iter().next())
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, StorageError> {
        let rows = sqlx::query(
            r#"SELECT d.definition FROM workflow_definitions d
               JOIN (SELECT id, MAX(version) AS version FROM workflow_definitions GROUP BY id) latest
                 ON d.id = latest.id AND d.version = latest.version
               ORDER BY d.name ASC, d.id ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;
        rows_into_definitions(&rows)
    }

    async fn create_run(&self, run: &ExecutionRun) -> Result<(), StorageError> {
        sqlx::query(
            r#"INSERT INTO execution_runs
               (id, workflow_id, workflow_version, workflow_name, status, context,
                correlation_id, trigger_id, error, created_at, updated_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(run.workflow_id.to_string())
        .bind(run.workflow_version as i64)
        .bind(&run.workflow_name)
        .bind(run.status.as_str())
        .bind(serde_json::to_string(&run.context)?)
        .bind(&run.correlation_id)
        .bind(&run.trigger_id)
        .bind(&run.error)
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .bind(run.finished_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<ExecutionRun>, StorageError> {
        let rows = sqlx::query("SELECT * FROM execution_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        Ok(rows_into_runs(&rows)?.into_iter().next())
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        expected: RunStatus,
        new: RunStatus,
        error: Option<&str>,
        context: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let context = to_json(context)?;
        let now = format_datetime(&now);
        let finished_at = new.is_terminal().then(|| now.clone());

        let result = sqlx::query(
            r#"UPDATE execution_runs SET
                 status = ?,
                 error = COALESCE(?, error),
                 context = COALESCE(?, context),
                 updated_at = ?,
                 finished_at = COALESCE(?, finished_at)
               WHERE id = ? AND status = ?"#,
        )
        .bind(new.as_str())
        .bind(error)
        .bind(&context)
        .bind(&now)
        .bind(&finished_at)
        .bind(run_id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            if !self.run_exists(run_id).await? {
                return Err(StorageError::NotFound);
            }
            return Ok(false);
        }
        Ok(true)
    }

    async fn list_runs(
        &self,
        workflow_id: &Uuid,
        filter: &RunFilter,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<ExecutionRun>, StorageError> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM execution_runs WHERE workflow_id = ");
        query.push_bind(workflow_id.to_string());
        if let Some(before) = before {
            query.push(" AND id < ").push_bind(before.to_string());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(correlation_id) = &filter.correlation_id {
            query.push(" AND correlation_id = ").push_bind(correlation_id.clone());
        }
        if let Some(trigger_id) = &filter.trigger_id {
            query.push(" AND trigger_id = ").push_bind(trigger_id.clone());
        }
        query.push(" ORDER BY id DESC LIMIT ").push_bind(limit as i64);

        let rows = query
            .build()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        rows_into_runs(&rows)
    }

    async fn list_active_runs(&self) -> Result<Vec<ExecutionRun>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_runs WHERE status IN ('pending', 'running') ORDER BY id ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;
        rows_into_runs(&rows)
    }

    async fn run_status_counts(&self, workflow_id: &Uuid) -> Result<Vec<(RunStatus, u64)>, StorageError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM execution_runs WHERE workflow_id = ? GROUP BY status ORDER BY status",
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status").map_err(map_sqlx)?;
                let n: i64 = row.try_get("n").map_err(map_sqlx)?;
                let status = status.parse::<RunStatus>().map_err(StorageError::Serialization)?;
                Ok((status, n as u64))
            })
            .collect()
    }

    async fn insert_step_execution(&self, step: &StepExecution) -> Result<(), StorageError> {
        let mut tx = self.pool.writer.begin().await.map_err(map_sqlx)?;

        let latest: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(attempt) FROM step_executions WHERE run_id = ? AND step_id = ?",
        )
        .bind(step.run_id.to_string())
        .bind(&step.step_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        if let Some(latest) = latest.filter(|latest| *latest >= step.attempt as i64) {
            return Err(StorageError::Conflict(format!(
                "step '{}' of run {} already has attempt {latest}",
                step.step_id, step.run_id
            )));
        }

        sqlx::query(
            r#"INSERT INTO step_executions
               (id, run_id, step_id, attempt, status, input, output, error,
                not_before, queued_at, started_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(step.id.to_string())
        .bind(step.run_id.to_string())
        .bind(&step.step_id)
        .bind(step.attempt as i64)
        .bind(step.status.as_str())
        .bind(to_json(step.input.as_ref())?)
        .bind(to_json(step.output.as_ref())?)
        .bind(to_json(step.error.as_ref())?)
        .bind(step.not_before.as_ref().map(format_datetime))
        .bind(format_datetime(&step.queued_at))
        .bind(step.started_at.as_ref().map(format_datetime))
        .bind(step.finished_at.as_ref().map(format_datetime))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn transition_step(
        &self,
        id: &Uuid,
        expected: StepStatus,
        update: &StepTransition,
    ) -> Result<bool, StorageError> {
        if expected.is_terminal() {
            return Ok(false);
        }
        let result = sqlx::query(
            r#"UPDATE step_executions SET
                 status = COALESCE(?, status),
                 input = COALESCE(?, input),
                 output = COALESCE(?, output),
                 error = COALESCE(?, error),
                 started_at = COALESCE(?, started_at),
                 finished_at = COALESCE(?, finished_at)
               WHERE id = ? AND status = ?"#,
        )
        .bind(update.status.map(StepStatus::as_str))
        .bind(to_json(update.input.as_ref())?)
        .bind(to_json(update.output.as_ref())?)
        .bind(to_json(update.error.as_ref())?)
        .bind(update.started_at.as_ref().map(format_datetime))
        .bind(update.finished_at.as_ref().map(format_datetime))
        .bind(id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            if !self.step_exists(id).await? {
                return Err(StorageError::NotFound);
            }
            return Ok(false);
        }
        Ok(true)
    }

    async fn get_step_execution(&self, id: &Uuid) -> Result<Option<StepExecution>, StorageError> {
        let rows = sqlx::query("SELECT * FROM step_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        Ok(rows_into_steps(&rows)?.into_iter().next())
    }

    async fn list_step_executions(&self, run_id: &Uuid) -> Result<Vec<StepExecution>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM step_executions WHERE run_id = ? ORDER BY queued_at ASC, attempt ASC, id ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;
        rows_into_steps(&rows)
    }

    async fn due_step_executions(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        exclude_runs: &[Uuid],
    ) -> Result<Vec<StepExecution>, StorageError> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT * FROM step_executions WHERE status = 'queued' AND (not_before IS NULL OR not_before <= ",
        );
        query.push_bind(format_datetime(&now)).push(")");
        if !exclude_runs.is_empty() {
            query.push(" AND run_id NOT IN (");
            let mut ids = query.separated(", ");
            for run_id in exclude_runs {
                ids.push_bind(run_id.to_string());
            }
            ids.push_unseparated(")");
        }
        query
            .push(" ORDER BY queued_at ASC, id ASC LIMIT ")
            .push_bind(limit as i64);

        let rows = query
            .build()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        rows_into_steps(&rows)
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let next: Option<String> = sqlx::query_scalar(
            "SELECT MIN(COALESCE(not_before, queued_at)) FROM step_executions WHERE status = 'queued'",
        )
        .fetch_one(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;
        next.as_deref().map(parse_datetime).transpose()
    }

    async fn count_in_flight(&self, run_id: &Uuid) -> Result<u32, StorageError> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM step_executions WHERE run_id = ? AND status = 'dispatched'",
        )
        .bind(run_id.to_string())
        .fetch_one(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;
        Ok(n as u32)
    }

    async fn list_dispatched(&self) -> Result<Vec<StepExecution>, StorageError> {
        let rows = sqlx::query("SELECT * FROM step_executions WHERE status = 'dispatched' ORDER BY id ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        rows_into_steps(&rows)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use businessflow_types::workflow::{RetryPolicy, StepDefinition};
    use chrono::Duration;
    use serde_json::json;

    async fn store() -> (SqliteExecutionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("exec.db").display());
        let store = SqliteExecutionStore::connect(&url).await.unwrap();
        (store, dir)
    }

    fn definition(version: u32) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            version,
            name: "orders".into(),
            description: Some("order intake".into()),
            is_active: true,
            concurrency: Some(2),
            triggers: vec![],
            steps: vec![StepDefinition {
                id: "fetch".into(),
                name: "Fetch".into(),
                capability: "http".into(),
                input: json!({ "url": "{{context.url}}" }),
                depends_on: vec![],
                condition: None,
                retry: RetryPolicy::default(),
                timeout_ms: Some(5_000),
            }],
            metadata: Default::default(),
        }
    }

    fn run_of(def: &WorkflowDefinition, correlation_id: Option<&str>) -> ExecutionRun {
        let now = Utc::now();
        ExecutionRun {
            id: Uuid::now_v7(),
            workflow_id: def.id,
            workflow_version: def.version,
            workflow_name: def.name.clone(),
            status: RunStatus::Pending,
            context: json!({ "context": { "url": "https://example.com" }, "steps": {} }),
            correlation_id: correlation_id.map(str::to_string),
            trigger_id: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    async fn seeded() -> (SqliteExecutionStore, tempfile::TempDir, WorkflowDefinition, ExecutionRun) {
        let (store, dir) = store().await;
        let def = definition(1);
        store.insert_definition(&def).await.unwrap();
        let run = run_of(&def, None);
        store.create_run(&run).await.unwrap();
        (store, dir, def, run)
    }

    #[tokio::test]
    async fn test_definition_versions() {
        let (store, _dir) = store().await;
        let v1 = definition(1);
        let mut v2 = v1.clone();
        v2.version = 2;
        v2.name = "orders-v2".into();
        store.insert_definition(&v1).await.unwrap();
        store.insert_definition(&v2).await.unwrap();

        assert!(matches!(
            store.insert_definition(&v1).await,
            Err(StorageError::Conflict(_))
        ));
        assert_eq!(store.get_definition(&v1.id, 1).await.unwrap(), Some(v1.clone()));
        assert_eq!(store.latest_definition(&v1.id).await.unwrap().unwrap().version, 2);

        let all = store.list_definitions().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "orders-v2");
    }

    #[tokio::test]
    async fn test_run_roundtrip_and_cas() {
        let (store, _dir, _def, run) = seeded().await;
        assert_eq!(store.get_run(&run.id).await.unwrap().unwrap().context, run.context);

        let now = Utc::now();
        let ctx = json!({ "context": {}, "steps": { "fetch": { "output": 1 } } });
        assert!(store
            .update_run_status(&run.id, RunStatus::Pending, RunStatus::Running, None, Some(&ctx), now)
            .await
            .unwrap());
        // Stale expectation is rejected.
        assert!(!store
            .update_run_status(&run.id, RunStatus::Pending, RunStatus::Cancelled, None, None, now)
            .await
            .unwrap());
        assert!(store
            .update_run_status(&run.id, RunStatus::Running, RunStatus::Failed, Some("boom"), None, now)
            .await
            .unwrap());

        let stored = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("boom"));
        assert_eq!(stored.context, ctx);
        assert!(stored.finished_at.is_some());
        assert!(store.list_active_runs().await.unwrap().is_empty());

        assert!(matches!(
            store
                .update_run_status(&Uuid::now_v7(), RunStatus::Pending, RunStatus::Running, None, None, now)
                .await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_attempt_invariant() {
        let (store, _dir, _def, run) = seeded().await;
        let now = Utc::now();
        let first = StepExecution::queued(run.id, "fetch", 1, None, None, now);
        store.insert_step_execution(&first).await.unwrap();

        // Second open attempt for the same step.
        let second = StepExecution::queued(run.id, "fetch", 2, None, None, now);
        assert!(matches!(
            store.insert_step_execution(&second).await,
            Err(StorageError::Conflict(_))
        ));

        let fail = StepTransition::to(StepStatus::Failed)
            .with_error(StepExecutionError::Timeout { timeout_ms: 10 })
            .finished(now);
        assert!(store
            .transition_step(&first.id, StepStatus::Queued, &fail)
            .await
            .unwrap());
        store.insert_step_execution(&second).await.unwrap();

        // Attempt numbers only grow.
        let stale = StepExecution::failed_before_dispatch(
            run.id,
            "fetch",
            StepExecutionError::Cancelled,
            now,
        );
        assert!(matches!(
            store.insert_step_execution(&stale).await,
            Err(StorageError::Conflict(_))
        ));

        let rows = store.list_step_executions(&run.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].error, Some(StepExecutionError::Timeout { timeout_ms: 10 }));
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let (store, _dir, _def, run) = seeded().await;
        let now = Utc::now();
        let row = StepExecution::queued(run.id, "fetch", 1, None, None, now);
        store.insert_step_execution(&row).await.unwrap();

        let claim = StepTransition::to(StepStatus::Dispatched).started(now);
        assert!(store.transition_step(&row.id, StepStatus::Queued, &claim).await.unwrap());
        assert!(!store.transition_step(&row.id, StepStatus::Queued, &claim).await.unwrap());
        assert_eq!(store.count_in_flight(&run.id).await.unwrap(), 1);
        assert_eq!(store.list_dispatched().await.unwrap().len(), 1);

        let done = StepTransition::to(StepStatus::Succeeded)
            .with_input(json!({ "url": "https://example.com" }))
            .with_output(json!({ "status": 200 }))
            .finished(now);
        assert!(store.transition_step(&row.id, StepStatus::Dispatched, &done).await.unwrap());
        assert!(!store.transition_step(&row.id, StepStatus::Dispatched, &done).await.unwrap());

        let stored = store.get_step_execution(&row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, StepStatus::Succeeded);
        assert_eq!(stored.output, Some(json!({ "status": 200 })));
        assert!(stored.started_at.is_some());
        assert_eq!(store.count_in_flight(&run.id).await.unwrap(), 0);

        assert!(matches!(
            store.transition_step(&Uuid::now_v7(), StepStatus::Queued, &claim).await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_due_ordering_and_next_due() {
        let (store, _dir, def, run) = seeded().await;
        let other = run_of(&def, None);
        store.create_run(&other).await.unwrap();

        let now = Utc::now();
        let later = StepExecution::queued(run.id, "fetch", 1, None, Some(now + Duration::seconds(30)), now);
        let older = StepExecution::queued(other.id, "fetch", 1, None, None, now - Duration::seconds(5));
        store.insert_step_execution(&later).await.unwrap();
        store.insert_step_execution(&older).await.unwrap();

        let due = store.due_step_executions(now, 10, &[]).await.unwrap();
        assert_eq!(due.iter().map(|r| r.id).collect::<Vec<_>>(), vec![older.id]);

        let due = store
            .due_step_executions(now + Duration::seconds(31), 10, &[])
            .await
            .unwrap();
        assert_eq!(due.iter().map(|r| r.id).collect::<Vec<_>>(), vec![older.id, later.id]);

        let due = store
            .due_step_executions(now + Duration::seconds(31), 1, &[other.id])
            .await
            .unwrap();
        assert_eq!(due.iter().map(|r| r.id).collect::<Vec<_>>(), vec![later.id]);

        let next = store.next_due_at().await.unwrap().unwrap();
        assert_eq!(format_datetime(&next), format_datetime(&older.queued_at));
    }

    #[tokio::test]
    async fn test_list_runs_keyset_and_filters() {
        let (store, _dir) = store().await;
        let def = definition(1);
        store.insert_definition(&def).await.unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            let run = run_of(&def, Some(if i % 2 == 0 { "even" } else { "odd" }));
            store.create_run(&run).await.unwrap();
            ids.push(run.id);
        }
        ids.reverse();

        let all = RunFilter::default();
        let page = store.list_runs(&def.id, &all, None, 2).await.unwrap();
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), ids[..2].to_vec());
        let page = store.list_runs(&def.id, &all, Some(ids[1]), 10).await.unwrap();
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), ids[2..].to_vec());

        let even = RunFilter {
            correlation_id: Some("even".into()),
            ..RunFilter::default()
        };
        assert_eq!(store.list_runs(&def.id, &even, None, 10).await.unwrap().len(), 3);

        let now = Utc::now();
        store
            .update_run_status(&ids[0], RunStatus::Pending, RunStatus::Succeeded, None, None, now)
            .await
            .unwrap();
        let counts = store.run_status_counts(&def.id).await.unwrap();
        assert!(counts.contains(&(RunStatus::Pending, 4)));
        assert!(counts.contains(&(RunStatus::Succeeded, 1)));
    }

    #[tokio::test]
    async fn test_trigger_occurrence_unique() {
        let (store, _dir) = store().await;
        let def = definition(1);
        store.insert_definition(&def).await.unwrap();
        let delivered = || ExecutionRun {
            trigger_id: Some("nightly".into()),
            ..run_of(&def, Some("nightly:2026-10-16T00:00:00Z"))
        };
        store.create_run(&delivered()).await.unwrap();
        assert!(matches!(
            store.create_run(&delivered()).await,
            Err(StorageError::Conflict(_))
        ));

        // Manual runs are not constrained.
        let manual = run_of(&def, Some("nightly:2026-10-16T00:00:00Z"));
        store.create_run(&manual).await.unwrap();
        let filter = RunFilter {
            correlation_id: Some("nightly:2026-10-16T00:00:00Z".into()),
            ..RunFilter::default()
        };
        assert_eq!(store.list_runs(&def.id, &filter, None, 10).await.unwrap().len(), 2);
    }
}
