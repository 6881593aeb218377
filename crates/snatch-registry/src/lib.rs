use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use snatch_core::{
    SnatchError, SnatchProgress, SnatchResult, Task, TaskResult, TaskRow, TaskStatus, TaskType,
};
use uuid::Uuid;

/// Durable record of every asynchronous unit of work. Backed by a single
/// SQLite file in WAL journal mode with a bounded busy timeout, so one
/// writer and many short readers can share it without external locking.
/// Every operation runs on a blocking-pool thread: `rusqlite::Connection` is
/// not `Send`-safe to hold across an `.await`, so the connection lives
/// behind a plain `Mutex` and each call is dispatched via `spawn_blocking`.
pub struct TaskRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl TaskRegistry {
    pub fn open(path: &std::path::Path, busy_timeout_ms: u32) -> SnatchResult<TaskRegistry> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| SnatchError::Infrastructure(format!("open task db: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| SnatchError::Infrastructure(format!("set WAL mode: {e}")))?;
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms as u64))
            .map_err(|e| SnatchError::Infrastructure(format!("set busy timeout: {e}")))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                result TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT,
                account_alias TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_type_status_created
                ON tasks (type, status, created_at DESC);",
        )
        .map_err(|e| SnatchError::Infrastructure(format!("create schema: {e}")))?;
        Ok(TaskRegistry {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> SnatchResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap();
            f(&guard)
        })
        .await
        .map_err(|e| SnatchError::Infrastructure(format!("blocking task panicked: {e}")))?
        .map_err(|e| SnatchError::Infrastructure(e.to_string()))
    }

    pub async fn create(
        &self,
        task_type: TaskType,
        name: &str,
        account_alias: &str,
    ) -> SnatchResult<String> {
        let id = Uuid::new_v4().to_string();
        let name = name.to_string();
        let alias = account_alias.to_string();
        let task_type_str = task_type_str(task_type).to_string();
        let created_at = Utc::now();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, type, name, status, result, created_at, completed_at, account_alias)
                 VALUES (?1, ?2, ?3, 'pending', NULL, ?4, NULL, ?5)",
                params![id, task_type_str, name, created_at.to_rfc3339(), alias],
            )?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> SnatchResult<Option<Task>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, type, name, status, result, created_at, completed_at, account_alias
                 FROM tasks WHERE id = ?1",
                params![id],
                row_to_task,
            )
            .optional()
        })
        .await
    }

    pub async fn update_progress(&self, id: &str, result: TaskResult) -> SnatchResult<()> {
        let encoded = result.encode()?;
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE tasks SET result = ?1 WHERE id = ?2",
                params![encoded, id],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_status(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<TaskResult>,
    ) -> SnatchResult<()> {
        let encoded = result.map(|r| r.encode()).transpose()?;
        let id = id.to_string();
        let status_str = status_str(status).to_string();
        let completed_at = status.is_terminal().then(|| Utc::now().to_rfc3339());
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE tasks SET status = ?1, result = COALESCE(?2, result), completed_at = ?3
                 WHERE id = ?4",
                params![status_str, encoded, completed_at, id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_running(&self, id: &str, result: Option<TaskResult>) -> SnatchResult<()> {
        self.set_status(id, TaskStatus::Running, result).await
    }

    pub async fn set_paused(&self, id: &str, result: Option<TaskResult>) -> SnatchResult<()> {
        self.set_status(id, TaskStatus::Paused, result).await
    }

    pub async fn set_success(&self, id: &str, result: Option<TaskResult>) -> SnatchResult<()> {
        self.set_status(id, TaskStatus::Success, result).await
    }

    pub async fn set_failure(&self, id: &str, result: Option<TaskResult>) -> SnatchResult<()> {
        self.set_status(id, TaskStatus::Failure, result).await
    }

    pub async fn list_running_snatch(&self) -> SnatchResult<Vec<Task>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, type, name, status, result, created_at, completed_at, account_alias
                 FROM tasks WHERE type = 'snatch' AND status = 'running'
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map([], row_to_task)?;
            rows.collect()
        })
        .await
    }

    pub async fn list_completed_snatch(&self, limit: i64) -> SnatchResult<Vec<Task>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, type, name, status, result, created_at, completed_at, account_alias
                 FROM tasks WHERE type = 'snatch' AND status IN ('success', 'failure')
                 ORDER BY created_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], row_to_task)?;
            rows.collect()
        })
        .await
    }

    /// Only permitted when the task is terminal or paused, matching the
    /// HTTP surface's `DELETE /tasks/{id}` contract.
    pub async fn delete(&self, id: &str) -> SnatchResult<()> {
        let task = self
            .get(id)
            .await?
            .ok_or_else(|| SnatchError::Validation(format!("unknown task: {id}")))?;
        if !matches!(
            task.status,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Paused
        ) {
            return Err(SnatchError::Validation(
                "task can only be deleted when terminal or paused".to_string(),
            ));
        }
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    /// Crash recovery: finds every `running` snatch row, mints a fresh
    /// `run_id`, and returns the recovered (task, progress) pairs for the
    /// caller to re-dispatch into the engine. Rows whose result is
    /// unparseable, or whose profile no longer exists, are transitioned to
    /// `failure` in place instead of being returned.
    pub async fn recover_stuck_snatch_tasks(
        &self,
        profile_exists: impl Fn(&str) -> bool,
    ) -> SnatchResult<Vec<(Task, SnatchProgress)>> {
        let stuck = self.list_running_snatch().await?;
        let mut recovered = Vec::new();
        for task in stuck {
            let raw = match &task.result {
                Some(r) => r.clone(),
                None => {
                    self.set_failure(
                        &task.id,
                        Some(TaskResult::Message(
                            "task auto-failed: no progress recorded before crash".to_string(),
                        )),
                    )
                    .await?;
                    continue;
                }
            };

            let decoded = TaskResult::decode(&raw).ok().and_then(|r| match r {
                TaskResult::Progress(p) => Some(p),
                TaskResult::Message(_) => None,
            });

            let mut progress = match decoded {
                Some(p) => p,
                None => {
                    self.set_failure(
                        &task.id,
                        Some(TaskResult::Message(
                            "task auto-failed: progress data corrupted".to_string(),
                        )),
                    )
                    .await?;
                    continue;
                }
            };

            if !profile_exists(&progress.details.account_alias) {
                self.set_failure(
                    &task.id,
                    Some(TaskResult::Message(format!(
                        "task auto-failed: profile '{}' no longer exists",
                        progress.details.account_alias
                    ))),
                )
                .await?;
                continue;
            }

            progress.run_id = Uuid::new_v4().to_string();
            progress.last_message = "task auto-recovered after worker restart".to_string();
            self.set_running(&task.id, Some(TaskResult::Progress(progress.clone())))
                .await?;
            recovered.push((task, progress));
        }
        Ok(recovered)
    }
}

/// Adapts `TaskRegistry` to the narrow handle `snatch-engine` consumes, so
/// the engine depends only on the trait in `snatch-core`, never on this
/// crate.
#[async_trait]
impl TaskRow for TaskRegistry {
    async fn load(&self, task_id: &str) -> SnatchResult<Option<Task>> {
        self.get(task_id).await
    }

    async fn transition(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<TaskResult>,
    ) -> SnatchResult<()> {
        self.set_status(task_id, status, result).await
    }

    async fn update_progress(&self, task_id: &str, result: TaskResult) -> SnatchResult<()> {
        TaskRegistry::update_progress(self, task_id, result).await
    }
}

fn task_type_str(t: TaskType) -> &'static str {
    match t {
        TaskType::Snatch => "snatch",
        TaskType::Action => "action",
        TaskType::Create => "create",
    }
}

fn task_type_from_str(s: &str) -> rusqlite::Result<TaskType> {
    match s {
        "snatch" => Ok(TaskType::Snatch),
        "action" => Ok(TaskType::Action),
        "create" => Ok(TaskType::Create),
        other => Err(rusqlite::Error::InvalidColumnType(
            1,
            format!("unknown task type: {other}"),
            rusqlite::types::Type::Text,
        )),
    }
}

fn status_str(s: TaskStatus) -> &'static str {
    match s {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Paused => "paused",
        TaskStatus::Success => "success",
        TaskStatus::Failure => "failure",
    }
}

fn status_from_str(s: &str) -> rusqlite::Result<TaskStatus> {
    match s {
        "pending" => Ok(TaskStatus::Pending),
        "running" => Ok(TaskStatus::Running),
        "paused" => Ok(TaskStatus::Paused),
        "success" => Ok(TaskStatus::Success),
        "failure" => Ok(TaskStatus::Failure),
        other => Err(rusqlite::Error::InvalidColumnType(
            3,
            format!("unknown task status: {other}"),
            rusqlite::types::Type::Text,
        )),
    }
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let created_at: String = row.get(5)?;
    let completed_at: Option<String> = row.get(6)?;
    Ok(Task {
        id: row.get(0)?,
        task_type: task_type_from_str(&row.get::<_, String>(1)?)?,
        name: row.get(2)?,
        status: status_from_str(&row.get::<_, String>(3)?)?,
        result: row.get(4)?,
        created_at: parse_rfc3339(&created_at)?,
        completed_at: completed_at.as_deref().map(parse_rfc3339).transpose()?,
        account_alias: row.get(7)?,
    })
}

fn parse_rfc3339(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::InvalidColumnType(5, e.to_string(), rusqlite::types::Type::Text)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> (tempfile::TempDir, TaskRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = TaskRegistry::open(&dir.path().join("tasks.db"), 5000).unwrap();
        (dir, registry)
    }

    #[tokio::test]
    async fn create_then_get_is_pending() {
        let (_dir, registry) = registry().await;
        let id = registry
            .create(TaskType::Snatch, "snatch on acct1", "acct1")
            .await
            .unwrap();
        let task = registry.get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.account_alias, "acct1");
        assert!(task.completed_at.is_none());
    }

    #[tokio::test]
    async fn terminal_transition_sets_completed_at() {
        let (_dir, registry) = registry().await;
        let id = registry
            .create(TaskType::Action, "stop instance", "acct1")
            .await
            .unwrap();
        registry
            .set_success(&id, Some(TaskResult::Message("done".to_string())))
            .await
            .unwrap();
        let task = registry.get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn update_progress_does_not_change_status() {
        let (_dir, registry) = registry().await;
        let id = registry
            .create(TaskType::Snatch, "snatch", "acct1")
            .await
            .unwrap();
        registry.set_running(&id, None).await.unwrap();
        registry
            .update_progress(&id, TaskResult::Message("attempt 1".to_string()))
            .await
            .unwrap();
        let task = registry.get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn delete_rejects_running_task() {
        let (_dir, registry) = registry().await;
        let id = registry
            .create(TaskType::Snatch, "snatch", "acct1")
            .await
            .unwrap();
        registry.set_running(&id, None).await.unwrap();
        let err = registry.delete(&id).await.unwrap_err();
        assert!(matches!(err, SnatchError::Validation(_)));
    }

    #[tokio::test]
    async fn delete_allows_terminal_task() {
        let (_dir, registry) = registry().await;
        let id = registry
            .create(TaskType::Snatch, "snatch", "acct1")
            .await
            .unwrap();
        registry.set_failure(&id, None).await.unwrap();
        registry.delete(&id).await.unwrap();
        assert!(registry.get(&id).await.unwrap().is_none());
    }

    fn sample_progress(alias: &str) -> SnatchProgress {
        SnatchProgress {
            run_id: "old-run-id".to_string(),
            start_time: Utc::now(),
            attempt_count: 2,
            last_message: "in AD-1 capacity insufficient".to_string(),
            details: snatch_core::SnatchInstanceDetails {
                account_alias: alias.to_string(),
                shape: "VM.Standard.E2.1.Micro".to_string(),
                ocpus: 1.0,
                memory_in_gbs: 1.0,
                os_name: "Canonical Ubuntu".to_string(),
                os_version: "22.04".to_string(),
                ad: Some("AD-1".to_string()),
                boot_volume_size: 50,
                display_name_prefix: "snatch".to_string(),
                min_delay: 30,
                max_delay: 60,
                auto_bind_domain: false,
                domain: None,
                startup_script: None,
                instance_password: None,
            },
        }
    }

    #[tokio::test]
    async fn recovery_mints_new_run_id_and_stays_running() {
        let (_dir, registry) = registry().await;
        let id = registry
            .create(TaskType::Snatch, "snatch", "acct1")
            .await
            .unwrap();
        let progress = sample_progress("acct1");
        registry
            .set_running(&id, Some(TaskResult::Progress(progress)))
            .await
            .unwrap();

        let recovered = registry
            .recover_stuck_snatch_tasks(|alias| alias == "acct1")
            .await
            .unwrap();
        assert_eq!(recovered.len(), 1);
        assert_ne!(recovered[0].1.run_id, "old-run-id");

        let task = registry.get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn recovery_fails_task_when_profile_missing() {
        let (_dir, registry) = registry().await;
        let id = registry
            .create(TaskType::Snatch, "snatch", "acct1")
            .await
            .unwrap();
        let progress = sample_progress("acct1");
        registry
            .set_running(&id, Some(TaskResult::Progress(progress)))
            .await
            .unwrap();

        let recovered = registry
            .recover_stuck_snatch_tasks(|_alias| false)
            .await
            .unwrap();
        assert!(recovered.is_empty());

        let task = registry.get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failure);
    }

    #[tokio::test]
    async fn recovery_fails_task_on_unparseable_result() {
        let (_dir, registry) = registry().await;
        let id = registry
            .create(TaskType::Snatch, "snatch", "acct1")
            .await
            .unwrap();
        registry
            .set_running(&id, Some(TaskResult::Message("not progress json".to_string())))
            .await
            .unwrap();

        let recovered = registry
            .recover_stuck_snatch_tasks(|_alias| true)
            .await
            .unwrap();
        assert!(recovered.is_empty());

        let task = registry.get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failure);
    }

    #[tokio::test]
    async fn list_completed_snatch_respects_limit() {
        let (_dir, registry) = registry().await;
        for _ in 0..3 {
            let id = registry
                .create(TaskType::Snatch, "snatch", "acct1")
                .await
                .unwrap();
            registry.set_success(&id, None).await.unwrap();
        }
        let completed = registry.list_completed_snatch(2).await.unwrap();
        assert_eq!(completed.len(), 2);
    }
}
