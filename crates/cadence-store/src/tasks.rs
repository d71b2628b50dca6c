use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;
use tokio::sync::RwLock;

use cadence_types::{Task, TaskDraft, TaskStatus};

const TASKS_FILE: &str = "tasks.json";

/// Rejected status transition. `start` is idempotent for `in_progress`
/// tasks; everything else must follow `pending -> in_progress -> {done,
/// failed}`.
#[derive(Debug, Clone)]
pub struct TaskTransitionError {
    pub task_id: String,
    pub from: Option<TaskStatus>,
    pub action: &'static str,
}

impl std::fmt::Display for TaskTransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.from {
            Some(from) => write!(
                f,
                "cannot {} task {}: status is {from}",
                self.action, self.task_id
            ),
            None => write!(f, "cannot {} task {}: not found", self.action, self.task_id),
        }
    }
}

impl std::error::Error for TaskTransitionError {}

pub struct TaskStore {
    base: PathBuf,
    tasks: RwLock<HashMap<String, Task>>,
}

impl TaskStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let tasks = crate::load_map(&base.join(TASKS_FILE)).await?;
        Ok(Self {
            base,
            tasks: RwLock::new(tasks),
        })
    }

    /// Appends the drafts after the session's existing tasks, preserving
    /// draft order.
    pub async fn create_many(
        &self,
        session_id: &str,
        drafts: Vec<TaskDraft>,
    ) -> anyhow::Result<Vec<Task>> {
        let created = {
            let mut tasks = self.tasks.write().await;
            let next_order = tasks
                .values()
                .filter(|t| t.session_id == session_id)
                .map(|t| t.order + 1)
                .max()
                .unwrap_or(0);
            let created = drafts
                .into_iter()
                .enumerate()
                .map(|(offset, draft)| {
                    Task::new(
                        session_id,
                        &draft.title,
                        draft.description,
                        next_order + offset as u32,
                    )
                })
                .collect::<Vec<_>>();
            for task in &created {
                tasks.insert(task.id.clone(), task.clone());
            }
            created
        };
        self.flush().await?;
        Ok(created)
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.tasks.read().await.get(id).cloned()
    }

    pub async fn list_for_session(&self, session_id: &str) -> Vec<Task> {
        let mut out = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|t| t.order);
        out
    }

    /// Tasks a fresh or resumed run still has to execute, in plan order.
    /// Interrupted `in_progress` tasks are picked up again alongside the
    /// pending ones.
    pub async fn get_resumable(&self, session_id: &str) -> Vec<Task> {
        let mut out = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| {
                t.session_id == session_id
                    && matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress)
            })
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|t| t.order);
        out
    }

    /// Marks a task `in_progress`. Starting a task that is already
    /// `in_progress` is a no-op so interrupted runs can resume it.
    pub async fn start(&self, id: &str) -> Result<Task, TaskTransitionError> {
        let task = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(id) else {
                return Err(TaskTransitionError {
                    task_id: id.to_string(),
                    from: None,
                    action: "start",
                });
            };
            match task.status {
                TaskStatus::Pending => {
                    task.status = TaskStatus::InProgress;
                    task.updated_at = Utc::now();
                }
                TaskStatus::InProgress => {}
                from @ (TaskStatus::Done | TaskStatus::Failed) => {
                    return Err(TaskTransitionError {
                        task_id: id.to_string(),
                        from: Some(from),
                        action: "start",
                    });
                }
            }
            task.clone()
        };
        if let Err(err) = self.flush().await {
            tracing::warn!(error = %err, "task store flush failed after start");
        }
        Ok(task)
    }

    pub async fn complete(&self, id: &str, result: String) -> Result<Task, TaskTransitionError> {
        self.finish(id, TaskStatus::Done, result, "complete").await
    }

    pub async fn fail(&self, id: &str, error: String) -> Result<Task, TaskTransitionError> {
        self.finish(id, TaskStatus::Failed, error, "fail").await
    }

    async fn finish(
        &self,
        id: &str,
        to: TaskStatus,
        result: String,
        action: &'static str,
    ) -> Result<Task, TaskTransitionError> {
        let task = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(id) else {
                return Err(TaskTransitionError {
                    task_id: id.to_string(),
                    from: None,
                    action,
                });
            };
            if task.status != TaskStatus::InProgress {
                return Err(TaskTransitionError {
                    task_id: id.to_string(),
                    from: Some(task.status),
                    action,
                });
            }
            task.status = to;
            task.result = Some(result);
            task.updated_at = Utc::now();
            task.clone()
        };
        if let Err(err) = self.flush().await {
            tracing::warn!(error = %err, "task store flush failed after {action}");
        }
        Ok(task)
    }

    pub async fn delete_for_session(&self, session_id: &str) -> anyhow::Result<usize> {
        let removed = {
            let mut tasks = self.tasks.write().await;
            let before = tasks.len();
            tasks.retain(|_, t| t.session_id != session_id);
            before - tasks.len()
        };
        if removed > 0 {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let snapshot = self.tasks.read().await.clone();
        crate::write_map(&self.base.join(TASKS_FILE), &snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_base(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("cadence-store-{tag}-{}", Uuid::new_v4()))
    }

    fn drafts(titles: &[&str]) -> Vec<TaskDraft> {
        titles
            .iter()
            .map(|t| TaskDraft {
                title: t.to_string(),
                description: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn create_many_preserves_order_across_batches() {
        let store = TaskStore::new(temp_base("tasks-order")).await.expect("store");
        store
            .create_many("s1", drafts(&["a", "b"]))
            .await
            .expect("first batch");
        store
            .create_many("s1", drafts(&["c"]))
            .await
            .expect("second batch");

        let listed = store.list_for_session("s1").await;
        let titles = listed.iter().map(|t| t.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["a", "b", "c"]);
        assert_eq!(listed[2].order, 2);
    }

    #[tokio::test]
    async fn start_is_idempotent_for_in_progress_tasks() {
        let store = TaskStore::new(temp_base("tasks-start")).await.expect("store");
        let created = store
            .create_many("s1", drafts(&["a"]))
            .await
            .expect("create");
        let id = created[0].id.clone();

        let started = store.start(&id).await.expect("start");
        assert_eq!(started.status, TaskStatus::InProgress);
        let again = store.start(&id).await.expect("start again");
        assert_eq!(again.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn start_rejects_terminal_tasks() {
        let store = TaskStore::new(temp_base("tasks-terminal"))
            .await
            .expect("store");
        let created = store
            .create_many("s1", drafts(&["a"]))
            .await
            .expect("create");
        let id = created[0].id.clone();

        store.start(&id).await.expect("start");
        store.complete(&id, "done".to_string()).await.expect("complete");

        let err = store.start(&id).await.expect_err("restart");
        assert_eq!(err.from, Some(TaskStatus::Done));
        assert!(err.to_string().contains("cannot start"));
    }

    #[tokio::test]
    async fn complete_requires_in_progress() {
        let store = TaskStore::new(temp_base("tasks-complete"))
            .await
            .expect("store");
        let created = store
            .create_many("s1", drafts(&["a"]))
            .await
            .expect("create");
        let id = created[0].id.clone();

        let err = store
            .complete(&id, "early".to_string())
            .await
            .expect_err("complete pending");
        assert_eq!(err.from, Some(TaskStatus::Pending));

        store.start(&id).await.expect("start");
        let done = store.complete(&id, "ok".to_string()).await.expect("complete");
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.result.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn resumable_includes_interrupted_tasks_in_plan_order() {
        let store = TaskStore::new(temp_base("tasks-resume"))
            .await
            .expect("store");
        let created = store
            .create_many("s1", drafts(&["a", "b", "c"]))
            .await
            .expect("create");

        store.start(&created[0].id).await.expect("start a");
        store
            .complete(&created[0].id, "done".to_string())
            .await
            .expect("complete a");
        store.start(&created[1].id).await.expect("start b");

        let resumable = store.get_resumable("s1").await;
        let titles = resumable.iter().map(|t| t.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["b", "c"]);
        assert_eq!(resumable[0].status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn fail_records_the_error_as_result() {
        let store = TaskStore::new(temp_base("tasks-fail")).await.expect("store");
        let created = store
            .create_many("s1", drafts(&["a"]))
            .await
            .expect("create");
        let id = created[0].id.clone();

        store.start(&id).await.expect("start");
        let failed = store
            .fail(&id, "provider timeout".to_string())
            .await
            .expect("fail");
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.result.as_deref(), Some("provider timeout"));
    }
}
