//! Task store queries.

use taskforge_core::db::unix_timestamp;

use super::db::{DatabaseError, TaskDatabase};
use super::models::{NewTask, Phase, PlanningStatus, Task, TaskStatus};

fn generate_task_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("task-{}", &suffix[..8])
}

impl TaskDatabase {
    /// Create a task in `planning` / `idle` / `not_started`.
    pub async fn create_task(&self, new: &NewTask) -> Result<Task, DatabaseError> {
        let id = new.id.clone().unwrap_or_else(generate_task_id);
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO tasks (id, title, description, phase, status, planning_status,
                               provider, requires_human_review, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&id)
        .bind(&new.title)
        .bind(&new.description)
        .bind(Phase::Planning.as_str())
        .bind(TaskStatus::Idle.as_str())
        .bind(PlanningStatus::NotStarted.as_str())
        .bind(&new.provider)
        .bind(new.requires_human_review)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_task(&id).await
    }

    /// Get a task by ID.
    pub async fn get_task(&self, id: &str) -> Result<Task, DatabaseError> {
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Task {id}")))
    }

    /// Overwrite every mutable column (last write wins).
    pub async fn save_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            r"
            UPDATE tasks SET
                title = ?, description = ?, phase = ?, status = ?, planning_status = ?,
                provider = ?, working_dir = ?, thread_id = ?, plan = ?, subtasks = ?,
                last_error = ?, requires_human_review = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.phase.as_str())
        .bind(task.status.as_str())
        .bind(task.planning_status.as_str())
        .bind(&task.provider)
        .bind(&task.working_dir)
        .bind(&task.thread_id)
        .bind(&task.plan)
        .bind(&task.subtasks)
        .bind(&task.last_error)
        .bind(task.requires_human_review)
        .bind(now)
        .bind(&task.id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Task {}", task.id)));
        }
        Ok(())
    }

    /// All tasks, oldest first.
    pub async fn list_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
        let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY created_at, id")
            .fetch_all(self.pool())
            .await?;
        Ok(tasks)
    }

    /// Delete a task. Returns `false` when it did not exist.
    pub async fn delete_task(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use taskforge_core::validation::SubtaskSpec;

    async fn db() -> TaskDatabase {
        TaskDatabase::open_in_memory().await.unwrap()
    }

    fn new_task(id: &str) -> NewTask {
        NewTask {
            id: Some(id.to_string()),
            title: "Add rate limiting".into(),
            description: "Limit requests per client".into(),
            ..NewTask::default()
        }
    }

    #[tokio::test]
    async fn create_defaults() {
        let db = db().await;
        let task = db.create_task(&new_task("t1")).await.unwrap();
        assert_eq!(task.phase, Phase::Planning);
        assert_eq!(task.status, TaskStatus::Idle);
        assert_eq!(task.planning_status, PlanningStatus::NotStarted);
        assert!(!task.requires_human_review);

        let generated = db
            .create_task(&NewTask {
                title: "x".into(),
                ..NewTask::default()
            })
            .await
            .unwrap();
        assert!(generated.id.starts_with("task-"));
    }

    #[tokio::test]
    async fn save_overwrites_and_round_trips_subtasks() {
        let db = db().await;
        let mut task = db.create_task(&new_task("t1")).await.unwrap();
        task.phase = Phase::Development;
        task.plan = Some("# Plan".into());
        task.set_subtasks(&[SubtaskSpec {
            id: "1".into(),
            title: "a".into(),
            description: "b".into(),
            depends_on: vec![],
        }])
        .unwrap();
        task.block("agent crashed");
        db.save_task(&task).await.unwrap();

        let loaded = db.get_task("t1").await.unwrap();
        assert_eq!(loaded.phase, Phase::Development);
        assert_eq!(loaded.status, TaskStatus::Blocked);
        assert_eq!(loaded.last_error.as_deref(), Some("agent crashed"));
        assert_eq!(loaded.subtask_specs()[0].title, "a");
    }

    #[tokio::test]
    async fn missing_tasks() {
        let db = db().await;
        assert!(matches!(
            db.get_task("nope").await,
            Err(DatabaseError::NotFound(_))
        ));
        let mut ghost = db.create_task(&new_task("ghost")).await.unwrap();
        assert!(db.delete_task("ghost").await.unwrap());
        assert!(!db.delete_task("ghost").await.unwrap());
        ghost.title = "renamed".into();
        assert!(db.save_task(&ghost).await.is_err());
    }

    #[tokio::test]
    async fn list_is_ordered() {
        let db = db().await;
        db.create_task(&new_task("b")).await.unwrap();
        db.create_task(&new_task("a")).await.unwrap();
        let ids: Vec<String> = db.list_tasks().await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()));
    }
}
