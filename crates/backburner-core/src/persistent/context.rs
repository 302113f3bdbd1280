//! Scoped status-transition guard around one persisted task's execution.

use std::future::Future;

use serde_json::Value;

use super::entity::{TaskDb, TaskEntity, TaskStatus};
use crate::error::Result;

/// Keeps a persisted task's status consistent across its execution.
///
/// Entering sets RUNNING; leaving sets FAILED (recording the first error
/// cause into the task's params) or, on success, WAITING for re-armable
/// tasks and COMPLETED for one-shot ones. The guard persists on both
/// paths and never swallows the execution error.
///
/// This is an explicit `execute` wrapper rather than a drop guard because
/// the exit transition itself writes to the database and must be able to
/// report failures.
pub struct TaskExecutionContext<'a> {
    db: &'a TaskDb,
    entity: TaskEntity,
}

impl<'a> TaskExecutionContext<'a> {
    pub fn new(db: &'a TaskDb, entity: TaskEntity) -> Self {
        Self { db, entity }
    }

    pub async fn execute<F, Fut>(mut self, work: F) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        self.enter()?;
        let result = work().await;
        self.exit(result)
    }

    fn enter(&mut self) -> Result<()> {
        if !self.entity.transition_to(TaskStatus::Running) {
            tracing::warn!(tid = %self.entity.tid, status = ?self.entity.status, "forcing RUNNING from an unexpected status");
            self.entity.status = TaskStatus::Running;
        }
        self.entity.time_started = self.db.now_secs();

        if let Err(err) = self.db.save(&mut self.entity) {
            self.entity.transition_to(TaskStatus::Failed);
            if let Err(save_err) = self.db.save(&mut self.entity) {
                tracing::warn!(tid = %self.entity.tid, %save_err, "failed to persist FAILED status");
            }
            return Err(err);
        }
        Ok(())
    }

    fn exit(mut self, result: Result<Value>) -> Result<Value> {
        // the hook may have touched its own row; prefer the fresh state
        if let Ok(Some(fresh)) = self.db.load_id(&self.entity.id) {
            self.entity = fresh;
        }

        match &result {
            Err(err) => {
                self.entity.record_error(&err.to_string());
                if !self.entity.transition_to(TaskStatus::Failed) {
                    // the hook settled its own row; keep that status
                    tracing::debug!(tid = %self.entity.tid, status = ?self.entity.status, "not marking FAILED over a settled status");
                }
            }
            Ok(_) => {
                if self.entity.status == TaskStatus::Running {
                    let next = if self.entity.is_timeout_set() {
                        TaskStatus::Waiting
                    } else {
                        TaskStatus::Completed
                    };
                    self.entity.transition_to(next);
                }
            }
        }

        match self.db.save(&mut self.entity) {
            Ok(()) => result,
            Err(save_err) => match result {
                // never mask the execution error with the save error
                Err(err) => {
                    tracing::warn!(tid = %self.entity.tid, %save_err, "failed to persist FAILED status");
                    Err(err)
                }
                Ok(_) => Err(save_err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::Config;
    use crate::error::TaskError;
    use crate::hook::{ERROR_KEY, Params, TIMEOUT_KEY};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    fn db() -> TaskDb {
        TaskDb::open_in_memory(
            Config::default(),
            Arc::new(ManualClock::new(Utc::now())) as Arc<dyn Clock>,
        )
        .unwrap()
    }

    fn saved_entity(db: &TaskDb, params: Params) -> TaskEntity {
        let mut entity = TaskEntity::new("job-1", "demo.hook", params);
        entity.time_scheduled = db.now_secs();
        db.save(&mut entity).unwrap();
        entity
    }

    #[tokio::test]
    async fn success_marks_one_shot_completed() {
        let db = db();
        let entity = saved_entity(&db, Params::new());

        let value = TaskExecutionContext::new(&db, entity)
            .execute(|| async { Ok(json!("done")) })
            .await
            .unwrap();
        assert_eq!(value, json!("done"));

        let entity = db.load_id(&db.load_tid("job-1").unwrap().unwrap().id).unwrap().unwrap();
        assert_eq!(entity.status, TaskStatus::Completed);
        assert!(entity.time_started > 0);
    }

    #[tokio::test]
    async fn success_rearms_timed_task_to_waiting() {
        let db = db();
        let mut params = Params::new();
        params.insert(TIMEOUT_KEY.to_string(), json!(30));
        let mut entity = saved_entity(&db, params);
        entity.timeout = db.now_secs() + 30;
        db.save(&mut entity).unwrap();

        TaskExecutionContext::new(&db, entity)
            .execute(|| async { Ok(json!(null)) })
            .await
            .unwrap();

        let entity = db.load_tid("job-1").unwrap().unwrap();
        assert_eq!(entity.status, TaskStatus::Waiting);
    }

    #[tokio::test]
    async fn failure_keeps_a_status_the_hook_already_settled() {
        let db = db();
        let entity = saved_entity(&db, Params::new());
        let id = entity.id.clone();

        let db_ref = &db;
        let row_id = id.clone();
        let err = TaskExecutionContext::new(&db, entity)
            .execute(|| async move {
                // the hook marks its own row done before failing
                let mut fresh = db_ref.load_id(&row_id).unwrap().unwrap();
                fresh.status = TaskStatus::Completed;
                db_ref.save(&mut fresh).unwrap();
                Err(TaskError::HookFailed("late failure".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::HookFailed(_)));

        let fresh = db.load_id(&id).unwrap().unwrap();
        assert_eq!(fresh.status, TaskStatus::Completed);
        let error = fresh.params.get(ERROR_KEY).unwrap();
        assert!(error["trace"].as_str().unwrap().contains("late failure"));
    }

    #[tokio::test]
    async fn failure_marks_failed_and_records_first_cause() {
        let db = db();
        let entity = saved_entity(&db, Params::new());

        let err = TaskExecutionContext::new(&db, entity)
            .execute(|| async { Err(TaskError::HookFailed("boom".to_string())) })
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::HookFailed(_)));

        let entity = db.load_tid("job-1").unwrap().unwrap();
        assert_eq!(entity.status, TaskStatus::Failed);
        let error = entity.params.get(ERROR_KEY).unwrap();
        assert_eq!(error["type"], json!("exception"));
        assert!(error["trace"].as_str().unwrap().contains("boom"));
    }
}
