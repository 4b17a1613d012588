use crate::reconcile::model::{JobName, RunTrigger};
use crate::storage::entity::job_run::{
    self, ActiveModel as JobRunActiveModel, Entity as JobRunLog, Model as JobRunModel,
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};

/// 一次任务运行的审计条目（只写）
#[derive(Debug, Clone)]
pub struct JobRunEntry {
    pub job: JobName,
    pub trigger: RunTrigger,
    pub started_at: i64,
    pub finished_at: i64,
    pub success: bool,
    pub window: Option<(i64, i64)>,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub malformed: usize,
    pub selected: usize,
    pub completed: usize,
    pub failed: usize,
    pub deferred: usize,
    pub error: Option<String>,
}

impl JobRunEntry {
    pub fn new(job: JobName, trigger: RunTrigger, started_at: i64) -> Self {
        Self {
            job,
            trigger,
            started_at,
            finished_at: started_at,
            success: false,
            window: None,
            fetched: 0,
            created: 0,
            updated: 0,
            malformed: 0,
            selected: 0,
            completed: 0,
            failed: 0,
            deferred: 0,
            error: None,
        }
    }
}

pub struct JobRunRepository;

impl JobRunRepository {
    pub async fn record(db: &DatabaseConnection, entry: JobRunEntry) -> Result<i32, DbErr> {
        let active_model = JobRunActiveModel {
            job_name: Set(entry.job.as_str().to_string()),
            trigger: Set(entry.trigger.as_str().to_string()),
            started_at: Set(entry.started_at),
            finished_at: Set(entry.finished_at),
            success: Set(entry.success),
            window_start: Set(entry.window.map(|w| w.0)),
            window_end: Set(entry.window.map(|w| w.1)),
            fetched: Set(entry.fetched as i32),
            created: Set(entry.created as i32),
            updated: Set(entry.updated as i32),
            malformed: Set(entry.malformed as i32),
            selected: Set(entry.selected as i32),
            completed: Set(entry.completed as i32),
            failed: Set(entry.failed as i32),
            deferred: Set(entry.deferred as i32),
            error: Set(entry.error),
            ..Default::default()
        };
        let result = active_model.insert(db).await?;
        Ok(result.id)
    }

    /// 采集游标：最近一次成功采集的窗口终点
    pub async fn last_successful_window_end(
        db: &DatabaseConnection,
        job: JobName,
    ) -> Result<Option<i64>, DbErr> {
        let row = JobRunLog::find()
            .filter(job_run::Column::JobName.eq(job.as_str()))
            .filter(job_run::Column::Success.eq(true))
            .filter(job_run::Column::WindowEnd.is_not_null())
            .order_by_desc(job_run::Column::WindowEnd)
            .one(db)
            .await?;
        Ok(row.and_then(|r| r.window_end))
    }

    pub async fn recent(db: &DatabaseConnection, limit: u64) -> Result<Vec<JobRunModel>, DbErr> {
        JobRunLog::find()
            .order_by_desc(job_run::Column::Id)
            .limit(limit)
            .all(db)
            .await
    }
}
