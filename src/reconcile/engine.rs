use crate::reconcile::collector::{Collector, CollectorSettings};
use crate::reconcile::error::EngineError;
use crate::reconcile::executor::SerializedExecutor;
use crate::reconcile::matcher::Matcher;
use crate::reconcile::model::{
    CollectSummary, ConfigPatch, EngineConfig, JobName, ProcessSummary, ReconcileStats,
};
use crate::reconcile::processor::Processor;
use crate::reconcile::scheduler::{JobRun, Scheduler, SchedulerSettings};
use crate::reconcile::traits::{ActionExecutor, SourceClient};
use crate::settings::EngineSettings;
use crate::storage::entity::{job_run, return_record};
use crate::storage::repository::{ConfigRepository, JobRunRepository, RecordRepository};
use chrono::{DateTime, Utc};
use log::{info, warn};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;

/// 一个商户账号对应一个引擎实例；同一进程里可以并存多个实例
pub struct ReconcileEngine {
    db: Arc<DatabaseConnection>,
    executor: Arc<SerializedExecutor>,
    scheduler: Scheduler,
}

impl ReconcileEngine {
    pub fn new(
        db: Arc<DatabaseConnection>,
        source: Arc<dyn SourceClient>,
        executor: Arc<dyn ActionExecutor>,
        settings: &EngineSettings,
    ) -> Self {
        let executor = Arc::new(SerializedExecutor::new(executor, settings.call_timeout));
        let collector = Arc::new(Collector::new(
            db.clone(),
            source,
            CollectorSettings {
                overlap: settings.collect_overlap,
                initial_lookback: settings.initial_lookback,
                call_timeout: settings.call_timeout,
            },
        ));
        let processor = Arc::new(Processor::new(db.clone(), executor.clone(), Matcher::default()));
        let scheduler = Scheduler::new(
            db.clone(),
            collector,
            processor,
            SchedulerSettings {
                shutdown_timeout: settings.shutdown_timeout,
                tick_jitter: settings.tick_jitter,
            },
        );
        Self {
            db,
            executor,
            scheduler,
        }
    }

    /// 初始化配置、打开执行器会话并启动调度
    pub async fn start(&self) -> Result<EngineConfig, EngineError> {
        let cfg = ConfigRepository::load_or_init(&self.db).await?;
        if let Err(e) = self.executor.open().await {
            // 会话由执行器自行恢复，这里只记录
            warn!("⚠ 打开执行器会话失败: {}", e);
        }
        self.scheduler.start();
        info!(
            "✓ 引擎已启动 (enabled={}, 采集间隔 {:?}, 处理间隔 {:?})",
            cfg.enabled, cfg.fetch_interval, cfg.process_interval
        );
        Ok(cfg)
    }

    /// 停止调度并关闭执行器会话，返回是否干净停止
    pub async fn stop(&self) -> bool {
        let clean = self.scheduler.stop().await;
        if let Err(e) = self.executor.close().await {
            warn!("⚠ 关闭执行器会话失败: {}", e);
        }
        clean
    }

    pub fn trigger(&self, job: JobName) -> bool {
        self.scheduler.trigger(job)
    }

    pub fn job_runs(&self) -> Vec<JobRun> {
        self.scheduler.job_runs()
    }

    pub async fn collect(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<CollectSummary, EngineError> {
        self.scheduler.collect_window(start, end).await
    }

    pub async fn process_once(&self) -> Result<ProcessSummary, EngineError> {
        self.scheduler.process_now().await
    }

    pub async fn config(&self) -> Result<EngineConfig, EngineError> {
        ConfigRepository::load_or_init(&self.db).await
    }

    pub async fn update_config(&self, patch: &ConfigPatch) -> Result<EngineConfig, EngineError> {
        let cfg = ConfigRepository::update(&self.db, patch).await?;
        info!("✓ 配置已更新: {:?}", cfg);
        Ok(cfg)
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<EngineConfig, EngineError> {
        self.update_config(&ConfigPatch {
            enabled: Some(enabled),
            ..Default::default()
        })
        .await
    }

    pub async fn stats(&self) -> Result<ReconcileStats, EngineError> {
        let cfg = self.config().await?;
        Ok(RecordRepository::get_stats(&self.db, cfg.max_retry_count).await?)
    }

    pub async fn list_terminal_failures(&self) -> Result<Vec<return_record::Model>, EngineError> {
        let cfg = self.config().await?;
        Ok(RecordRepository::list_terminal_failures(&self.db, cfg.max_retry_count).await?)
    }

    pub async fn list_stuck(
        &self,
        older_than: Duration,
    ) -> Result<Vec<return_record::Model>, EngineError> {
        Ok(
            RecordRepository::list_stuck_processing(&self.db, older_than, Utc::now().timestamp())
                .await?,
        )
    }

    /// 人工恢复卡在 processing 的记录。处理任务运行中时拒绝，避免把正在处理的记录放回去
    pub async fn release_stuck(&self, older_than: Duration) -> Result<u64, EngineError> {
        if self.scheduler.is_running(JobName::Process) {
            return Err(EngineError::Busy(JobName::Process));
        }
        let released =
            RecordRepository::release_stuck(&self.db, older_than, Utc::now().timestamp()).await?;
        if released > 0 {
            info!("✓ 已恢复 {} 条卡住的记录", released);
        }
        Ok(released)
    }

    pub async fn requeue(&self, receipt_id: &str) -> Result<return_record::Model, EngineError> {
        let record = RecordRepository::requeue(&self.db, receipt_id).await?;
        info!("✓ 已重新入队 [{}]", receipt_id);
        Ok(record)
    }

    pub async fn recent_runs(&self, limit: u64) -> Result<Vec<job_run::Model>, EngineError> {
        Ok(JobRunRepository::recent(&self.db, limit).await?)
    }
}
