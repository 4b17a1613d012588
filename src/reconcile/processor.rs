use crate::reconcile::error::{EngineError, ExternalError};
use crate::reconcile::executor::SerializedExecutor;
use crate::reconcile::matcher::Matcher;
use crate::reconcile::model::{EngineConfig, JobName, ProcessSummary, ProcessingStatus, RunTrigger};
use crate::reconcile::shutdown::ShutdownSignal;
use crate::storage::entity::return_record;
use crate::storage::repository::{
    ConfigRepository, JobRunEntry, JobRunRepository, RecordRepository, TransitionChanges,
};
use chrono::Utc;
use log::{error, info, warn};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

/// 单条记录的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
enum RecordOutcome {
    Completed,
    Failed,
    Deferred,
    /// claim 时记录已不在预期状态
    LostClaim,
}

/// 匹配 + 执行阶段的结论
enum Step {
    Done(String),
    Defer(&'static str),
    ActionFailed(String),
}

pub struct Processor {
    db: Arc<DatabaseConnection>,
    executor: Arc<SerializedExecutor>,
    matcher: Matcher,
}

impl Processor {
    pub fn new(
        db: Arc<DatabaseConnection>,
        executor: Arc<SerializedExecutor>,
        matcher: Matcher,
    ) -> Self {
        Self {
            db,
            executor,
            matcher,
        }
    }

    /// 处理一批记录。
    ///
    /// 单条记录的错误记在该记录上，不会中断批次；认证错误中止本轮
    /// （`summary.aborted`），当前记录退回 pending（不计重试），其余记录保持原状。
    /// 只有读取配置或选批失败才返回 `Err`。
    pub async fn run(
        &self,
        trigger: RunTrigger,
        shutdown: &ShutdownSignal,
    ) -> Result<ProcessSummary, EngineError> {
        let mut entry = JobRunEntry::new(JobName::Process, trigger, Utc::now().timestamp());
        let mut summary = ProcessSummary::default();

        let result = self.run_batch(&mut summary, shutdown).await;

        entry.finished_at = Utc::now().timestamp();
        entry.success = result.is_ok() && !summary.interrupted && summary.aborted.is_none();
        entry.selected = summary.selected;
        entry.completed = summary.completed;
        entry.failed = summary.failed;
        entry.deferred = summary.deferred;
        entry.error = match &result {
            Err(e) => Some(e.to_string()),
            Ok(()) if summary.aborted.is_some() => summary.aborted.clone(),
            Ok(()) if summary.interrupted => Some("interrupted by shutdown".to_string()),
            Ok(()) => None,
        };
        if let Err(e) = JobRunRepository::record(&self.db, entry).await {
            error!("写入处理审计记录失败: {}", e);
        }

        result.map(|_| summary)
    }

    async fn run_batch(
        &self,
        summary: &mut ProcessSummary,
        shutdown: &ShutdownSignal,
    ) -> Result<(), EngineError> {
        let cfg = ConfigRepository::load_or_init(&self.db).await?;
        let batch = RecordRepository::select_batch(&self.db, &cfg, Utc::now().timestamp()).await?;
        summary.selected = batch.len();
        if batch.is_empty() {
            return Ok(());
        }
        info!("开始处理 {} 条退货记录", batch.len());

        for record in &batch {
            // 记录之间是安全的停止边界
            if shutdown.is_triggered() {
                warn!("处理被停止信号打断，剩余记录留待下次");
                summary.interrupted = true;
                break;
            }

            match self.process_one(&cfg, record).await {
                Ok(RecordOutcome::Completed) => summary.completed += 1,
                Ok(RecordOutcome::Failed) => summary.failed += 1,
                Ok(RecordOutcome::Deferred) => summary.deferred += 1,
                Ok(RecordOutcome::LostClaim) => summary.lost_claims += 1,
                Err(e @ EngineError::Executor(ExternalError::Unauthorized(_))) => {
                    error!("✗ 执行器认证失败，中止本轮处理: {}", e);
                    summary.aborted = Some(e.to_string());
                    return Ok(());
                }
                Err(e) => {
                    // claim 之前或标记失败时出错：记录保持库中原状，继续下一条
                    error!(
                        "✗ 无法更新记录状态 [{}]: {}",
                        record.external_receipt_id, e
                    );
                }
            }
        }

        info!(
            "✓ 处理完成: 选中 {}, 完成 {}, 失败 {}, 延后 {}",
            summary.selected, summary.completed, summary.failed, summary.deferred
        );
        Ok(())
    }

    async fn process_one(
        &self,
        cfg: &EngineConfig,
        record: &return_record::Model,
    ) -> Result<RecordOutcome, EngineError> {
        // 先落 processing，崩溃时记录可见而非悄悄回到 pending
        if !RecordRepository::claim(&self.db, record, cfg.max_retry_count).await? {
            warn!("记录状态已变化，跳过 [{}]", record.external_receipt_id);
            return Ok(RecordOutcome::LostClaim);
        }

        match self.settle(cfg, record).await {
            Err(e @ EngineError::Executor(ExternalError::Unauthorized(_))) => Err(e),
            Err(e) => {
                // 记录已由本轮持有：意外错误记在该记录上
                error!("✗ 处理记录出错 [{}]: {}", record.external_receipt_id, e);
                self.mark_failed(cfg, record, &e.to_string()).await
            }
            ok => ok,
        }
    }

    /// 已 claim 的记录：匹配、执行并写回结果
    async fn settle(
        &self,
        cfg: &EngineConfig,
        record: &return_record::Model,
    ) -> Result<RecordOutcome, EngineError> {
        match self.reconcile(record).await {
            Ok(Step::Done(handle)) => {
                let changes = TransitionChanges {
                    processed_at: Some(Utc::now().timestamp()),
                    matched_handle: Some(handle),
                    ..Default::default()
                };
                let applied = RecordRepository::transition(
                    self.db.as_ref(),
                    record,
                    ProcessingStatus::Processing,
                    ProcessingStatus::Completed,
                    changes,
                )
                .await?;
                if !applied {
                    return Ok(lost(record, ProcessingStatus::Completed));
                }
                info!("✓ 退货处理完成 [{}]", record.external_receipt_id);
                Ok(RecordOutcome::Completed)
            }
            Ok(Step::Defer(reason)) => {
                if !self.defer(record).await? {
                    return Ok(lost(record, ProcessingStatus::Pending));
                }
                info!("… 暂缓 [{}]: {}", record.external_receipt_id, reason);
                Ok(RecordOutcome::Deferred)
            }
            Ok(Step::ActionFailed(message)) => self.mark_failed(cfg, record, &message).await,
            Err(e) if e.is_retryable() => self.mark_failed(cfg, record, &e.to_string()).await,
            Err(e) => {
                // 凭证问题不是记录本身的错，不消耗重试次数
                if !self.defer(record).await? {
                    warn!("认证失败时记录已不在 processing [{}]", record.external_receipt_id);
                }
                Err(EngineError::Executor(e))
            }
        }
    }

    async fn reconcile(&self, record: &return_record::Model) -> Result<Step, ExternalError> {
        let session = self.executor.session().await;

        let candidates = session.search(&record.product_name).await?;
        let result = self.matcher.match_record(record, &candidates);
        if result.ambiguous {
            return Ok(Step::Defer("多个候选并列最高分"));
        }
        let Some(candidate) = result.matched else {
            return Ok(Step::Defer("暂无匹配候选"));
        };

        let outcome = session.act(&candidate.handle, record).await?;
        if outcome.success {
            Ok(Step::Done(candidate.handle))
        } else {
            Ok(Step::ActionFailed(format!(
                "action rejected: {}",
                outcome.error_code.unwrap_or_else(|| "unknown".to_string())
            )))
        }
    }

    async fn defer(&self, record: &return_record::Model) -> Result<bool, EngineError> {
        RecordRepository::transition(
            self.db.as_ref(),
            record,
            ProcessingStatus::Processing,
            ProcessingStatus::Pending,
            TransitionChanges::default(),
        )
        .await
    }

    async fn mark_failed(
        &self,
        cfg: &EngineConfig,
        record: &return_record::Model,
        message: &str,
    ) -> Result<RecordOutcome, EngineError> {
        let changes = TransitionChanges {
            increment_retry: true,
            last_error: Some(message.to_string()),
            ..Default::default()
        };
        let applied = RecordRepository::transition(
            self.db.as_ref(),
            record,
            ProcessingStatus::Processing,
            ProcessingStatus::Failed,
            changes,
        )
        .await?;
        if !applied {
            return Ok(lost(record, ProcessingStatus::Failed));
        }

        let retry_count = RecordRepository::find_by_id(&self.db, record.id)
            .await?
            .map(|r| r.retry_count)
            .unwrap_or(record.retry_count + 1);
        let terminal = retry_count >= cfg.max_retry_count as i32;
        if terminal {
            error!(
                "✗ 重试耗尽，需人工处理 [{}] ({}/{}): {}",
                record.external_receipt_id, retry_count, cfg.max_retry_count, message
            );
        } else {
            warn!(
                "⚠ 处理失败，稍后重试 [{}] ({}/{}): {}",
                record.external_receipt_id, retry_count, cfg.max_retry_count, message
            );
        }
        Ok(RecordOutcome::Failed)
    }
}

/// 写回时记录已被其他写入者改动（如人工 recover），本轮结果作废
fn lost(record: &return_record::Model, to: ProcessingStatus) -> RecordOutcome {
    warn!(
        "⚠ 记录已不在 processing，未写入 {} [{}]",
        to, record.external_receipt_id
    );
    RecordOutcome::LostClaim
}
