use crate::reconcile::error::EngineError;
use crate::reconcile::model::{EngineConfig, ProcessingStatus, ReconcileStats};
use crate::reconcile::traits::ExternalRecord;
use crate::storage::entity::return_record::{
    self, ActiveModel as ReturnRecordActiveModel, Entity as ReturnRecord,
    Model as ReturnRecordModel,
};
use chrono::Utc;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait, UpdateMany,
};
use std::time::Duration;

/// 采集侧 upsert 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    /// 首次出现即为排除状态，直接以 skipped 入库
    CreatedSkipped,
    Updated,
    /// pending 记录刷新后变为排除状态
    BecameSkipped,
    /// 记录已被处理器接管，描述字段不再刷新
    Unchanged,
}

/// 状态迁移时附带写入的引擎字段
#[derive(Debug, Clone, Default)]
pub struct TransitionChanges {
    pub increment_retry: bool,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<i64>,
    pub processed_at: Option<i64>,
    pub matched_handle: Option<String>,
    /// 仅当 retry_count < 该值时才允许迁移
    pub retry_below: Option<i32>,
}

pub struct RecordRepository;

impl RecordRepository {
    pub async fn find_by_receipt_id<C: ConnectionTrait>(
        db: &C,
        receipt_id: &str,
    ) -> Result<Option<ReturnRecordModel>, DbErr> {
        ReturnRecord::find()
            .filter(return_record::Column::ExternalReceiptId.eq(receipt_id.to_string()))
            .one(db)
            .await
    }

    #[cfg(test)]
    pub async fn count_all(db: &DatabaseConnection) -> Result<u64, DbErr> {
        ReturnRecord::find().count(db).await
    }

    /// 按 external_receipt_id 去重写入。
    ///
    /// 已存在的记录只刷新描述字段与来源状态，且仅在 pending/skipped 时写入；
    /// 处理器接管后的记录保持不动。插入时的主键冲突按 upsert 处理，不向上抛错。
    pub async fn upsert_from_source(
        db: &DatabaseConnection,
        rec: &ExternalRecord,
        excluded: bool,
    ) -> Result<UpsertOutcome, DbErr> {
        let now = Utc::now().timestamp();

        if Self::find_by_receipt_id(db, &rec.external_receipt_id)
            .await?
            .is_none()
        {
            let status = if excluded {
                ProcessingStatus::Skipped
            } else {
                ProcessingStatus::Pending
            };
            let active_model = ReturnRecordActiveModel {
                external_receipt_id: Set(rec.external_receipt_id.clone()),
                external_order_id: Set(rec.external_order_id.clone()),
                product_name: Set(rec.product_name.clone()),
                receiver_name: Set(rec.receiver_name.clone()),
                receiver_phone: Set(rec.receiver_phone.clone()),
                source_status: Set(rec.source_status.clone()),
                source_created_at: Set(rec
                    .source_created_at
                    .map(|t| t.timestamp())
                    .unwrap_or(now)),
                source_updated_at: Set(rec.source_updated_at.map(|t| t.timestamp())),
                processing_status: Set(status.as_str().to_string()),
                retry_count: Set(0),
                last_error: Set(None),
                last_attempt_at: Set(None),
                processed_at: Set(None),
                matched_handle: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            };

            let inserted = ReturnRecord::insert(active_model)
                .on_conflict(
                    OnConflict::column(return_record::Column::ExternalReceiptId)
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(db)
                .await?;
            if inserted > 0 {
                return Ok(if excluded {
                    UpsertOutcome::CreatedSkipped
                } else {
                    UpsertOutcome::Created
                });
            }
            // 并发插入抢先一步，按已存在处理
        }

        if excluded {
            let res = Self::refresh_query(rec, now)
                .col_expr(
                    return_record::Column::ProcessingStatus,
                    Expr::value(ProcessingStatus::Skipped.as_str()),
                )
                .filter(return_record::Column::ExternalReceiptId.eq(rec.external_receipt_id.clone()))
                .filter(return_record::Column::ProcessingStatus.eq(ProcessingStatus::Pending.as_str()))
                .exec(db)
                .await?;
            if res.rows_affected > 0 {
                return Ok(UpsertOutcome::BecameSkipped);
            }
        }

        let res = Self::refresh_query(rec, now)
            .filter(return_record::Column::ExternalReceiptId.eq(rec.external_receipt_id.clone()))
            .filter(return_record::Column::ProcessingStatus.is_in([
                ProcessingStatus::Pending.as_str(),
                ProcessingStatus::Skipped.as_str(),
            ]))
            .exec(db)
            .await?;

        Ok(if res.rows_affected > 0 {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Unchanged
        })
    }

    fn refresh_query(rec: &ExternalRecord, now: i64) -> UpdateMany<ReturnRecord> {
        let mut q = ReturnRecord::update_many()
            .col_expr(
                return_record::Column::ExternalOrderId,
                Expr::value(rec.external_order_id.clone()),
            )
            .col_expr(
                return_record::Column::ProductName,
                Expr::value(rec.product_name.clone()),
            )
            .col_expr(
                return_record::Column::ReceiverName,
                Expr::value(rec.receiver_name.clone()),
            )
            .col_expr(
                return_record::Column::ReceiverPhone,
                Expr::value(rec.receiver_phone.clone()),
            )
            .col_expr(
                return_record::Column::SourceStatus,
                Expr::value(rec.source_status.clone()),
            )
            .col_expr(return_record::Column::UpdatedAt, Expr::value(now));
        if let Some(t) = rec.source_updated_at {
            q = q.col_expr(
                return_record::Column::SourceUpdatedAt,
                Expr::value(Some(t.timestamp())),
            );
        }
        q
    }

    /// 选取本轮要处理的记录：
    /// - pending 且来源状态可处理，按来源时间升序
    /// - 剩余名额给 failed 且未耗尽重试、距上次尝试已超过 retry_delay 的记录
    pub async fn select_batch(
        db: &DatabaseConnection,
        cfg: &EngineConfig,
        now: i64,
    ) -> Result<Vec<ReturnRecordModel>, DbErr> {
        let limit = cfg.process_batch_size as u64;

        let mut pending = ReturnRecord::find().filter(
            return_record::Column::ProcessingStatus.eq(ProcessingStatus::Pending.as_str()),
        );
        if !cfg.auto_process_statuses.is_empty() {
            pending = pending.filter(
                return_record::Column::SourceStatus
                    .is_in(cfg.auto_process_statuses.iter().cloned()),
            );
        }
        if !cfg.exclude_statuses.is_empty() {
            pending = pending.filter(
                return_record::Column::SourceStatus.is_not_in(cfg.exclude_statuses.iter().cloned()),
            );
        }
        let mut batch = pending
            .order_by_asc(return_record::Column::SourceCreatedAt)
            .order_by_asc(return_record::Column::Id)
            .limit(limit)
            .all(db)
            .await?;

        let remaining = limit.saturating_sub(batch.len() as u64);
        if remaining > 0 {
            let cutoff = now - cfg.retry_delay.as_secs() as i64;
            let mut retries = ReturnRecord::find()
                .filter(return_record::Column::ProcessingStatus.eq(ProcessingStatus::Failed.as_str()))
                .filter(return_record::Column::RetryCount.lt(cfg.max_retry_count as i32))
                .filter(
                    Condition::any()
                        .add(return_record::Column::LastAttemptAt.is_null())
                        .add(return_record::Column::LastAttemptAt.lte(cutoff)),
                );
            if !cfg.exclude_statuses.is_empty() {
                retries = retries.filter(
                    return_record::Column::SourceStatus
                        .is_not_in(cfg.exclude_statuses.iter().cloned()),
                );
            }
            let retries = retries
                .order_by_asc(return_record::Column::LastAttemptAt)
                .order_by_asc(return_record::Column::Id)
                .limit(remaining)
                .all(db)
                .await?;
            batch.extend(retries);
        }

        Ok(batch)
    }

    pub fn status_of(record: &ReturnRecordModel) -> Result<ProcessingStatus, EngineError> {
        record.processing_status.parse().map_err(|e: String| {
            EngineError::Db(DbErr::Custom(format!(
                "{}: {}",
                record.external_receipt_id, e
            )))
        })
    }

    /// 按状态机做条件更新（compare-and-set）。
    ///
    /// 返回 `Ok(false)` 表示记录已不在 `from` 状态（被其他写入者抢先）；
    /// 状态机不允许的迁移直接返回 `InvalidTransition`，不触达数据库。
    pub async fn transition<C: ConnectionTrait>(
        db: &C,
        record: &ReturnRecordModel,
        from: ProcessingStatus,
        to: ProcessingStatus,
        changes: TransitionChanges,
    ) -> Result<bool, EngineError> {
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                receipt_id: record.external_receipt_id.clone(),
                from,
                to,
            });
        }

        let now = Utc::now().timestamp();
        let mut q = ReturnRecord::update_many()
            .col_expr(return_record::Column::ProcessingStatus, Expr::value(to.as_str()))
            .col_expr(return_record::Column::UpdatedAt, Expr::value(now));
        if changes.increment_retry {
            q = q.col_expr(
                return_record::Column::RetryCount,
                Expr::col(return_record::Column::RetryCount).add(1),
            );
        }
        if let Some(err) = changes.last_error {
            q = q.col_expr(return_record::Column::LastError, Expr::value(Some(err)));
        }
        if let Some(at) = changes.last_attempt_at {
            q = q.col_expr(return_record::Column::LastAttemptAt, Expr::value(Some(at)));
        }
        if let Some(at) = changes.processed_at {
            q = q.col_expr(return_record::Column::ProcessedAt, Expr::value(Some(at)));
        }
        if let Some(handle) = changes.matched_handle {
            q = q.col_expr(return_record::Column::MatchedHandle, Expr::value(Some(handle)));
        }

        let mut q = q
            .filter(return_record::Column::Id.eq(record.id))
            .filter(return_record::Column::ProcessingStatus.eq(from.as_str()));
        if let Some(max) = changes.retry_below {
            q = q.filter(return_record::Column::RetryCount.lt(max));
        }

        let res = q.exec(db).await?;
        Ok(res.rows_affected == 1)
    }

    /// 在事务中把记录标记为 processing，之后才允许调用外部执行器
    pub async fn claim(
        db: &DatabaseConnection,
        record: &ReturnRecordModel,
        max_retry_count: u32,
    ) -> Result<bool, EngineError> {
        let from = Self::status_of(record)?;
        let changes = TransitionChanges {
            last_attempt_at: Some(Utc::now().timestamp()),
            retry_below: (from == ProcessingStatus::Failed).then_some(max_retry_count as i32),
            ..Default::default()
        };

        let txn = db.begin().await?;
        let applied =
            Self::transition(&txn, record, from, ProcessingStatus::Processing, changes).await?;
        txn.commit().await?;
        Ok(applied)
    }

    pub async fn find_by_id(
        db: &DatabaseConnection,
        id: i32,
    ) -> Result<Option<ReturnRecordModel>, DbErr> {
        ReturnRecord::find_by_id(id).one(db).await
    }

    /// 人工重新入队：failed -> pending，retry_count 清零。
    /// 这是 retry_count 唯一的重置途径。
    pub async fn requeue(
        db: &DatabaseConnection,
        receipt_id: &str,
    ) -> Result<ReturnRecordModel, EngineError> {
        let record = Self::find_by_receipt_id(db, receipt_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(receipt_id.to_string()))?;
        let from = Self::status_of(&record)?;
        if from != ProcessingStatus::Failed {
            return Err(EngineError::InvalidTransition {
                receipt_id: receipt_id.to_string(),
                from,
                to: ProcessingStatus::Pending,
            });
        }

        let now = Utc::now().timestamp();
        let res = ReturnRecord::update_many()
            .col_expr(
                return_record::Column::ProcessingStatus,
                Expr::value(ProcessingStatus::Pending.as_str()),
            )
            .col_expr(return_record::Column::RetryCount, Expr::value(0))
            .col_expr(return_record::Column::UpdatedAt, Expr::value(now))
            .filter(return_record::Column::Id.eq(record.id))
            .filter(return_record::Column::ProcessingStatus.eq(ProcessingStatus::Failed.as_str()))
            .exec(db)
            .await?;
        if res.rows_affected == 0 {
            return Err(EngineError::InvalidTransition {
                receipt_id: receipt_id.to_string(),
                from,
                to: ProcessingStatus::Pending,
            });
        }

        Self::find_by_id(db, record.id)
            .await?
            .ok_or_else(|| EngineError::NotFound(receipt_id.to_string()))
    }

    /// 卡在 processing 超过 older_than 的记录（进程崩溃残留）
    pub async fn list_stuck_processing(
        db: &DatabaseConnection,
        older_than: Duration,
        now: i64,
    ) -> Result<Vec<ReturnRecordModel>, DbErr> {
        let cutoff = now - older_than.as_secs() as i64;
        ReturnRecord::find()
            .filter(return_record::Column::ProcessingStatus.eq(ProcessingStatus::Processing.as_str()))
            .filter(
                Condition::any()
                    .add(return_record::Column::LastAttemptAt.is_null())
                    .add(return_record::Column::LastAttemptAt.lte(cutoff)),
            )
            .order_by_asc(return_record::Column::LastAttemptAt)
            .all(db)
            .await
    }

    /// 人工恢复：把卡住的 processing 记录放回 pending，不计重试
    pub async fn release_stuck(
        db: &DatabaseConnection,
        older_than: Duration,
        now: i64,
    ) -> Result<u64, DbErr> {
        let cutoff = now - older_than.as_secs() as i64;
        let res = ReturnRecord::update_many()
            .col_expr(
                return_record::Column::ProcessingStatus,
                Expr::value(ProcessingStatus::Pending.as_str()),
            )
            .col_expr(return_record::Column::UpdatedAt, Expr::value(now))
            .filter(return_record::Column::ProcessingStatus.eq(ProcessingStatus::Processing.as_str()))
            .filter(
                Condition::any()
                    .add(return_record::Column::LastAttemptAt.is_null())
                    .add(return_record::Column::LastAttemptAt.lte(cutoff)),
            )
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }

    /// 重试耗尽、等待人工处理的记录
    pub async fn list_terminal_failures(
        db: &DatabaseConnection,
        max_retry_count: u32,
    ) -> Result<Vec<ReturnRecordModel>, DbErr> {
        ReturnRecord::find()
            .filter(return_record::Column::ProcessingStatus.eq(ProcessingStatus::Failed.as_str()))
            .filter(return_record::Column::RetryCount.gte(max_retry_count as i32))
            .order_by_desc(return_record::Column::UpdatedAt)
            .all(db)
            .await
    }

    pub async fn get_stats(
        db: &DatabaseConnection,
        max_retry_count: u32,
    ) -> Result<ReconcileStats, DbErr> {
        let by_status = |status: ProcessingStatus| {
            ReturnRecord::find()
                .filter(return_record::Column::ProcessingStatus.eq(status.as_str()))
        };

        let total = ReturnRecord::find().count(db).await? as usize;
        let pending = by_status(ProcessingStatus::Pending).count(db).await? as usize;
        let processing = by_status(ProcessingStatus::Processing).count(db).await? as usize;
        let completed = by_status(ProcessingStatus::Completed).count(db).await? as usize;
        let skipped = by_status(ProcessingStatus::Skipped).count(db).await? as usize;
        let failed_terminal = by_status(ProcessingStatus::Failed)
            .filter(return_record::Column::RetryCount.gte(max_retry_count as i32))
            .count(db)
            .await? as usize;
        let failed_retryable = by_status(ProcessingStatus::Failed)
            .filter(return_record::Column::RetryCount.lt(max_retry_count as i32))
            .count(db)
            .await? as usize;

        Ok(ReconcileStats {
            total,
            pending,
            processing,
            completed,
            failed_retryable,
            failed_terminal,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::testing::external;
    use crate::storage::memory_db;

    async fn seed(db: &DatabaseConnection, id: &str) -> ReturnRecordModel {
        RecordRepository::upsert_from_source(db, &external(id, "RETURNS_UNCHECKED"), false)
            .await
            .unwrap();
        RecordRepository::find_by_receipt_id(db, id)
            .await
            .unwrap()
            .unwrap()
    }

    async fn reload(db: &DatabaseConnection, id: &str) -> ReturnRecordModel {
        RecordRepository::find_by_receipt_id(db, id)
            .await
            .unwrap()
            .unwrap()
    }

    async fn fail_once(db: &DatabaseConnection, id: &str, max: u32) {
        let rec = reload(db, id).await;
        assert!(RecordRepository::claim(db, &rec, max).await.unwrap());
        let changes = TransitionChanges {
            increment_retry: true,
            last_error: Some("boom".to_string()),
            ..Default::default()
        };
        assert!(RecordRepository::transition(
            db,
            &rec,
            ProcessingStatus::Processing,
            ProcessingStatus::Failed,
            changes
        )
        .await
        .unwrap());
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_receipt_id() {
        let db = memory_db().await;
        let rec = external("R1", "RETURNS_UNCHECKED");
        assert_eq!(
            RecordRepository::upsert_from_source(&db, &rec, false).await.unwrap(),
            UpsertOutcome::Created
        );
        let mut changed = rec.clone();
        changed.product_name = "Case A (blue)".to_string();
        assert_eq!(
            RecordRepository::upsert_from_source(&db, &changed, false).await.unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(RecordRepository::count_all(&db).await.unwrap(), 1);
        assert_eq!(reload(&db, "R1").await.product_name, "Case A (blue)");
    }

    #[tokio::test]
    async fn excluded_status_skips_new_and_pending_records() {
        let db = memory_db().await;
        assert_eq!(
            RecordRepository::upsert_from_source(&db, &external("R2", "RETURNS_COMPLETED"), true)
                .await
                .unwrap(),
            UpsertOutcome::CreatedSkipped
        );
        assert_eq!(reload(&db, "R2").await.processing_status, "skipped");

        seed(&db, "R1").await;
        assert_eq!(
            RecordRepository::upsert_from_source(&db, &external("R1", "RETURNS_WITHDRAWN"), true)
                .await
                .unwrap(),
            UpsertOutcome::BecameSkipped
        );
        let r1 = reload(&db, "R1").await;
        assert_eq!(r1.processing_status, "skipped");
        assert_eq!(r1.source_status, "RETURNS_WITHDRAWN");
    }

    #[tokio::test]
    async fn records_owned_by_processor_are_not_refreshed() {
        let db = memory_db().await;
        let rec = seed(&db, "R1").await;
        assert!(RecordRepository::claim(&db, &rec, 3).await.unwrap());

        let mut changed = external("R1", "RETURNS_COMPLETED");
        changed.receiver_name = "Lee".to_string();
        assert_eq!(
            RecordRepository::upsert_from_source(&db, &changed, true).await.unwrap(),
            UpsertOutcome::Unchanged
        );
        let r1 = reload(&db, "R1").await;
        assert_eq!(r1.processing_status, "processing");
        assert_eq!(r1.receiver_name, "Kim");
        assert_eq!(r1.source_status, "RETURNS_UNCHECKED");
    }

    #[tokio::test]
    async fn terminal_states_cannot_be_left() {
        let db = memory_db().await;
        let rec = seed(&db, "R1").await;
        assert!(RecordRepository::claim(&db, &rec, 3).await.unwrap());
        assert!(RecordRepository::transition(
            &db,
            &rec,
            ProcessingStatus::Processing,
            ProcessingStatus::Completed,
            TransitionChanges::default()
        )
        .await
        .unwrap());

        let err = RecordRepository::transition(
            &db,
            &rec,
            ProcessingStatus::Completed,
            ProcessingStatus::Pending,
            TransitionChanges::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        // 绕过仓储层直接写库同样被触发器拒绝
        let raw = ReturnRecord::update_many()
            .col_expr(
                return_record::Column::ProcessingStatus,
                Expr::value(ProcessingStatus::Pending.as_str()),
            )
            .filter(return_record::Column::Id.eq(rec.id))
            .exec(&db)
            .await;
        assert!(raw.is_err());
        assert_eq!(reload(&db, "R1").await.processing_status, "completed");

        let err = RecordRepository::requeue(&db, "R1").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn claim_is_compare_and_set() {
        let db = memory_db().await;
        let rec = seed(&db, "R1").await;
        assert!(RecordRepository::claim(&db, &rec, 3).await.unwrap());
        // 同一快照再次 claim：记录已不在 pending
        assert!(!RecordRepository::claim(&db, &rec, 3).await.unwrap());
        assert!(reload(&db, "R1").await.last_attempt_at.is_some());
    }

    #[tokio::test]
    async fn exhausted_record_cannot_be_claimed() {
        let db = memory_db().await;
        seed(&db, "R1").await;
        fail_once(&db, "R1", 1).await;

        let rec = reload(&db, "R1").await;
        assert_eq!(rec.retry_count, 1);
        assert!(!RecordRepository::claim(&db, &rec, 1).await.unwrap());
        assert_eq!(reload(&db, "R1").await.processing_status, "failed");
    }

    #[tokio::test]
    async fn retry_delay_gates_failed_records() {
        let db = memory_db().await;
        seed(&db, "R1").await;
        fail_once(&db, "R1", 3).await;

        let cfg = EngineConfig::default();
        let now = Utc::now().timestamp();
        assert!(RecordRepository::select_batch(&db, &cfg, now)
            .await
            .unwrap()
            .is_empty());

        let later = now + cfg.retry_delay.as_secs() as i64 + 1;
        let batch = RecordRepository::select_batch(&db, &cfg, later).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].external_receipt_id, "R1");
    }

    #[tokio::test]
    async fn batch_prefers_pending_then_fills_with_retries() {
        let db = memory_db().await;
        seed(&db, "F1").await;
        fail_once(&db, "F1", 3).await;
        for id in ["P1", "P2"] {
            seed(&db, id).await;
        }

        let cfg = EngineConfig {
            process_batch_size: 2,
            retry_delay: Duration::ZERO,
            ..EngineConfig::default()
        };
        let now = Utc::now().timestamp();
        let ids: Vec<String> = RecordRepository::select_batch(&db, &cfg, now)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.external_receipt_id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|id| id.starts_with('P')));

        let cfg = EngineConfig {
            process_batch_size: 5,
            ..cfg
        };
        let batch = RecordRepository::select_batch(&db, &cfg, now).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[2].external_receipt_id, "F1");
    }

    #[tokio::test]
    async fn empty_auto_set_selects_every_non_excluded_status() {
        let db = memory_db().await;
        seed(&db, "R1").await;
        RecordRepository::upsert_from_source(&db, &external("R2", "ANYTHING_ELSE"), false)
            .await
            .unwrap();

        let cfg = EngineConfig::default();
        let now = Utc::now().timestamp();
        assert_eq!(RecordRepository::select_batch(&db, &cfg, now).await.unwrap().len(), 1);

        let cfg = EngineConfig {
            auto_process_statuses: Default::default(),
            ..cfg
        };
        assert_eq!(RecordRepository::select_batch(&db, &cfg, now).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn requeue_resets_retry_count() {
        let db = memory_db().await;
        seed(&db, "R1").await;
        fail_once(&db, "R1", 2).await;
        fail_once(&db, "R1", 2).await;
        assert_eq!(
            RecordRepository::list_terminal_failures(&db, 2).await.unwrap().len(),
            1
        );

        let rec = RecordRepository::requeue(&db, "R1").await.unwrap();
        assert_eq!(rec.processing_status, "pending");
        assert_eq!(rec.retry_count, 0);
        assert_eq!(rec.last_error.as_deref(), Some("boom"));

        assert!(matches!(
            RecordRepository::requeue(&db, "R404").await.unwrap_err(),
            EngineError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn stuck_processing_records_are_released_without_penalty() {
        let db = memory_db().await;
        let rec = seed(&db, "R1").await;
        assert!(RecordRepository::claim(&db, &rec, 3).await.unwrap());

        let age = Duration::from_secs(600);
        let now = Utc::now().timestamp();
        assert!(RecordRepository::list_stuck_processing(&db, age, now)
            .await
            .unwrap()
            .is_empty());

        let later = now + 601;
        assert_eq!(
            RecordRepository::list_stuck_processing(&db, age, later)
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(RecordRepository::release_stuck(&db, age, later).await.unwrap(), 1);
        let r1 = reload(&db, "R1").await;
        assert_eq!(r1.processing_status, "pending");
        assert_eq!(r1.retry_count, 0);
    }

    #[tokio::test]
    async fn stats_split_failed_by_retry_budget() {
        let db = memory_db().await;
        for id in ["A", "B", "C"] {
            seed(&db, id).await;
        }
        RecordRepository::upsert_from_source(&db, &external("S", "RETURNS_COMPLETED"), true)
            .await
            .unwrap();
        fail_once(&db, "A", 1).await;
        fail_once(&db, "B", 3).await;

        let stats = RecordRepository::get_stats(&db, 1).await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failed_terminal, 2);
        assert_eq!(stats.failed_retryable, 0);

        let stats = RecordRepository::get_stats(&db, 3).await.unwrap();
        assert_eq!(stats.failed_terminal, 0);
        assert_eq!(stats.failed_retryable, 2);
    }
}
