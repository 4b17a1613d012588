use crate::reconcile::error::{EngineError, ExternalError};
use crate::reconcile::model::{CollectSummary, JobName, RunTrigger};
use crate::reconcile::shutdown::ShutdownSignal;
use crate::reconcile::traits::SourceClient;
use crate::storage::repository::{
    ConfigRepository, JobRunEntry, JobRunRepository, RecordRepository, UpsertOutcome,
};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use log::{error, info, warn};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;

/// 采集窗口相关参数
#[derive(Debug, Clone, Copy)]
pub struct CollectorSettings {
    pub overlap: Duration,
    pub initial_lookback: Duration,
    pub call_timeout: Duration,
}

pub struct Collector {
    db: Arc<DatabaseConnection>,
    source: Arc<dyn SourceClient>,
    settings: CollectorSettings,
}

impl Collector {
    pub fn new(
        db: Arc<DatabaseConnection>,
        source: Arc<dyn SourceClient>,
        settings: CollectorSettings,
    ) -> Self {
        Self {
            db,
            source,
            settings,
        }
    }

    /// 默认窗口：上次成功采集的终点回退 overlap 到现在；从未成功过则回看 initial_lookback
    pub async fn default_window(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>), EngineError> {
        let overlap = to_chrono(self.settings.overlap);
        let start = match JobRunRepository::last_successful_window_end(&self.db, JobName::Collect)
            .await?
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        {
            Some(cursor) => cursor - overlap,
            None => now - to_chrono(self.settings.initial_lookback),
        };
        Ok((start.min(now), now))
    }

    /// 采集 `[start, end]` 窗口（手动调用）
    pub async fn collect(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<CollectSummary, EngineError> {
        self.collect_until(start, end, &ShutdownSignal::never())
            .await
    }

    /// 同 `collect`，但在记录边界响应停止信号
    pub async fn collect_until(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        shutdown: &ShutdownSignal,
    ) -> Result<CollectSummary, EngineError> {
        self.run_window(start, end, RunTrigger::Manual, shutdown)
            .await
    }

    /// 调度入口：按默认窗口采集
    pub async fn run(
        &self,
        trigger: RunTrigger,
        shutdown: &ShutdownSignal,
    ) -> Result<CollectSummary, EngineError> {
        let (start, end) = self.default_window(Utc::now()).await?;
        self.run_window(start, end, trigger, shutdown).await
    }

    async fn run_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        trigger: RunTrigger,
        shutdown: &ShutdownSignal,
    ) -> Result<CollectSummary, EngineError> {
        let mut entry = JobRunEntry::new(JobName::Collect, trigger, Utc::now().timestamp());
        entry.window = Some((start.timestamp(), end.timestamp()));

        let result = self.collect_inner(start, end, shutdown).await;

        entry.finished_at = Utc::now().timestamp();
        match &result {
            Ok(summary) => {
                entry.success = !summary.interrupted;
                entry.fetched = summary.fetched;
                entry.created = summary.created;
                entry.updated = summary.updated;
                entry.malformed = summary.malformed;
                if summary.interrupted {
                    entry.error = Some("interrupted by shutdown".to_string());
                }
            }
            Err(e) => entry.error = Some(e.to_string()),
        }
        // 审计写入失败不影响采集结果
        if let Err(e) = JobRunRepository::record(&self.db, entry).await {
            error!("写入采集审计记录失败: {}", e);
        }

        result
    }

    async fn collect_inner(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        shutdown: &ShutdownSignal,
    ) -> Result<CollectSummary, EngineError> {
        let cfg = ConfigRepository::load_or_init(&self.db).await?;

        let items = match tokio::time::timeout(
            self.settings.call_timeout,
            self.source.fetch(start, end),
        )
        .await
        {
            Ok(Ok(items)) => items,
            Ok(Err(e)) => {
                warn!("✗ 来源拉取失败 [{} ~ {}]: {}", start, end, e);
                return Err(EngineError::Source(e));
            }
            Err(_) => {
                warn!("✗ 来源拉取超时 [{} ~ {}]", start, end);
                return Err(EngineError::Source(ExternalError::Timeout(
                    self.settings.call_timeout,
                )));
            }
        };

        let mut summary = CollectSummary {
            window_start: start,
            window_end: end,
            fetched: items.len(),
            created: 0,
            updated: 0,
            unchanged: 0,
            skipped: 0,
            malformed: 0,
            interrupted: false,
        };

        for item in &items {
            if shutdown.is_triggered() {
                warn!("采集被停止信号打断，游标保持不变");
                summary.interrupted = true;
                break;
            }
            if !item.is_well_formed() {
                summary.malformed += 1;
                warn!("跳过畸形记录: {:?}", item.external_receipt_id);
                continue;
            }

            let excluded = cfg.is_excluded(&item.source_status);
            match RecordRepository::upsert_from_source(&self.db, item, excluded).await? {
                UpsertOutcome::Created => summary.created += 1,
                UpsertOutcome::CreatedSkipped => {
                    summary.created += 1;
                    summary.skipped += 1;
                }
                UpsertOutcome::Updated => summary.updated += 1,
                UpsertOutcome::BecameSkipped => {
                    summary.updated += 1;
                    summary.skipped += 1;
                }
                UpsertOutcome::Unchanged => summary.unchanged += 1,
            }
        }

        info!(
            "✓ 采集完成 [{} ~ {}]: 拉取 {}, 新增 {}, 更新 {}, 未变 {}, 跳过 {}, 畸形 {}",
            start,
            end,
            summary.fetched,
            summary.created,
            summary.updated,
            summary.unchanged,
            summary.skipped,
            summary.malformed
        );
        Ok(summary)
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::days(365))
}
