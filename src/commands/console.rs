use super::app_command::{AppCommand, HELP_TEXT};
use crate::reconcile::model::{ConfigPatch, EngineConfig};
use crate::reconcile::ReconcileEngine;
use crate::storage::entity::{job_run, return_record};
use chrono::{Local, TimeZone};

/// 执行一条控制台命令，返回要输出的行。`Quit` 由调用方处理。
pub async fn execute(engine: &ReconcileEngine, cmd: AppCommand) -> Vec<String> {
    match cmd {
        AppCommand::Trigger(job) => {
            if engine.trigger(job) {
                vec![format!("✓ 已触发 {}", job)]
            } else {
                vec![format!("⚠ {} 正在运行或引擎正在停止，已忽略", job)]
            }
        }
        AppCommand::Stats => match engine.stats().await {
            Ok(s) => vec![format!(
                "总数 {} | pending {} | processing {} | completed {} | failed {} (可重试 {}, 待人工 {}) | skipped {}",
                s.total,
                s.pending,
                s.processing,
                s.completed,
                s.failed_retryable + s.failed_terminal,
                s.failed_retryable,
                s.failed_terminal,
                s.skipped
            )],
            Err(e) => vec![format!("✗ 读取统计失败: {}", e)],
        },
        AppCommand::ShowConfig => match engine.config().await {
            Ok(cfg) => format_config(&cfg),
            Err(e) => vec![format!("✗ 读取配置失败: {}", e)],
        },
        AppCommand::SetConfig { key, value } => {
            let patch = match ConfigPatch::from_assignment(&key, &value) {
                Ok(p) => p,
                Err(e) => return vec![format!("✗ {}", e)],
            };
            update(engine, &patch).await
        }
        AppCommand::Enable => match engine.set_enabled(true).await {
            Ok(_) => vec!["✓ 定时调度已开启".to_string()],
            Err(e) => vec![format!("✗ {}", e)],
        },
        AppCommand::Disable => match engine.set_enabled(false).await {
            Ok(_) => vec!["✓ 定时调度已关闭".to_string()],
            Err(e) => vec![format!("✗ {}", e)],
        },
        AppCommand::Failed => match engine.list_terminal_failures().await {
            Ok(rows) if rows.is_empty() => vec!["没有待人工处理的记录".to_string()],
            Ok(rows) => rows.iter().map(format_record).collect(),
            Err(e) => vec![format!("✗ {}", e)],
        },
        AppCommand::Stuck { older_than } => match engine.list_stuck(older_than).await {
            Ok(rows) if rows.is_empty() => vec![format!("没有卡住超过 {:?} 的记录", older_than)],
            Ok(rows) => rows.iter().map(format_record).collect(),
            Err(e) => vec![format!("✗ {}", e)],
        },
        AppCommand::Requeue { receipt_id } => match engine.requeue(&receipt_id).await {
            Ok(r) => vec![format!("✓ 已重新入队: {}", format_record(&r))],
            Err(e) => vec![format!("✗ 重新入队失败: {}", e)],
        },
        AppCommand::Recover { older_than } => match engine.release_stuck(older_than).await {
            Ok(n) => vec![format!("✓ 已恢复 {} 条记录", n)],
            Err(e) => vec![format!("✗ 恢复失败: {}", e)],
        },
        AppCommand::Runs { limit } => {
            let mut out: Vec<String> = engine
                .job_runs()
                .iter()
                .map(|r| match (r.is_running, r.started_at) {
                    (true, Some(t)) => format!(
                        "▶ {} 运行中，开始于 {}",
                        r.job_name,
                        t.with_timezone(&Local).format("%H:%M:%S")
                    ),
                    (true, None) => format!("▶ {} 运行中", r.job_name),
                    (false, _) => format!("· {} 空闲", r.job_name),
                })
                .collect();
            match engine.recent_runs(limit).await {
                Ok(runs) => out.extend(runs.iter().map(format_run)),
                Err(e) => out.push(format!("✗ {}", e)),
            }
            out
        }
        AppCommand::Help => HELP_TEXT.lines().map(str::to_string).collect(),
        AppCommand::Quit => Vec::new(),
        AppCommand::Unknown(msg) if msg.is_empty() => Vec::new(),
        AppCommand::Unknown(msg) => vec![format!("⚠ {}（输入 help 查看命令）", msg)],
    }
}

async fn update(engine: &ReconcileEngine, patch: &ConfigPatch) -> Vec<String> {
    match engine.update_config(patch).await {
        Ok(cfg) => {
            let mut out = vec!["✓ 配置已更新".to_string()];
            out.extend(format_config(&cfg));
            out
        }
        Err(e) => vec![format!("✗ 配置未修改: {}", e)],
    }
}

fn join_set(set: &std::collections::BTreeSet<String>) -> String {
    if set.is_empty() {
        "(全部)".to_string()
    } else {
        set.iter().cloned().collect::<Vec<_>>().join(",")
    }
}

pub fn format_config(cfg: &EngineConfig) -> Vec<String> {
    vec![
        format!(
            "enabled={} fetch_enabled={} process_enabled={}",
            cfg.enabled, cfg.fetch_enabled, cfg.process_enabled
        ),
        format!(
            "fetch_interval={}s process_interval={}s process_batch_size={}",
            cfg.fetch_interval.as_secs(),
            cfg.process_interval.as_secs(),
            cfg.process_batch_size
        ),
        format!("auto_process_statuses={}", join_set(&cfg.auto_process_statuses)),
        format!("exclude_statuses={}", join_set(&cfg.exclude_statuses)),
        format!(
            "max_retry_count={} retry_delay={}s",
            cfg.max_retry_count,
            cfg.retry_delay.as_secs()
        ),
    ]
}

fn format_ts(ts: i64) -> String {
    Local
        .timestamp_opt(ts, 0)
        .single()
        .map(|t| t.format("%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

pub fn format_record(r: &return_record::Model) -> String {
    format!(
        "[{}] 订单 {} | {} | {} | 重试 {} | {}",
        r.external_receipt_id,
        r.external_order_id,
        r.source_status,
        r.processing_status,
        r.retry_count,
        r.last_error.as_deref().unwrap_or("-")
    )
}

pub fn format_run(r: &job_run::Model) -> String {
    let mark = if r.success { "✓" } else { "✗" };
    let detail = if r.job_name == "collect" {
        format!(
            "拉取 {} 新增 {} 更新 {} 畸形 {}",
            r.fetched, r.created, r.updated, r.malformed
        )
    } else {
        format!(
            "选中 {} 完成 {} 失败 {} 延后 {}",
            r.selected, r.completed, r.failed, r.deferred
        )
    };
    match &r.error {
        Some(err) => format!(
            "{} {} {} ({}) {} | {}",
            mark,
            format_ts(r.started_at),
            r.job_name,
            r.trigger,
            detail,
            err
        ),
        None => format!(
            "{} {} {} ({}) {}",
            mark,
            format_ts(r.started_at),
            r.job_name,
            r.trigger,
            detail
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::testing::{external, FakeExecutor, FakeSource};
    use crate::settings::EngineSettings;
    use crate::storage::memory_db;
    use std::sync::Arc;

    async fn engine() -> ReconcileEngine {
        let db = Arc::new(memory_db().await);
        ReconcileEngine::new(
            db,
            Arc::new(FakeSource::new(vec![external("R1", "RETURNS_UNCHECKED")])),
            Arc::new(FakeExecutor::default()),
            &EngineSettings::default(),
        )
    }

    #[tokio::test]
    async fn config_set_updates_and_rejects_invalid_values() {
        let engine = engine().await;

        let out = execute(&engine, "config set process_batch_size 25".parse().unwrap()).await;
        assert_eq!(out[0], "✓ 配置已更新");
        assert_eq!(engine.config().await.unwrap().process_batch_size, 25);

        let out = execute(&engine, "config set max_retry_count 0".parse().unwrap()).await;
        assert!(out[0].starts_with("✗ 配置未修改"));
        assert_eq!(engine.config().await.unwrap().max_retry_count, 3);

        let out = execute(&engine, "config set nope 1".parse().unwrap()).await;
        assert!(out[0].contains("unknown config key"));
    }

    #[tokio::test]
    async fn requeue_of_unknown_record_reports_error() {
        let engine = engine().await;
        let out = execute(&engine, "requeue R404".parse().unwrap()).await;
        assert!(out[0].starts_with("✗ 重新入队失败"));
    }

    #[tokio::test]
    async fn runs_shows_live_state_and_history() {
        let engine = engine().await;
        let now = chrono::Utc::now();
        engine
            .collect(now - chrono::Duration::hours(1), now)
            .await
            .unwrap();

        let out = execute(&engine, AppCommand::Runs { limit: 5 }).await;
        assert_eq!(out.len(), 3);
        assert!(out[0].contains("collect 空闲"));
        assert!(out[2].contains("拉取 1 新增 1"));
    }

    #[test]
    fn empty_status_set_is_shown_as_all() {
        let cfg = EngineConfig {
            auto_process_statuses: Default::default(),
            ..EngineConfig::default()
        };
        assert!(format_config(&cfg)[2].ends_with("(全部)"));
    }
}
