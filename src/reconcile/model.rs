use crate::reconcile::error::ConfigError;
use crate::settings::parse_duration_secs;
use crate::storage::entity::engine_config;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// 单批上限
pub const MAX_BATCH_SIZE: u32 = 10_000;
pub const MAX_RETRY_COUNT: u32 = 1_000;
/// 间隔与重试延迟的上限：30 天
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 3600;

/// 引擎自身的处理状态（与来源平台的状态码无关）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Skipped => "skipped",
        }
    }

    /// 状态机允许的迁移。
    ///
    /// `Failed -> Processing` 还要求 `retry_count < max_retry_count`，由仓库层在写入时校验。
    /// 人工 requeue（`Failed -> Pending`）不在此表中，任务流程无法触发。
    pub fn can_transition_to(self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Skipped)
                | (Processing, Pending)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Skipped)
                | (Failed, Processing)
        )
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "processing" => Ok(ProcessingStatus::Processing),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            "skipped" => Ok(ProcessingStatus::Skipped),
            other => Err(format!("unknown processing status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobName {
    Collect,
    Process,
}

impl JobName {
    pub const ALL: [JobName; 2] = [JobName::Collect, JobName::Process];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobName::Collect => "collect",
            JobName::Process => "process",
        }
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "collect" | "fetch" => Ok(JobName::Collect),
            "process" => Ok(JobName::Process),
            other => Err(format!("unknown job: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
        }
    }
}

/// 运行期配置（对应 engine_config 表的唯一一行）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub enabled: bool,
    pub fetch_enabled: bool,
    pub process_enabled: bool,
    pub fetch_interval: Duration,
    pub process_interval: Duration,
    pub process_batch_size: u32,
    pub auto_process_statuses: BTreeSet<String>,
    pub exclude_statuses: BTreeSet<String>,
    pub max_retry_count: u32,
    pub retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fetch_enabled: true,
            process_enabled: true,
            fetch_interval: Duration::from_secs(1800),
            process_interval: Duration::from_secs(600),
            process_batch_size: 10,
            auto_process_statuses: ["RETURNS_UNCHECKED", "VENDOR_WAREHOUSE_CONFIRM"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            exclude_statuses: ["RETURNS_COMPLETED", "RETURNS_WITHDRAWN"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_retry_count: 3,
            retry_delay: Duration::from_secs(300),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, d) in [
            ("fetch_interval", self.fetch_interval),
            ("process_interval", self.process_interval),
        ] {
            if d.as_secs() == 0 {
                return Err(ConfigError::invalid(field, "must be at least 1s"));
            }
        }
        for (field, d) in [
            ("fetch_interval", self.fetch_interval),
            ("process_interval", self.process_interval),
            ("retry_delay", self.retry_delay),
        ] {
            if d.as_secs() > MAX_DURATION_SECS {
                return Err(ConfigError::invalid(
                    field,
                    format!("must not exceed {}s", MAX_DURATION_SECS),
                ));
            }
        }
        if self.process_batch_size == 0 {
            return Err(ConfigError::invalid("process_batch_size", "must be positive"));
        }
        if self.process_batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::invalid(
                "process_batch_size",
                format!("must not exceed {}", MAX_BATCH_SIZE),
            ));
        }
        if self.max_retry_count == 0 {
            return Err(ConfigError::invalid("max_retry_count", "must be positive"));
        }
        if self.max_retry_count > MAX_RETRY_COUNT {
            return Err(ConfigError::invalid(
                "max_retry_count",
                format!("must not exceed {}", MAX_RETRY_COUNT),
            ));
        }
        if self
            .auto_process_statuses
            .iter()
            .chain(self.exclude_statuses.iter())
            .any(|s| s.trim().is_empty())
        {
            return Err(ConfigError::invalid("statuses", "status codes must not be blank"));
        }
        let overlap: Vec<String> = self
            .auto_process_statuses
            .intersection(&self.exclude_statuses)
            .cloned()
            .collect();
        if !overlap.is_empty() {
            return Err(ConfigError::OverlappingStatuses(overlap));
        }
        Ok(())
    }

    pub fn is_excluded(&self, source_status: &str) -> bool {
        self.exclude_statuses.contains(source_status)
    }

    pub fn job_active(&self, job: JobName) -> bool {
        self.enabled
            && match job {
                JobName::Collect => self.fetch_enabled,
                JobName::Process => self.process_enabled,
            }
    }

    pub fn interval(&self, job: JobName) -> Duration {
        match job {
            JobName::Collect => self.fetch_interval,
            JobName::Process => self.process_interval,
        }
    }

    pub fn from_row(row: &engine_config::Model) -> Result<Self, ConfigError> {
        let cfg = Self {
            enabled: row.enabled,
            fetch_enabled: row.fetch_enabled,
            process_enabled: row.process_enabled,
            fetch_interval: secs_field("fetch_interval", row.fetch_interval_secs)?,
            process_interval: secs_field("process_interval", row.process_interval_secs)?,
            process_batch_size: u32::try_from(row.process_batch_size)
                .map_err(|_| ConfigError::invalid("process_batch_size", "negative"))?,
            auto_process_statuses: decode_statuses(&row.auto_process_statuses)?,
            exclude_statuses: decode_statuses(&row.exclude_statuses)?,
            max_retry_count: u32::try_from(row.max_retry_count)
                .map_err(|_| ConfigError::invalid("max_retry_count", "negative"))?,
            retry_delay: secs_field("retry_delay", row.retry_delay_secs)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// 写库前的转换；超出列类型范围的值报错而不是截断
    pub fn to_row(&self, now: i64) -> Result<engine_config::Model, ConfigError> {
        Ok(engine_config::Model {
            id: 1,
            enabled: self.enabled,
            fetch_enabled: self.fetch_enabled,
            process_enabled: self.process_enabled,
            fetch_interval_secs: secs_column("fetch_interval", self.fetch_interval)?,
            process_interval_secs: secs_column("process_interval", self.process_interval)?,
            process_batch_size: i32::try_from(self.process_batch_size)
                .map_err(|_| ConfigError::invalid("process_batch_size", "out of range"))?,
            auto_process_statuses: encode_statuses(&self.auto_process_statuses),
            exclude_statuses: encode_statuses(&self.exclude_statuses),
            max_retry_count: i32::try_from(self.max_retry_count)
                .map_err(|_| ConfigError::invalid("max_retry_count", "out of range"))?,
            retry_delay_secs: secs_column("retry_delay", self.retry_delay)?,
            updated_at: now,
        })
    }
}

fn secs_column(field: &'static str, d: Duration) -> Result<i64, ConfigError> {
    i64::try_from(d.as_secs()).map_err(|_| ConfigError::invalid(field, "out of range"))
}

fn secs_field(field: &'static str, secs: i64) -> Result<Duration, ConfigError> {
    u64::try_from(secs)
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::invalid(field, "negative duration"))
}

fn decode_statuses(raw: &str) -> Result<BTreeSet<String>, ConfigError> {
    serde_json::from_str::<Vec<String>>(raw)
        .map(|v| v.into_iter().collect())
        .map_err(|e| ConfigError::Decode(e.to_string()))
}

fn encode_statuses(set: &BTreeSet<String>) -> String {
    serde_json::Value::from(set.iter().cloned().collect::<Vec<_>>()).to_string()
}

/// 配置的部分更新，None 表示保持原值
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub enabled: Option<bool>,
    pub fetch_enabled: Option<bool>,
    pub process_enabled: Option<bool>,
    pub fetch_interval: Option<Duration>,
    pub process_interval: Option<Duration>,
    pub process_batch_size: Option<u32>,
    pub auto_process_statuses: Option<BTreeSet<String>>,
    pub exclude_statuses: Option<BTreeSet<String>>,
    pub max_retry_count: Option<u32>,
    pub retry_delay: Option<Duration>,
}

impl ConfigPatch {
    pub fn apply(&self, base: &EngineConfig) -> EngineConfig {
        let mut cfg = base.clone();
        if let Some(v) = self.enabled {
            cfg.enabled = v;
        }
        if let Some(v) = self.fetch_enabled {
            cfg.fetch_enabled = v;
        }
        if let Some(v) = self.process_enabled {
            cfg.process_enabled = v;
        }
        if let Some(v) = self.fetch_interval {
            cfg.fetch_interval = v;
        }
        if let Some(v) = self.process_interval {
            cfg.process_interval = v;
        }
        if let Some(v) = self.process_batch_size {
            cfg.process_batch_size = v;
        }
        if let Some(v) = &self.auto_process_statuses {
            cfg.auto_process_statuses = v.clone();
        }
        if let Some(v) = &self.exclude_statuses {
            cfg.exclude_statuses = v.clone();
        }
        if let Some(v) = self.max_retry_count {
            cfg.max_retry_count = v;
        }
        if let Some(v) = self.retry_delay {
            cfg.retry_delay = v;
        }
        cfg
    }

    /// 解析控制台的 `config set <key> <value>`
    pub fn from_assignment(key: &str, value: &str) -> Result<Self, ConfigError> {
        let mut patch = ConfigPatch::default();
        let value = value.trim();
        match key {
            "enabled" => patch.enabled = Some(parse_bool("enabled", value)?),
            "fetch_enabled" => patch.fetch_enabled = Some(parse_bool("fetch_enabled", value)?),
            "process_enabled" => patch.process_enabled = Some(parse_bool("process_enabled", value)?),
            "fetch_interval" => patch.fetch_interval = Some(parse_duration("fetch_interval", value)?),
            "process_interval" => patch.process_interval = Some(parse_duration("process_interval", value)?),
            "retry_delay" => patch.retry_delay = Some(parse_duration("retry_delay", value)?),
            "process_batch_size" => {
                patch.process_batch_size = Some(
                    value
                        .parse()
                        .map_err(|_| ConfigError::invalid("process_batch_size", "not a number"))?,
                )
            }
            "max_retry_count" => {
                patch.max_retry_count = Some(
                    value
                        .parse()
                        .map_err(|_| ConfigError::invalid("max_retry_count", "not a number"))?,
                )
            }
            "auto_process_statuses" => patch.auto_process_statuses = Some(parse_status_list(value)),
            "exclude_statuses" => patch.exclude_statuses = Some(parse_status_list(value)),
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(patch)
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, "expected true/false")),
    }
}

fn parse_duration(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration_secs(value)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::invalid(key, "expected a duration such as 90, 30s, 15m, 2h"))
}

fn parse_status_list(value: &str) -> BTreeSet<String> {
    value
        .split(|c| c == ',' || c == ';' || c == ' ')
        .map(|x| x.trim().to_string())
        .filter(|x| !x.is_empty())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectSummary {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub malformed: usize,
    /// 被停止信号打断；游标不前移
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    pub selected: usize,
    pub completed: usize,
    pub failed: usize,
    pub deferred: usize,
    pub lost_claims: usize,
    pub interrupted: bool,
    /// 认证失败中止本轮时的原因
    pub aborted: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed_retryable: usize,
    pub failed_terminal: usize,
    pub skipped: usize,
}
