use crate::reconcile::model::{JobName, ProcessingStatus};
use std::time::Duration;

/// 外部协作方（来源 API / 动作执行器）返回的错误分型
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExternalError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("rate limited")]
    RateLimited,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("transient error: {0}")]
    Transient(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ExternalError {
    /// 认证类错误：中止本轮，不在本轮内重试
    pub fn is_auth(&self) -> bool {
        matches!(self, ExternalError::Unauthorized(_))
    }

    /// 计入记录的重试次数；认证错误除外
    pub fn is_retryable(&self) -> bool {
        !self.is_auth()
    }
}

impl From<reqwest::Error> for ExternalError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExternalError::Timeout(Duration::ZERO)
        } else if e.is_decode() {
            ExternalError::InvalidResponse(e.to_string())
        } else {
            ExternalError::Transient(e.to_string())
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("statuses both auto-processed and excluded: {0:?}")]
    OverlappingStatuses(Vec<String>),
    #[error("cannot decode stored config: {0}")]
    Decode(String),
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("source client: {0}")]
    Source(ExternalError),
    #[error("action executor: {0}")]
    Executor(ExternalError),
    #[error("invalid transition for {receipt_id}: {from} -> {to}")]
    InvalidTransition {
        receipt_id: String,
        from: ProcessingStatus,
        to: ProcessingStatus,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0} job is already running")]
    Busy(JobName),
    #[error("engine is stopping")]
    Stopping,
}
