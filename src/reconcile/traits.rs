use crate::reconcile::error::ExternalError;
use crate::storage::entity::return_record;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 来源平台返回的一条退货/取消申请
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRecord {
    pub external_receipt_id: String,
    pub external_order_id: String,
    pub product_name: String,
    pub receiver_name: String,
    pub receiver_phone: String,
    pub source_status: String,
    pub source_created_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
}

impl ExternalRecord {
    /// 缺少去重键、订单号、状态或时间戳的记录视为畸形
    pub fn is_well_formed(&self) -> bool {
        !self.external_receipt_id.trim().is_empty()
            && !self.external_order_id.trim().is_empty()
            && !self.source_status.trim().is_empty()
            && self.source_created_at.is_some()
    }
}

/// 第二数据源（支付记录）中的候选条目
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// 不透明句柄，只交还给 `act`
    pub handle: String,
    pub receiver_name: String,
    pub receiver_phone_suffix: String,
    pub product_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub error_code: Option<String>,
}

impl ActionOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_code: None,
        }
    }

    pub fn failed(code: impl Into<String>) -> Self {
        Self {
            success: false,
            error_code: Some(code.into()),
        }
    }
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    /// 拉取来源时间戳落在 `[start, end]` 内的记录；窗口重叠时可重复调用
    async fn fetch(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ExternalRecord>, ExternalError>;
}

/// 对第二数据源执行检索与动作的外部会话。
///
/// 会话的打开/关闭由实现自己管理，引擎只把它当作"可用或报错"。
/// 该会话不支持并发使用，调用方必须串行化。
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<Candidate>, ExternalError>;

    async fn act(
        &self,
        handle: &str,
        record: &return_record::Model,
    ) -> Result<ActionOutcome, ExternalError>;

    async fn open(&self) -> Result<(), ExternalError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ExternalError> {
        Ok(())
    }
}
