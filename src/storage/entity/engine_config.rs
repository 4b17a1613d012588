use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 单行配置表（id 固定为 1）
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "engine_config")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i32,
    pub enabled: bool,
    pub fetch_enabled: bool,
    pub process_enabled: bool,
    pub fetch_interval_secs: i64,
    pub process_interval_secs: i64,
    pub process_batch_size: i32,
    pub auto_process_statuses: String, // JSON array
    pub exclude_statuses: String,      // JSON array
    pub max_retry_count: i32,
    pub retry_delay_secs: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
