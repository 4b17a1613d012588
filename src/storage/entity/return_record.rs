use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "return_records")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub external_receipt_id: String, // 去重键
    pub external_order_id: String,
    pub product_name: String,
    pub receiver_name: String,
    pub receiver_phone: String,
    pub source_status: String,
    pub source_created_at: i64,
    #[sea_orm(nullable)]
    pub source_updated_at: Option<i64>,

    // 引擎状态：pending/processing/completed/failed/skipped
    pub processing_status: String,
    pub retry_count: i32,
    #[sea_orm(nullable)]
    pub last_error: Option<String>,
    #[sea_orm(nullable)]
    pub last_attempt_at: Option<i64>,
    #[sea_orm(nullable)]
    pub processed_at: Option<i64>,
    #[sea_orm(nullable)]
    pub matched_handle: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
