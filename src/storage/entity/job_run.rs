use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "job_runs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub job_name: String, // collect / process
    pub trigger: String,  // scheduled / manual
    pub started_at: i64,
    pub finished_at: i64,
    pub success: bool,
    #[sea_orm(nullable)]
    pub window_start: Option<i64>,
    #[sea_orm(nullable)]
    pub window_end: Option<i64>,
    pub fetched: i32,
    pub created: i32,
    pub updated: i32,
    pub malformed: i32,
    pub selected: i32,
    pub completed: i32,
    pub failed: i32,
    pub deferred: i32,
    #[sea_orm(nullable)]
    pub error: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
