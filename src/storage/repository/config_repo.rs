use crate::reconcile::error::EngineError;
use crate::reconcile::model::{ConfigPatch, EngineConfig};
use crate::storage::entity::engine_config::{self, Entity as EngineConfigRow};
use chrono::Utc;
use log::{info, warn};
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, IntoActiveModel};

const CONFIG_ROW_ID: i32 = 1;

pub struct ConfigRepository;

impl ConfigRepository {
    /// 读取配置；首次启动时写入默认值
    pub async fn load_or_init(db: &DatabaseConnection) -> Result<EngineConfig, EngineError> {
        if let Some(cfg) = Self::get(db).await? {
            return Ok(cfg);
        }

        let defaults = EngineConfig::default();
        let row = defaults.to_row(Utc::now().timestamp())?;
        EngineConfigRow::insert(row.into_active_model())
            .on_conflict(
                OnConflict::column(engine_config::Column::Id)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(db)
            .await?;
        info!("配置表为空，已写入默认配置");

        // 以落库结果为准（可能被并发初始化抢先）
        Ok(Self::get(db).await?.unwrap_or(defaults))
    }

    pub async fn get(db: &DatabaseConnection) -> Result<Option<EngineConfig>, EngineError> {
        match EngineConfigRow::find_by_id(CONFIG_ROW_ID).one(db).await? {
            Some(row) => Ok(Some(EngineConfig::from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// 校验通过后整行覆盖；校验失败时不写入任何字段
    pub async fn update(
        db: &DatabaseConnection,
        patch: &ConfigPatch,
    ) -> Result<EngineConfig, EngineError> {
        let current = match Self::load_or_init(db).await {
            Ok(cfg) => cfg,
            // 库中的行无法解析时以默认值为基准，让人工更新能修复它
            Err(EngineError::Config(e)) => {
                warn!("⚠ 已存配置无效，以默认值为基准更新: {}", e);
                EngineConfig::default()
            }
            Err(e) => return Err(e),
        };
        let next = patch.apply(&current);
        next.validate()?;
        let row = next.to_row(Utc::now().timestamp())?;

        // into_active_model 产生 Unchanged 值，reset_all 标记为脏字段才会写入
        let active = row.into_active_model().reset_all();
        active.update(db).await?;
        info!("配置已更新: {:?}", patch);
        Ok(next)
    }
}
