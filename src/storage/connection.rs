use crate::storage::entity::{engine_config, job_run, return_record};
use log::info;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, EntityTrait, Schema,
    Statement,
};
use std::time::Duration;

pub async fn establish_connection(db_url: &str) -> Result<DatabaseConnection, DbErr> {
    let in_memory = db_url.contains(":memory:") || db_url.contains("mode=memory");

    let mut opt = ConnectOptions::new(db_url.to_owned());
    opt.connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(8))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);
    if in_memory {
        // 内存库每个连接各自独立，只能用单连接且不能被回收
        opt.max_connections(1).min_connections(1);
    } else {
        opt.max_connections(10)
            .min_connections(2)
            .idle_timeout(Duration::from_secs(300))
            .max_lifetime(Duration::from_secs(1800));
    }

    let db = Database::connect(opt).await?;

    if !in_memory {
        // 启用 WAL 模式
        db.execute(Statement::from_string(
            sea_orm::DatabaseBackend::Sqlite,
            "PRAGMA journal_mode=WAL;".to_string(),
        ))
        .await?;
    }

    create_schema(&db).await?;

    info!("Database connection established and reconciliation tables initialized.");

    Ok(db)
}

async fn create_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    create_table(db, return_record::Entity).await?;
    create_table(db, engine_config::Entity).await?;
    create_table(db, job_run::Entity).await?;

    let backend = db.get_database_backend();
    for sql in [
        // 处理器选批：status + 来源时间
        "CREATE INDEX IF NOT EXISTS idx_return_records_status_source ON return_records(processing_status, source_created_at);",
        "CREATE INDEX IF NOT EXISTS idx_job_runs_name_window ON job_runs(job_name, success, window_end);",
        // 存储层兜底：completed/skipped 为终态，任何写入都不能改变其状态
        "CREATE TRIGGER IF NOT EXISTS trg_return_records_terminal \
         BEFORE UPDATE OF processing_status ON return_records \
         WHEN OLD.processing_status IN ('completed', 'skipped') \
          AND NEW.processing_status <> OLD.processing_status \
         BEGIN SELECT RAISE(ABORT, 'terminal processing_status'); END;",
    ] {
        db.execute(Statement::from_string(backend, sql.to_string()))
            .await?;
    }

    Ok(())
}

async fn create_table<E: EntityTrait>(db: &DatabaseConnection, entity: E) -> Result<(), DbErr> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);
    let stmt = builder.build(schema.create_table_from_entity(entity).if_not_exists());
    db.execute(stmt).await?;
    Ok(())
}
