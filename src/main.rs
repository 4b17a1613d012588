mod commands;
mod reconcile;
mod session;
mod settings;
mod storage;

use anyhow::{anyhow, Context};
use chrono::Local;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::commands::{console, AppCommand};
use crate::reconcile::ReconcileEngine;
use crate::session::{ExecutorBridge, MerchantSession};
use crate::settings::EngineSettings;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let ts = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let log_dir = std::path::PathBuf::from("logs");
    std::fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join(format!("app-{}.log", ts));
    let log_file = std::fs::File::create(&log_path)?;
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(log_file))) // 日志写文件，stdout 留给控制台
        .filter_level(log::LevelFilter::Warn)
        .filter_module("rustrecon", log::LevelFilter::Info)
        .filter_module("sqlx", log::LevelFilter::Error)
        .filter_module("sea_orm", log::LevelFilter::Error)
        .init();

    match dotenv::dotenv() {
        Ok(path) => println!("✓ 已加载 {}", path.display()),
        Err(_) => println!("⚠ 未找到 .env 文件，从系统环境变量读取"),
    }
    println!("日志文件: {}", log_path.display());

    let settings = EngineSettings::from_env();

    let db = storage::establish_connection(&settings.database_url)
        .await
        .with_context(|| format!("数据库连接失败: {}", settings.database_url))?;
    println!("✓ 数据库连接成功");

    let source = MerchantSession::from_settings(&settings)?.ok_or_else(|| {
        anyhow!("请在 .env 中设置 MERCHANT_VENDOR_ID / MERCHANT_ACCESS_KEY / MERCHANT_SECRET_KEY")
    })?;
    let executor_url = settings
        .executor_url
        .clone()
        .ok_or_else(|| anyhow!("请在 .env 中设置 EXECUTOR_URL"))?;
    let executor = ExecutorBridge::new(&executor_url, settings.call_timeout)?;

    let engine = ReconcileEngine::new(
        Arc::new(db),
        Arc::new(source),
        Arc::new(executor),
        &settings,
    );
    let cfg = engine.start().await?;
    println!(
        "✓ 引擎已启动，定时调度{}（输入 help 查看命令）",
        if cfg.enabled { "已开启" } else { "未开启，可用 enable 打开" }
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("收到 Ctrl-C，正在停止...");
                None
            }
        };
        let Some(line) = line else { break };

        let cmd: AppCommand = line
            .parse()
            .unwrap_or_else(|_| AppCommand::Unknown(String::new()));
        if cmd == AppCommand::Quit {
            break;
        }
        for out in console::execute(&engine, cmd).await {
            println!("{}", out);
        }
    }

    if engine.stop().await {
        println!("✓ 已停止");
    } else {
        eprintln!("✗ 停止超时，部分任务被强制中止，可用 stuck / recover 检查残留记录");
    }
    Ok(())
}
