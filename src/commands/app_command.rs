use crate::reconcile::model::JobName;
use crate::settings::parse_duration_secs;
use std::str::FromStr;
use std::time::Duration;

/// 默认的卡住判定时长
const DEFAULT_STUCK_AGE: Duration = Duration::from_secs(30 * 60);
const DEFAULT_RUNS_LIMIT: u64 = 10;

pub const HELP_TEXT: &str = "\
命令:
  trigger collect|process      立即运行一次任务（忙时忽略）
  stats                        记录状态统计
  config                       查看当前配置
  config set <key> <value>     修改配置（如 process_batch_size 20 / retry_delay 10m）
  enable | disable             打开/关闭定时调度
  failed                       重试耗尽、待人工处理的记录
  stuck [age]                  卡在 processing 超过 age（默认 30m）的记录
  requeue <receipt_id>         人工重新入队（重试次数清零）
  recover <age>                把卡住超过 age 的记录放回 pending
  runs [n]                     最近 n 次运行记录与当前运行状态
  help | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCommand {
    Trigger(JobName),
    Stats,
    ShowConfig,
    SetConfig { key: String, value: String },
    Enable,
    Disable,
    Failed,
    Stuck { older_than: Duration },
    Requeue { receipt_id: String },
    Recover { older_than: Duration },
    Runs { limit: u64 },
    Help,
    Quit,
    Unknown(String),
}

impl FromStr for AppCommand {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        if parts.is_empty() {
            return Ok(AppCommand::Unknown("".to_string()));
        }

        match parts[0] {
            "trigger" | "run" => match parts.get(1).map(|j| j.parse::<JobName>()) {
                Some(Ok(job)) => Ok(AppCommand::Trigger(job)),
                Some(Err(e)) => Ok(AppCommand::Unknown(e)),
                None => Ok(AppCommand::Unknown(
                    "用法: trigger collect|process".to_string(),
                )),
            },
            "stats" => Ok(AppCommand::Stats),
            "config" => match parts.get(1).copied() {
                None => Ok(AppCommand::ShowConfig),
                Some("set") => {
                    let (Some(key), Some(_)) = (parts.get(2), parts.get(3)) else {
                        return Ok(AppCommand::Unknown(
                            "用法: config set <key> <value>".to_string(),
                        ));
                    };
                    Ok(AppCommand::SetConfig {
                        key: key.to_string(),
                        value: parts[3..].join(" "),
                    })
                }
                Some(other) => Ok(AppCommand::Unknown(format!(
                    "未知的 config 子命令: {}",
                    other
                ))),
            },
            "enable" => Ok(AppCommand::Enable),
            "disable" => Ok(AppCommand::Disable),
            "failed" => Ok(AppCommand::Failed),
            "stuck" => match parts.get(1) {
                None => Ok(AppCommand::Stuck {
                    older_than: DEFAULT_STUCK_AGE,
                }),
                Some(raw) => match parse_duration_secs(raw) {
                    Some(secs) => Ok(AppCommand::Stuck {
                        older_than: Duration::from_secs(secs),
                    }),
                    None => Ok(AppCommand::Unknown(format!("无法解析时长: {}", raw))),
                },
            },
            "requeue" => match parts.get(1) {
                Some(id) => Ok(AppCommand::Requeue {
                    receipt_id: id.to_string(),
                }),
                None => Ok(AppCommand::Unknown("用法: requeue <receipt_id>".to_string())),
            },
            "recover" => match parts.get(1).and_then(|raw| parse_duration_secs(raw)) {
                Some(secs) => Ok(AppCommand::Recover {
                    older_than: Duration::from_secs(secs),
                }),
                None => Ok(AppCommand::Unknown(
                    "用法: recover <age>，如 recover 30m".to_string(),
                )),
            },
            "runs" => {
                let limit = parts
                    .get(1)
                    .and_then(|s| s.parse::<u64>().ok())
                    .filter(|n| *n > 0)
                    .unwrap_or(DEFAULT_RUNS_LIMIT);
                Ok(AppCommand::Runs { limit })
            }
            "help" | "h" => Ok(AppCommand::Help),
            "quit" | "q" | "exit" => Ok(AppCommand::Quit),
            _ => Ok(AppCommand::Unknown(format!("未知命令: {}", parts[0]))),
        }
    }
}
