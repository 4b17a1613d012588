use std::time::Duration;

/// 进程级设置（来自环境变量 / .env），与数据库中的业务配置分开
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub database_url: String,
    pub merchant_api_url: String,
    pub merchant_vendor_id: Option<String>,
    pub merchant_access_key: Option<String>,
    pub merchant_secret_key: Option<String>,
    pub executor_url: Option<String>,
    /// 每次采集回扫的重叠时长，容忍来源端迟到的记录
    pub collect_overlap: Duration,
    /// 首次采集（尚无成功游标）的回看时长
    pub initial_lookback: Duration,
    /// 单次外部调用（fetch/search/act）的超时
    pub call_timeout: Duration,
    /// stop() 等待在途任务的硬超时
    pub shutdown_timeout: Duration,
    /// 定时器抖动上限
    pub tick_jitter: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://returns.db?mode=rwc".to_string(),
            merchant_api_url: crate::session::MERCHANT_API_URL.to_string(),
            merchant_vendor_id: None,
            merchant_access_key: None,
            merchant_secret_key: None,
            executor_url: None,
            collect_overlap: Duration::from_secs(10 * 60),
            initial_lookback: Duration::from_secs(3 * 24 * 3600),
            call_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            tick_jitter: Duration::from_millis(500),
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            database_url: env_string("DATABASE_URL").unwrap_or(d.database_url),
            merchant_api_url: env_string("MERCHANT_API_URL").unwrap_or(d.merchant_api_url),
            merchant_vendor_id: env_string("MERCHANT_VENDOR_ID"),
            merchant_access_key: env_string("MERCHANT_ACCESS_KEY"),
            merchant_secret_key: env_string("MERCHANT_SECRET_KEY"),
            executor_url: env_string("EXECUTOR_URL"),
            collect_overlap: env_duration("RECON_COLLECT_OVERLAP").unwrap_or(d.collect_overlap),
            initial_lookback: env_duration("RECON_INITIAL_LOOKBACK").unwrap_or(d.initial_lookback),
            call_timeout: env_duration("RECON_CALL_TIMEOUT").unwrap_or(d.call_timeout),
            shutdown_timeout: env_duration("RECON_SHUTDOWN_TIMEOUT").unwrap_or(d.shutdown_timeout),
            tick_jitter: std::env::var("RECON_TICK_JITTER_MS")
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(d.tick_jitter),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_duration(key: &str) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    match parse_duration_secs(&raw) {
        Some(v) => Some(Duration::from_secs(v)),
        None => {
            log::warn!("忽略无法解析的时长 {}={}", key, raw);
            None
        }
    }
}

/// 解析 `90` / `30s` / `15m` / `2h` 形式的时长（秒）
pub fn parse_duration_secs(s: &str) -> Option<u64> {
    let raw = s.trim();
    if raw.is_empty() {
        return None;
    }
    let t = raw.to_ascii_lowercase();
    if let Ok(v) = t.parse::<u64>() {
        return Some(v);
    }

    let parse_num = |x: &str| x.trim().parse::<u64>().ok();

    // 长后缀在前，避免 "mins" 被 "s" 截断
    for (suffix, mul) in [
        ("minutes", 60u64),
        ("minute", 60u64),
        ("mins", 60u64),
        ("min", 60u64),
        ("hours", 3600u64),
        ("hour", 3600u64),
        ("hrs", 3600u64),
        ("hr", 3600u64),
        ("days", 86400u64),
        ("day", 86400u64),
        ("secs", 1u64),
        ("sec", 1u64),
        ("s", 1u64),
        ("m", 60u64),
        ("h", 3600u64),
        ("d", 86400u64),
    ] {
        if let Some(prefix) = t.strip_suffix(suffix) {
            if let Some(v) = parse_num(prefix) {
                return v.checked_mul(mul);
            }
        }
    }

    None
}
