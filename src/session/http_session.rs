use crate::reconcile::error::ExternalError;
use log::{info, warn};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;

/// 响应状态的分类，决定是否重试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Ok,
    /// 401/403：凭证问题，不在本轮重试
    Unauthorized,
    /// 429
    RateLimited,
    /// 5xx / 408
    Retryable,
    /// 其余 4xx
    Rejected,
}

pub fn classify_status(status: StatusCode) -> StatusClass {
    if status.is_success() {
        StatusClass::Ok
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        StatusClass::Unauthorized
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        StatusClass::RateLimited
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        StatusClass::Retryable
    } else {
        StatusClass::Rejected
    }
}

/// 带重试的 HTTP 会话
///
/// 遇到 429 / 5xx / 网络错误时等待后重试，最多 `max_tries` 次；
/// 401/403 立即返回 `Unauthorized`，由上层决定中止本轮。
pub struct HttpSession {
    name: String,
    client: Client,
    headers: HeaderMap,
    timeout: Duration,
    max_tries: usize,
    delay_unexpected: Duration,
}

impl HttpSession {
    /// * `name` - 日志里的会话名
    /// * `timeout` - 单次请求超时
    /// * `max_tries` - 最大尝试次数
    /// * `delay_unexpected` - 非预期响应后的等待时间（429 优先使用 retry-after）
    pub fn new(
        name: impl Into<String>,
        timeout: Duration,
        max_tries: usize,
        delay_unexpected: Duration,
    ) -> Result<Self, ExternalError> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .user_agent(concat!("rustrecon/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ExternalError::Transient(format!("build http client: {}", e)))?;
        Ok(Self {
            name: name.into(),
            client,
            headers: HeaderMap::new(),
            timeout,
            max_tries: max_tries.max(1),
            delay_unexpected,
        })
    }

    /// 每个请求都带上 Basic 认证头
    pub fn with_basic_auth(mut self, user: &str, secret: &str) -> Result<Self, ExternalError> {
        let value = basic_auth_value(user, secret);
        let value = HeaderValue::from_str(&value)
            .map_err(|e| ExternalError::Unauthorized(format!("invalid credentials: {}", e)))?;
        self.headers.insert(AUTHORIZATION, value);
        Ok(self)
    }

    /// 执行请求（带重试）。只有 2xx 响应会以 `Ok` 返回。
    ///
    /// * `builder` - 接收 Client 并返回 RequestBuilder 的闭包，每次重试都会重新构造请求
    pub async fn request<F>(&self, builder: F) -> Result<Response, ExternalError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut last_err = ExternalError::Transient("no attempt made".to_string());

        for try_num in 1..=self.max_tries {
            let sent = builder(&self.client)
                .headers(self.headers.clone())
                .send()
                .await;

            let mut wait = self.delay_unexpected;
            match sent {
                Err(e) if e.is_timeout() => {
                    // 超时交给上层按可重试失败处理，不在这里叠加等待
                    warn!("{} request(...) timed out [{} tries]", self, try_num);
                    return Err(ExternalError::Timeout(self.timeout));
                }
                Err(e) => {
                    warn!("{} request(...) 网络错误: {}", self, e);
                    last_err = ExternalError::from(e);
                }
                Ok(resp) => match classify_status(resp.status()) {
                    StatusClass::Ok => {
                        info!("{} request(...) [{} tries]", self, try_num);
                        return Ok(resp);
                    }
                    StatusClass::Unauthorized => {
                        let status = resp.status();
                        let body = resp.text().await.unwrap_or_default();
                        return Err(ExternalError::Unauthorized(format!(
                            "{} {}",
                            status,
                            snippet(&body)
                        )));
                    }
                    StatusClass::Rejected => {
                        let status = resp.status();
                        let body = resp.text().await.unwrap_or_default();
                        return Err(ExternalError::InvalidResponse(format!(
                            "{} {}",
                            status,
                            snippet(&body)
                        )));
                    }
                    StatusClass::RateLimited => {
                        if let Some(secs) = retry_after(&resp) {
                            wait = Duration::from_secs(secs);
                        }
                        last_err = ExternalError::RateLimited;
                    }
                    StatusClass::Retryable => {
                        last_err = ExternalError::Transient(resp.status().to_string());
                    }
                },
            }

            if try_num < self.max_tries {
                warn!(
                    "{} request(...) 非预期响应 ({})，{:?} 后重试，第 {}/{} 次",
                    self, last_err, wait, try_num, self.max_tries
                );
                tokio::time::sleep(wait).await;
            }
        }

        warn!("{} request(...) [max {} tries ran out]", self, self.max_tries);
        Err(last_err)
    }

    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, ExternalError> {
        let resp = self.request(|client| client.get(url).query(query)).await?;
        read_json(resp).await
    }

    pub async fn post_json<B: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<serde_json::Value, ExternalError> {
        let resp = self.request(|client| client.post(url).json(body)).await?;
        read_json(resp).await
    }
}

async fn read_json(resp: Response) -> Result<serde_json::Value, ExternalError> {
    let text = resp.text().await?;
    if text.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(&text)
        .map_err(|e| ExternalError::InvalidResponse(format!("{}: {}", e, snippet(&text))))
}

fn retry_after(resp: &Response) -> Option<u64> {
    resp.headers()
        .get("retry-after")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

pub fn basic_auth_value(user: &str, secret: &str) -> String {
    use base64::Engine;
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, secret))
    )
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

impl std::fmt::Display for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<HttpSession [{}]>", self.name)
    }
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<HttpSession [{}]>", self.name)
    }
}
