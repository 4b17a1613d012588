use super::http_session::HttpSession;
use super::urls::url_return_requests;
use crate::reconcile::error::ExternalError;
use crate::reconcile::traits::{ExternalRecord, SourceClient};
use crate::settings::EngineSettings;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use log::{info, warn};
use serde_json::Value;
use std::time::Duration;

/// 商户平台返回的时间不带时区，按 UTC+9 解释
const SOURCE_UTC_OFFSET_SECS: i32 = 9 * 3600;
/// 分页上限，防止 nextToken 异常时死循环
const MAX_PAGES: usize = 200;

/// 商户开放平台会话：按时间窗口拉取退货/取消申请
pub struct MerchantSession {
    http: HttpSession,
    url: String,
    offset: FixedOffset,
}

impl MerchantSession {
    pub fn new(
        base_url: &str,
        vendor_id: &str,
        access_key: &str,
        secret_key: &str,
        timeout: Duration,
    ) -> Result<Self, ExternalError> {
        let http = HttpSession::new(
            format!("merchant:{}", vendor_id),
            timeout,
            3,
            Duration::from_secs(2),
        )?
        .with_basic_auth(access_key, secret_key)?;
        Ok(Self {
            http,
            url: url_return_requests(base_url, vendor_id),
            offset: source_offset(),
        })
    }

    /// 凭证不全时返回 `Ok(None)`
    pub fn from_settings(settings: &EngineSettings) -> Result<Option<Self>, ExternalError> {
        let (Some(vendor), Some(access), Some(secret)) = (
            settings.merchant_vendor_id.as_deref(),
            settings.merchant_access_key.as_deref(),
            settings.merchant_secret_key.as_deref(),
        ) else {
            return Ok(None);
        };
        Self::new(
            &settings.merchant_api_url,
            vendor,
            access,
            secret,
            settings.call_timeout,
        )
        .map(Some)
    }
}

#[async_trait]
impl SourceClient for MerchantSession {
    async fn fetch(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ExternalRecord>, ExternalError> {
        let mut records = Vec::new();
        let mut next_token: Option<String> = None;

        for page in 1..=MAX_PAGES {
            let query = window_query(start, end, self.offset, next_token.as_deref());
            let body = self.http.get_json(&self.url, &query).await?;
            let (items, token) = parse_page(&body, self.offset)?;
            info!(
                "{} fetch(...) 第 {} 页: {} 条",
                self.http,
                page,
                items.len()
            );
            records.extend(items);

            match token {
                Some(t) => next_token = Some(t),
                None => return Ok(records),
            }
        }

        warn!(
            "{} fetch(...) 超过 {} 页仍有 nextToken，截断本次结果",
            self.http, MAX_PAGES
        );
        Ok(records)
    }
}

fn source_offset() -> FixedOffset {
    FixedOffset::east_opt(SOURCE_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

pub fn window_query(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    offset: FixedOffset,
    next_token: Option<&str>,
) -> Vec<(&'static str, String)> {
    let fmt = |t: DateTime<Utc>| t.with_timezone(&offset).format("%Y-%m-%dT%H:%M").to_string();
    let mut query = vec![
        ("searchType", "timeFrame".to_string()),
        ("createdAtFrom", fmt(start)),
        ("createdAtTo", fmt(end)),
    ];
    if let Some(token) = next_token.filter(|t| !t.is_empty()) {
        query.push(("nextToken", token.to_string()));
    }
    query
}

/// 解析一页响应：`data` 数组 + 可选 `nextToken`
pub fn parse_page(
    body: &Value,
    offset: FixedOffset,
) -> Result<(Vec<ExternalRecord>, Option<String>), ExternalError> {
    let items = match body.get("data") {
        Some(Value::Array(arr)) => arr.as_slice(),
        Some(Value::Null) | None => &[][..],
        Some(other) => {
            return Err(ExternalError::InvalidResponse(format!(
                "data is not an array: {}",
                other
            )))
        }
    };
    let records = items
        .iter()
        .map(|item| parse_return_request(item, offset))
        .collect();
    let next = body
        .get("nextToken")
        .and_then(|t| t.as_str())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    Ok((records, next))
}

/// 单条申请 -> ExternalRecord。字段缺失时留空，由采集器按畸形记录计数
pub fn parse_return_request(item: &Value, offset: FixedOffset) -> ExternalRecord {
    let product_name = item
        .get("returnItems")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| {
                    let name = value_str(i, "vendorItemName");
                    if name.is_empty() {
                        let alt = value_str(i, "sellerProductName");
                        (!alt.is_empty()).then_some(alt)
                    } else {
                        Some(name)
                    }
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();

    let mut receiver_phone = value_str(item, "requesterRealPhoneNumber");
    if receiver_phone.is_empty() {
        receiver_phone = value_str(item, "requesterPhoneNumber");
    }

    ExternalRecord {
        external_receipt_id: value_str(item, "receiptId"),
        external_order_id: value_str(item, "orderId"),
        product_name,
        receiver_name: value_str(item, "requesterName"),
        receiver_phone,
        source_status: value_str(item, "receiptStatus"),
        source_created_at: item
            .get("createdAt")
            .and_then(|v| v.as_str())
            .and_then(|s| parse_time(s, offset)),
        source_updated_at: item
            .get("modifiedAt")
            .and_then(|v| v.as_str())
            .and_then(|s| parse_time(s, offset)),
    }
}

/// 字符串或数字字段统一转成字符串
fn value_str(v: &Value, key: &str) -> String {
    match v.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn parse_time(s: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .and_then(|naive| offset.from_local_datetime(&naive).single())
        .map(|t| t.with_timezone(&Utc))
}
