use super::dto::{ActRequest, ActResponse, SearchRequest, SearchResponse};
use super::http_session::HttpSession;
use super::urls::*;
use crate::reconcile::error::ExternalError;
use crate::reconcile::traits::{ActionExecutor, ActionOutcome, Candidate};
use crate::storage::entity::return_record;
use async_trait::async_trait;
use log::info;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;

/// 通过 HTTP 驱动进程外的自动化服务（支付记录页面的检索与操作）。
/// 浏览器会话由该服务维护，这里只负责打开/关闭与转发调用。
pub struct ExecutorBridge {
    http: HttpSession,
    base_url: String,
}

impl ExecutorBridge {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ExternalError> {
        // act 不是天然幂等的，网络层只重试一次以内的瞬时错误
        let http = HttpSession::new("executor", timeout, 2, Duration::from_secs(1))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

fn decode<T: DeserializeOwned>(body: Value) -> Result<T, ExternalError> {
    serde_json::from_value(body).map_err(|e| ExternalError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl ActionExecutor for ExecutorBridge {
    async fn open(&self) -> Result<(), ExternalError> {
        self.http
            .post_json(&url_executor_session_open(&self.base_url), &json!({}))
            .await?;
        info!("{} 会话已打开", self.http);
        Ok(())
    }

    async fn search(&self, query: &str) -> Result<Vec<Candidate>, ExternalError> {
        let body = self
            .http
            .post_json(&url_executor_search(&self.base_url), &SearchRequest { query })
            .await?;
        let resp: SearchResponse = decode(body)?;
        Ok(resp.candidates.into_iter().map(Candidate::from).collect())
    }

    async fn act(
        &self,
        handle: &str,
        record: &return_record::Model,
    ) -> Result<ActionOutcome, ExternalError> {
        let req = ActRequest {
            handle,
            receipt_id: &record.external_receipt_id,
            order_id: &record.external_order_id,
        };
        let body = self
            .http
            .post_json(&url_executor_act(&self.base_url), &req)
            .await?;
        let resp: ActResponse = decode(body)?;
        Ok(resp.into())
    }

    async fn close(&self) -> Result<(), ExternalError> {
        self.http
            .post_json(&url_executor_session_close(&self.base_url), &json!({}))
            .await?;
        info!("{} 会话已关闭", self.http);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_search_response_with_missing_fields() {
        let body = json!({
            "candidates": [
                {"handle": "pay-1", "receiverName": "Kim", "phoneSuffix": "1234", "productName": "Case A"},
                {"handle": "pay-2"}
            ]
        });
        let resp: SearchResponse = decode(body).unwrap();
        let candidates: Vec<Candidate> = resp.candidates.into_iter().map(Candidate::from).collect();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].receiver_phone_suffix, "1234");
        assert_eq!(candidates[1].receiver_name, "");

        let empty: SearchResponse = decode(json!({})).unwrap();
        assert!(empty.candidates.is_empty());
    }

    #[test]
    fn decodes_act_response() {
        let ok: ActResponse = decode(json!({"success": true})).unwrap();
        assert_eq!(ActionOutcome::from(ok), ActionOutcome::ok());

        let failed: ActResponse = decode(json!({"success": false, "errorCode": "E42"})).unwrap();
        assert_eq!(ActionOutcome::from(failed), ActionOutcome::failed("E42"));

        let err = decode::<ActResponse>(json!({"ok": 1})).unwrap_err();
        assert!(matches!(err, ExternalError::InvalidResponse(_)));
    }

    #[test]
    fn act_request_uses_camel_case() {
        let req = ActRequest {
            handle: "pay-1",
            receipt_id: "R1",
            order_id: "O-R1",
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"handle": "pay-1", "receiptId": "R1", "orderId": "O-R1"})
        );
    }
}
