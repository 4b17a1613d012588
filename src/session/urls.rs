/// 商户开放平台网关（退货/取消申请接口）
pub const MERCHANT_API_URL: &str =
    "https://api-gateway.coupang.com/v2/providers/openapi/apis/api";

pub fn url_return_requests(base: &str, vendor_id: &str) -> String {
    format!(
        "{}/v4/vendors/{}/returnRequests",
        base.trim_end_matches('/'),
        vendor_id
    )
}

/// 自动化执行服务（浏览器会话在该进程内维护）
pub fn url_executor_session_open(base: &str) -> String {
    format!("{}/session/open", base.trim_end_matches('/'))
}
pub fn url_executor_session_close(base: &str) -> String {
    format!("{}/session/close", base.trim_end_matches('/'))
}
pub fn url_executor_search(base: &str) -> String {
    format!("{}/search", base.trim_end_matches('/'))
}
pub fn url_executor_act(base: &str) -> String {
    format!("{}/act", base.trim_end_matches('/'))
}
