use crate::reconcile::traits::{ActionOutcome, Candidate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub candidates: Vec<CandidateDto>,
}

#[derive(Debug, Deserialize)]
pub struct CandidateDto {
    pub handle: String,
    #[serde(default, rename = "receiverName")]
    pub receiver_name: String,
    #[serde(default, rename = "phoneSuffix")]
    pub phone_suffix: String,
    #[serde(default, rename = "productName")]
    pub product_name: String,
}

impl From<CandidateDto> for Candidate {
    fn from(dto: CandidateDto) -> Self {
        Candidate {
            handle: dto.handle,
            receiver_name: dto.receiver_name,
            receiver_phone_suffix: dto.phone_suffix,
            product_name: dto.product_name,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ActRequest<'a> {
    pub handle: &'a str,
    #[serde(rename = "receiptId")]
    pub receipt_id: &'a str,
    #[serde(rename = "orderId")]
    pub order_id: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct ActResponse {
    pub success: bool,
    #[serde(default, rename = "errorCode")]
    pub error_code: Option<String>,
}

impl From<ActResponse> for ActionOutcome {
    fn from(dto: ActResponse) -> Self {
        ActionOutcome {
            success: dto.success,
            error_code: dto.error_code,
        }
    }
}
