pub mod dto;
pub mod executor_bridge;
pub mod http_session;
pub mod merchant_session;
pub mod urls;

pub use executor_bridge::ExecutorBridge;
pub use merchant_session::MerchantSession;
pub use urls::*;
