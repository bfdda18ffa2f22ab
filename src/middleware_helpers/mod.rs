pub mod request_id;
pub mod retry;
pub mod security_headers;

pub use request_id::{request_id_middleware, REQUEST_ID_HEADER};
pub use retry::{with_retry, RetryConfig, StoreContentionPolicy};
pub use security_headers::security_headers_middleware;
