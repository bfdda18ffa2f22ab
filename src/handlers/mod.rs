pub mod checkout;
pub mod common;
pub mod products;
pub mod webhooks;
