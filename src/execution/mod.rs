pub mod adapter;
pub mod client_order_id;
pub mod service;

pub use adapter::{AdapterError, AdapterOrderState, BinanceExecutionAdapter, BinanceExecutionConfig, ExecutionAdapter, OrderStatus};
pub use service::ExecutionService;
