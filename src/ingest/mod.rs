pub mod adapter;
pub mod coordinator;
pub mod service;

pub use adapter::{HyperliquidIngestAdapter, IngestAdapter, IngestAdapterError, RawPositionEvent};
pub use coordinator::IngestCoordinator;
pub use service::IngestService;
