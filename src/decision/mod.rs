pub mod service;
pub mod sizing;
pub mod types;

pub use service::{DecisionService, DraftIntent};
pub use types::{DecisionInputs, ExpectedPrice, FiltersProvider, FilterViolation, PriceProvider, SymbolFilters};
