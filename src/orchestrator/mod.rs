pub mod service;

pub use service::{Orchestrator, RunMode};
