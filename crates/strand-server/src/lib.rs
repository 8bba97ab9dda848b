//! HTTP surface for the strand conversation orchestrator.

pub mod http;
pub mod service;

pub use service::AppState;
