pub mod cache;
pub mod lifecycle;
pub mod service;
pub mod store;
pub mod types;

pub use service::{TraceError, TraceService};
