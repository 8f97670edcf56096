pub mod service;
pub mod store;
pub mod types;

pub use service::{BillingError, BillingService};
