pub mod service;
pub mod supervisor;

pub use service::{BulkService, BulkSubmitRequest, BulkSubmitResponse};
pub use supervisor::{BulkPollPolicy, BulkSupervisor};

#[cfg(test)]
mod tests;
