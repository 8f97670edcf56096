pub mod client;
pub mod parse;
pub mod types;

pub use client::{ProviderSettings, TraceProvider};
pub use types::{
    BatchRecord, ContactResult, PhoneKind, PhoneNumber, PollOutcome, ProviderError, ProviderRow,
    SubmitReceipt,
};
