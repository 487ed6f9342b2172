//! Workload-side result submission.
//!
//! Runs inside every dispatched unit: [`mtls_client`] builds the
//! authenticated channel from the issued credential and [`submit`] delivers
//! the produced result with bounded retries.

pub mod client;
pub mod request;
pub mod retry;

pub use client::mtls_client;
pub use request::{SubmitError, SubmitReceipt, Submission, submit};
pub use retry::RetryConfig;
