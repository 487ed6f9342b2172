//! Result aggregation: the completion state machine, the mutual-TLS
//! endpoint in front of it, and the run loop tying dispatch to completion.

pub mod aggregator;
pub mod error;
pub mod run;
pub mod server;

pub use aggregator::{Aggregator, WaitOutcome};
pub use error::{AggregatorError, ApiError, RunError};
pub use run::{PLUGINS_DIR, run};
pub use server::{AggregationServer, router};
