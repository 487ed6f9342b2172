use std::{fmt, io, path::PathBuf};

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use sonde_model::ExpectedResult;

use crate::{ca::CaError, cluster::ClusterError, plugin::DriverError};

/// Why a delivery was not recorded.
#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    /// The key is valid but not part of this run's expectation set.
    #[error("result {0} was not expected in this run")]
    Unexpected(ExpectedResult),

    /// The key cannot be used as an output path.
    #[error("invalid result key: {0}")]
    InvalidKey(String),

    /// Writing the artifact failed; the key stays pending.
    #[error("failed to persist result to {path}: {source}")]
    Persistence {
        /// Final artifact path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// [`Aggregator::wait`](super::Aggregator::wait) was called twice.
    #[error("aggregator wait was already started")]
    AlreadyWaited,
}

/// Fatal outcomes of an orchestration run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Node enumeration failed.
    #[error("failed to list cluster nodes: {0}")]
    Cluster(#[from] ClusterError),

    /// The run's certificates could not be issued.
    #[error("certificate authority failure: {0}")]
    Certificate(#[from] CaError),

    /// A plugin's workload could not be dispatched.
    #[error("failed to dispatch plugin {plugin}: {source}")]
    Dispatch {
        /// Name of the plugin that failed.
        plugin: String,
        /// Driver failure.
        #[source]
        source: DriverError,
    },

    /// The aggregation listener stopped before the run ended.
    #[error("aggregation server failed: {0}")]
    Server(String),

    /// The hard timeout elapsed.
    #[error("timed out after {0:?} waiting for results")]
    Timeout(std::time::Duration),

    /// Configuration failed validation.
    #[error("invalid run configuration: {0}")]
    Config(String),

    /// The aggregator could not be waited on.
    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
}

/// Error returned from the aggregation endpoints.
///
/// Serialized as `{"error": {"message", "status"}}`.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status returned to the submitter.
    pub status: StatusCode,
    /// Human-readable cause.
    pub message: String,
}

impl ApiError {
    /// Error with an explicit status.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// 500; the submitter should retry.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// 400; the submission is malformed.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// 403; the result is not accepted by this run.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        (self.status, body).into_response()
    }
}

// Client mistakes are 4xx so submitters stop; local failures are 5xx so
// they retry.
impl From<AggregatorError> for ApiError {
    fn from(err: AggregatorError) -> Self {
        match err {
            AggregatorError::Unexpected(_) => Self::forbidden(err.to_string()),
            AggregatorError::InvalidKey(_) => {
                Self::bad_request(err.to_string())
            }
            AggregatorError::Persistence { .. }
            | AggregatorError::AlreadyWaited => Self::internal(err.to_string()),
        }
    }
}
