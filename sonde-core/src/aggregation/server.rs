//! Mutual-TLS endpoint workloads submit results to.
//!
//! Routes:
//! - `POST /api/v1/results/global/{result_type}`
//! - `POST /api/v1/results/by-node/{node}/{result_type}`
//! - `GET /api/v1/status`
//!
//! Bodies are streamed straight into [`Aggregator::handle_delivery`]; the
//! MIME type travels in `Content-Type`.

use std::{fmt, io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use axum_server::{Handle, tls_rustls::RustlsConfig};
use futures_util::TryStreamExt;
use rustls::ServerConfig;
use sonde_model::{
    ExpectedResult, RunStatus,
    routes::{DEFAULT_MIME_TYPE, MIME_TYPE_HEADER, v1},
};
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::{aggregator::Aggregator, error::ApiError};

/// Routes for result submission and status, sharing one aggregator.
pub fn router(aggregator: Arc<Aggregator>) -> Router {
    Router::new()
        .route(v1::results::GLOBAL_ITEM, post(post_global_result))
        .route(v1::results::BY_NODE_ITEM, post(post_node_result))
        .route(v1::STATUS, get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(aggregator)
}

/// POST /api/v1/results/global/{result_type}
async fn post_global_result(
    State(aggregator): State<Arc<Aggregator>>,
    Path(result_type): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, ApiError> {
    let key = ExpectedResult::global(result_type);
    deliver(&aggregator, key, &headers, body).await
}

/// POST /api/v1/results/by-node/{node}/{result_type}
async fn post_node_result(
    State(aggregator): State<Arc<Aggregator>>,
    Path((node, result_type)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, ApiError> {
    let key = ExpectedResult::for_node(node, result_type);
    deliver(&aggregator, key, &headers, body).await
}

async fn get_status(
    State(aggregator): State<Arc<Aggregator>>,
) -> Json<RunStatus> {
    Json(aggregator.status().await)
}

async fn deliver(
    aggregator: &Aggregator,
    key: ExpectedResult,
    headers: &HeaderMap,
    body: Body,
) -> Result<StatusCode, ApiError> {
    let mime_type = headers
        .get(MIME_TYPE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or(DEFAULT_MIME_TYPE);

    let reader =
        StreamReader::new(body.into_data_stream().map_err(io::Error::other));

    aggregator.handle_delivery(&key, reader, mime_type).await?;
    Ok(StatusCode::OK)
}

/// A running aggregation listener.
pub struct AggregationServer {
    handle: Handle<SocketAddr>,
    task: JoinHandle<io::Result<()>>,
}

impl fmt::Debug for AggregationServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationServer")
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl AggregationServer {
    /// Bind `addr` in the background, serving with `tls`.
    pub fn spawn(
        addr: SocketAddr,
        tls: Arc<ServerConfig>,
        aggregator: Arc<Aggregator>,
    ) -> Self {
        let handle: Handle<SocketAddr> = Handle::new();
        let app = router(aggregator);
        let config = RustlsConfig::from_config(tls);

        let task = tokio::spawn(
            axum_server::bind_rustls(addr, config)
                .handle(handle.clone())
                .serve(app.into_make_service()),
        );

        info!(%addr, "aggregation server starting");
        Self { handle, task }
    }

    /// Address actually bound, once listening. `None` if binding failed.
    pub async fn listening(&self) -> Option<SocketAddr> {
        self.handle.listening().await
    }

    /// Close the listener and drop open connections.
    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    /// Stop accepting, letting in-flight requests finish within `grace`.
    pub fn graceful_shutdown(&self, grace: Duration) {
        self.handle.graceful_shutdown(Some(grace));
    }

    /// Resolve when the serve task ends, for whatever reason.
    ///
    /// Safe to poll repeatedly from a `select!` loop.
    pub async fn finished(&mut self) -> Result<(), String> {
        match (&mut self.task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                error!("aggregation server failed: {err}");
                Err(err.to_string())
            }
            Err(err) => Err(format!("aggregation server task failed: {err}")),
        }
    }
}
