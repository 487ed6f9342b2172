//! Completion tracking for one run.
//!
//! Every expected key starts `Pending` and becomes `Received` the first time
//! a delivery for it is persisted. The outstanding count is published
//! through a `watch` channel so [`Aggregator::wait`] can block on it without
//! holding the state lock. Deliveries are written to a temporary file and
//! renamed into place, so an artifact on disk is always complete. Monitor
//! failures only fill keys still pending.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use sonde_model::{ExpectedResult, RunStatus, Status};
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt},
    sync::{Mutex, mpsc, oneshot, watch},
};
use tracing::{debug, error, info, warn};

use super::error::AggregatorError;
use crate::plugin::PluginResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Delivery {
    Pending,
    Received,
}

/// How [`Aggregator::wait`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Every expected result was received.
    Complete,
    /// The stop signal fired first.
    Stopped,
}

#[derive(Debug)]
struct AggregatorState {
    results: HashMap<ExpectedResult, Delivery>,
    outstanding: usize,
    status: RunStatus,
}

/// Tracks which expected results have arrived and files them on disk.
///
/// Shared between the server handlers, the failure drain and the run loop
/// behind an `Arc`.
pub struct Aggregator {
    output_dir: PathBuf,
    state: Mutex<AggregatorState>,
    outstanding: watch::Sender<usize>,
    waited: AtomicBool,
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("output_dir", &self.output_dir)
            .field("outstanding", &*self.outstanding.borrow())
            .finish()
    }
}

impl Aggregator {
    /// Seed the aggregator with the run's fixed expectation set. Repeated
    /// keys are tracked once.
    pub fn new(
        output_dir: impl Into<PathBuf>,
        expected: &[ExpectedResult],
    ) -> Self {
        let mut results = HashMap::with_capacity(expected.len());
        let mut keys = Vec::with_capacity(expected.len());
        for key in expected {
            if results.insert(key.clone(), Delivery::Pending).is_none() {
                keys.push(key.clone());
            }
        }

        let outstanding = keys.len();
        let (tx, _) = watch::channel(outstanding);

        Self {
            output_dir: output_dir.into(),
            state: Mutex::new(AggregatorState {
                results,
                outstanding,
                status: RunStatus::new(&keys),
            }),
            outstanding: tx,
            waited: AtomicBool::new(false),
        }
    }

    /// Root every artifact is written under.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Expected results not yet received.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Snapshot of the per-key and aggregate status.
    pub async fn status(&self) -> RunStatus {
        self.state.lock().await.status.clone()
    }

    /// Where the artifact for `key` lands.
    pub fn path_for(&self, key: &ExpectedResult) -> PathBuf {
        self.output_dir.join(key.scope()).join(&key.result_type)
    }

    /// Persist a delivery from a workload and count it toward completion.
    pub async fn handle_delivery<R>(
        &self,
        key: &ExpectedResult,
        body: R,
        mime_type: &str,
    ) -> Result<(), AggregatorError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.deliver(key, body, mime_type, None).await
    }

    /// Apply a locally produced result exactly like a remote delivery.
    pub async fn ingest(
        &self,
        result: PluginResult,
    ) -> Result<(), AggregatorError> {
        self.deliver(
            &result.key,
            result.body.as_ref(),
            &result.mime_type,
            result.error.as_deref(),
        )
        .await
    }

    /// Drain monitor failures until every sender is gone.
    pub async fn ingest_failures(
        &self,
        mut results: mpsc::Receiver<PluginResult>,
    ) {
        while let Some(result) = results.recv().await {
            let key = result.key.clone();
            if let Err(err) = self.ingest(result).await {
                error!(key = %key, "failed to record plugin failure: {err}");
            }
        }
        debug!("failure channel drained");
    }

    /// Block until nothing is outstanding or `stop` fires. Only the first
    /// call waits; later calls fail.
    pub async fn wait(
        &self,
        stop: oneshot::Receiver<()>,
    ) -> Result<WaitOutcome, AggregatorError> {
        if self.waited.swap(true, Ordering::SeqCst) {
            return Err(AggregatorError::AlreadyWaited);
        }

        let mut outstanding = self.outstanding.subscribe();
        tokio::select! {
            done = outstanding.wait_for(|count| *count == 0) => {
                Ok(if done.is_ok() {
                    WaitOutcome::Complete
                } else {
                    WaitOutcome::Stopped
                })
            }
            _ = stop => {
                info!(
                    outstanding = self.outstanding(),
                    "aggregator wait stopped"
                );
                Ok(WaitOutcome::Stopped)
            }
        }
    }

    async fn deliver<R>(
        &self,
        key: &ExpectedResult,
        body: R,
        mime_type: &str,
        error: Option<&str>,
    ) -> Result<(), AggregatorError>
    where
        R: AsyncRead + Unpin + Send,
    {
        key.validate()
            .map_err(|err| AggregatorError::InvalidKey(err.to_string()))?;

        if let Some(reason) = error {
            // A failure never replaces a result that already arrived, so the
            // check and the write happen under one lock.
            let mut state = self.state.lock().await;
            match state.results.get(key) {
                None => return Err(self.unexpected(key)),
                Some(Delivery::Received) => {
                    info!(
                        key = %key,
                        reason,
                        "ignoring failure for a result already received"
                    );
                    return Ok(());
                }
                Some(Delivery::Pending) => {}
            }
            let path = self.persist(key, body).await?;
            self.record(&mut state, key, Status::Failed, mime_type, &path);
            return Ok(());
        }

        if !self.state.lock().await.results.contains_key(key) {
            return Err(self.unexpected(key));
        }

        // Persistence runs outside the lock; only the transition below is
        // serialized.
        let path = self.persist(key, body).await?;

        let mut state = self.state.lock().await;
        if state.results.get(key) == Some(&Delivery::Received) {
            debug!(key = %key, "duplicate result overwrote earlier artifact");
            return Ok(());
        }
        self.record(&mut state, key, Status::Complete, mime_type, &path);
        Ok(())
    }

    fn unexpected(&self, key: &ExpectedResult) -> AggregatorError {
        warn!(key = %key, "rejecting unexpected result");
        AggregatorError::Unexpected(key.clone())
    }

    /// Move a pending key to `Received` and count it.
    fn record(
        &self,
        state: &mut AggregatorState,
        key: &ExpectedResult,
        status: Status,
        mime_type: &str,
        path: &Path,
    ) {
        state.results.insert(key.clone(), Delivery::Received);
        if let Err(err) = state.status.update(key, status) {
            warn!(key = %key, "status not tracked for result: {err}");
        }

        state.outstanding = state.outstanding.saturating_sub(1);
        self.outstanding.send_replace(state.outstanding);

        info!(
            key = %key,
            mime_type,
            path = %path.display(),
            outstanding = state.outstanding,
            failed = status == Status::Failed,
            "received plugin result"
        );
    }

    async fn persist<R>(
        &self,
        key: &ExpectedResult,
        mut body: R,
    ) -> Result<PathBuf, AggregatorError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let path = self.path_for(key);
        let persistence = |source| AggregatorError::Persistence {
            path: path.clone(),
            source,
        };

        let dir = self.output_dir.join(key.scope());
        fs::create_dir_all(&dir).await.map_err(persistence)?;

        // The partial file is removed when `partial` drops, which covers
        // errors and a cancelled delivery alike.
        let (file, partial) = tempfile::Builder::new()
            .prefix(&format!(".{}.", key.result_type))
            .suffix(".partial")
            .tempfile_in(&dir)
            .map_err(persistence)?
            .into_parts();

        let mut file = File::from_std(file);
        let written = async {
            tokio::io::copy(&mut body, &mut file).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        written.map_err(persistence)?;

        partial
            .persist(&path)
            .map_err(|err| persistence(err.error))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        pin::Pin,
        sync::Arc,
        task::{Context, Poll},
        time::Duration,
    };

    use tokio::io::ReadBuf;

    use super::*;

    fn expected() -> Vec<ExpectedResult> {
        vec![
            ExpectedResult::for_node("node1", "systemd"),
            ExpectedResult::for_node("node2", "systemd"),
            ExpectedResult::global("e2e"),
        ]
    }

    /// Yields a few bytes, then fails.
    struct BrokenBody {
        sent: bool,
    }

    impl AsyncRead for BrokenBody {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.sent {
                return Poll::Ready(Err(io::Error::other("connection reset")));
            }
            self.sent = true;
            buf.put_slice(b"partial");
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn distinct_deliveries_complete_the_run() {
        for n in 0..4 {
            let dir = tempfile::tempdir().unwrap();
            let keys: Vec<_> = (0..n)
                .map(|i| ExpectedResult::for_node(format!("node{i}"), "logs"))
                .collect();
            let aggregator = Arc::new(Aggregator::new(dir.path(), &keys));

            let (_stop_tx, stop_rx) = oneshot::channel();
            let waiter = {
                let aggregator = aggregator.clone();
                tokio::spawn(async move { aggregator.wait(stop_rx).await })
            };

            for key in &keys {
                aggregator
                    .handle_delivery(key, &b"payload"[..], "text/plain")
                    .await
                    .unwrap();
            }

            let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(outcome, WaitOutcome::Complete);
            assert_eq!(aggregator.outstanding(), 0);
            assert_eq!(aggregator.status().await.status, Status::Complete);
        }
    }

    #[tokio::test]
    async fn duplicates_are_counted_once() {
        let dir = tempfile::tempdir().unwrap();
        let aggregator = Aggregator::new(dir.path(), &expected());
        let key = ExpectedResult::for_node("node1", "systemd");

        aggregator
            .handle_delivery(&key, &b"first"[..], "text/plain")
            .await
            .unwrap();
        aggregator
            .handle_delivery(&key, &b"second"[..], "text/plain")
            .await
            .unwrap();

        assert_eq!(aggregator.outstanding(), 2);
        let stored = fs::read(aggregator.path_for(&key)).await.unwrap();
        assert_eq!(stored, b"second");
    }

    #[tokio::test]
    async fn artifacts_land_under_scope_and_result_type() {
        let dir = tempfile::tempdir().unwrap();
        let aggregator = Aggregator::new(dir.path(), &expected());

        aggregator
            .handle_delivery(
                &ExpectedResult::global("e2e"),
                &b"{}"[..],
                "application/json",
            )
            .await
            .unwrap();

        let path = dir.path().join("global").join("e2e");
        assert_eq!(fs::read(path).await.unwrap(), b"{}");
    }

    #[tokio::test]
    async fn monitor_failure_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let aggregator = Aggregator::new(dir.path(), &expected());
        let key = ExpectedResult::for_node("node1", "systemd");

        aggregator
            .ingest(PluginResult::failure(key.clone(), "crash loop", None))
            .await
            .unwrap();
        aggregator
            .handle_delivery(
                &ExpectedResult::global("e2e"),
                &b"ok"[..],
                "text/plain",
            )
            .await
            .unwrap();

        let status = aggregator.status().await;
        assert_eq!(status.status, Status::Failed);
        assert_eq!(status.get(&key), Some(Status::Failed));
        assert_eq!(aggregator.outstanding(), 1);

        let body = fs::read(aggregator.path_for(&key)).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "crash loop");
    }

    #[tokio::test]
    async fn unexpected_and_malformed_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let aggregator = Aggregator::new(dir.path(), &expected());

        let err = aggregator
            .handle_delivery(
                &ExpectedResult::for_node("node3", "systemd"),
                &b""[..],
                "text/plain",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AggregatorError::Unexpected(_)));

        let err = aggregator
            .handle_delivery(
                &ExpectedResult::for_node("..", "systemd"),
                &b""[..],
                "text/plain",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AggregatorError::InvalidKey(_)));
        assert_eq!(aggregator.outstanding(), 3);
    }

    #[tokio::test]
    async fn persistence_failure_leaves_key_pending() {
        let dir = tempfile::tempdir().unwrap();
        let aggregator = Aggregator::new(dir.path(), &expected());
        let key = ExpectedResult::global("e2e");

        let err = aggregator
            .handle_delivery(&key, BrokenBody { sent: false }, "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, AggregatorError::Persistence { .. }));
        assert_eq!(aggregator.outstanding(), 3);
        assert!(!aggregator.path_for(&key).exists());

        let mut leftovers =
            std::fs::read_dir(dir.path().join("global")).unwrap();
        assert!(leftovers.next().is_none());

        aggregator
            .handle_delivery(&key, &b"retry"[..], "text/plain")
            .await
            .unwrap();
        assert_eq!(aggregator.outstanding(), 2);
    }

    #[tokio::test]
    async fn wait_only_runs_once_and_honours_stop() {
        let dir = tempfile::tempdir().unwrap();
        let aggregator = Aggregator::new(dir.path(), &expected());

        let (stop_tx, stop_rx) = oneshot::channel();
        stop_tx.send(()).unwrap();
        assert_eq!(
            aggregator.wait(stop_rx).await.unwrap(),
            WaitOutcome::Stopped
        );

        let (_stop_tx, stop_rx) = oneshot::channel();
        let err = aggregator.wait(stop_rx).await.unwrap_err();
        assert!(matches!(err, AggregatorError::AlreadyWaited));
    }

    #[tokio::test]
    async fn empty_expectations_complete_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let aggregator = Aggregator::new(dir.path(), &[]);
        let (_stop, stop_rx) = oneshot::channel();
        assert_eq!(
            aggregator.wait(stop_rx).await.unwrap(),
            WaitOutcome::Complete
        );
    }

    #[tokio::test]
    async fn failures_are_drained_from_channel() {
        let dir = tempfile::tempdir().unwrap();
        let aggregator = Aggregator::new(dir.path(), &expected());
        let (tx, rx) = mpsc::channel(4);

        tx.send(PluginResult::failure(
            ExpectedResult::for_node("node2", "systemd"),
            "image pull failed",
            Some("unit"),
        ))
        .await
        .unwrap();
        tx.send(PluginResult::failure(
            ExpectedResult::for_node("node7", "systemd"),
            "not expected",
            None,
        ))
        .await
        .unwrap();
        drop(tx);

        aggregator.ingest_failures(rx).await;
        assert_eq!(aggregator.outstanding(), 2);
    }

    #[tokio::test]
    async fn late_failure_keeps_received_result() {
        let dir = tempfile::tempdir().unwrap();
        let aggregator = Aggregator::new(dir.path(), &expected());
        let key = ExpectedResult::global("e2e");

        aggregator
            .handle_delivery(&key, &b"tarball"[..], "application/gzip")
            .await
            .unwrap();
        aggregator
            .ingest(PluginResult::failure(
                key.clone(),
                "failed to list units: connection refused",
                None,
            ))
            .await
            .unwrap();

        let stored = fs::read(aggregator.path_for(&key)).await.unwrap();
        assert_eq!(stored, b"tarball");
        let status = aggregator.status().await;
        assert_eq!(status.get(&key), Some(Status::Complete));
        assert_eq!(status.status, Status::Running);
        assert_eq!(aggregator.outstanding(), 2);
    }

    #[tokio::test]
    async fn cancelled_delivery_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let aggregator = Arc::new(Aggregator::new(dir.path(), &expected()));
        let key = ExpectedResult::global("e2e");
        let (mut writer, reader) = tokio::io::duplex(64);

        let delivery = {
            let aggregator = aggregator.clone();
            let key = key.clone();
            tokio::spawn(async move {
                aggregator.handle_delivery(&key, reader, "text/plain").await
            })
        };
        writer.write_all(b"first half of the body").await.unwrap();

        let scope = dir.path().join("global");
        let mut started = false;
        for _ in 0..200 {
            if std::fs::read_dir(&scope)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false)
            {
                started = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(started, "delivery never started writing");

        delivery.abort();
        assert!(delivery.await.unwrap_err().is_cancelled());

        assert_eq!(std::fs::read_dir(&scope).unwrap().count(), 0);
        assert_eq!(aggregator.outstanding(), 3);
    }
}
