//! Submission of one result to the aggregation server.
//!
//! The producer runs first and exactly once; if it fails nothing is sent.
//! Server errors and transient network failures are retried with backoff.
//! A client error means the server will never accept the result, so it ends
//! the attempt immediately.

use std::{error::Error, future::Future};

use axum::body::Bytes;
use reqwest::{Client, StatusCode, header::CONTENT_TYPE};
use tracing::{debug, info, warn};

use super::retry::RetryConfig;

type BoxError = Box<dyn Error + Send + Sync>;

/// Payload and MIME type produced for submission.
#[derive(Clone, Debug)]
pub struct Submission {
    pub payload: Bytes,
    pub mime_type: String,
}

impl Submission {
    pub fn new(payload: impl Into<Bytes>, mime_type: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            mime_type: mime_type.into(),
        }
    }
}

/// The response that ended a successful submission.
#[derive(Clone, Debug)]
pub struct SubmitReceipt {
    pub status: StatusCode,
    pub body: Bytes,
    pub attempts: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("failed to produce result: {0}")]
    Producer(#[source] BoxError),

    #[error("server rejected result with {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u16, last: String },

    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
}

/// Run `producer`, then POST its output to `url` until it is accepted or
/// the retry budget runs out.
pub async fn submit<F, Fut, E>(
    url: &str,
    client: &Client,
    retry: &RetryConfig,
    producer: F,
) -> Result<SubmitReceipt, SubmitError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Submission, E>>,
    E: Into<BoxError>,
{
    let submission = producer()
        .await
        .map_err(|err| SubmitError::Producer(err.into()))?;

    let max_attempts = retry.max_attempts.max(1);
    let mut attempts = 0;

    loop {
        attempts += 1;
        debug!(url, attempt = attempts, "submitting result");

        let sent = client
            .post(url)
            .header(CONTENT_TYPE, &submission.mime_type)
            .body(submission.payload.clone())
            .send()
            .await;

        let failure = match sent {
            Ok(response) => {
                let status = response.status();
                match response.bytes().await {
                    Ok(body) if status.is_success() => {
                        info!(url, %status, attempts, "result submitted");
                        return Ok(SubmitReceipt {
                            status,
                            body,
                            attempts,
                        });
                    }
                    Ok(body) if status.is_server_error() => format!(
                        "server responded {status}: {}",
                        String::from_utf8_lossy(&body)
                    ),
                    Ok(body) => {
                        return Err(SubmitError::Rejected {
                            status,
                            body: String::from_utf8_lossy(&body).into_owned(),
                        });
                    }
                    Err(err) => {
                        format!("failed to read {status} response: {err}")
                    }
                }
            }
            Err(err) if is_transient(&err) => err.to_string(),
            Err(err) => return Err(SubmitError::Transport(err)),
        };

        if attempts >= max_attempts {
            warn!(url, attempts, "giving up on result submission: {failure}");
            return Err(SubmitError::Exhausted {
                attempts,
                last: failure,
            });
        }

        let delay = retry.delay_for(attempts);
        warn!(
            url,
            attempt = attempts,
            retry_in_ms = delay.as_millis() as u64,
            "result submission failed: {failure}"
        );
        tokio::time::sleep(delay).await;
    }
}

fn is_transient(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || err.is_request() || err.is_body()
}
