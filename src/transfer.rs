//! Byte Transfer to Object Storage
//!
//! PUTs file bytes to the presigned URL issued by the coordination API.
//! Carries its own short retry policy, distinct from queue-level retry:
//! transport errors and 5xx responses are retried in place with linear
//! backoff before the failure surfaces to the queue logic; 4xx responses
//! are never retried here.

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::ErrorCategory;

/// Transfer errors.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Storage backend returned HTTP {code}")]
    Status { code: u16 },
}

impl TransferError {
    /// Whether the in-place retry policy applies.
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Transport(_) => true,
            // 429 is throttling, worth another attempt after backoff.
            TransferError::Status { code } => *code == 429 || *code >= 500,
        }
    }

    /// Whether the response signals a plan/quota refusal rather than an
    /// ordinary failure.
    pub fn is_plan_limited(&self) -> bool {
        matches!(self, TransferError::Status { code: 402 | 413 })
    }

    pub fn category(&self) -> ErrorCategory {
        if self.is_transient() {
            ErrorCategory::Transient
        } else {
            ErrorCategory::Permanent
        }
    }
}

/// Result type for transfer operations.
pub type TransferResult<T> = Result<T, TransferError>;

/// Configuration for the transfer client.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// In-place attempts per transfer before surfacing the failure.
    pub max_attempts: u32,

    /// Linear backoff step; attempt n sleeps n × step before retrying.
    pub backoff_step: Duration,

    /// Per-request timeout.
    pub request_timeout: Duration,

    /// Connection establishment timeout.
    pub connect_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_secs(2),
            request_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP client for uploading attachment bytes.
pub struct TransferClient {
    client: reqwest::Client,
    config: TransferConfig,
}

impl TransferClient {
    pub fn new(config: TransferConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    pub fn with_defaults() -> Result<Self, reqwest::Error> {
        Self::new(TransferConfig::default())
    }

    /// Upload `bytes` to `url`, retrying transient failures in place.
    pub async fn put(&self, url: &str, bytes: &[u8], mime_type: &str) -> TransferResult<()> {
        let mut last_error: Option<TransferError> = None;

        for attempt in 1..=self.config.max_attempts {
            if attempt > 1 {
                let delay = self.config.backoff_step * attempt;
                debug!("Transfer attempt {} after {:?} backoff", attempt, delay);
                sleep(delay).await;
            }

            match self.put_once(url, bytes, mime_type).await {
                Ok(()) => {
                    debug!("Transfer of {} bytes succeeded on attempt {}", bytes.len(), attempt);
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    warn!(
                        "Transient transfer failure (attempt {}/{}), retrying: {}",
                        attempt, self.config.max_attempts, e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        // Loop always exits through a return except when the final attempt
        // failed transiently.
        Err(last_error.expect("transfer retry loop exited without an error"))
    }

    async fn put_once(&self, url: &str, bytes: &[u8], mime_type: &str) -> TransferResult<()> {
        let response = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(bytes.to_vec())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransferError::Status {
                code: status.as_u16(),
            })
        }
    }
}
