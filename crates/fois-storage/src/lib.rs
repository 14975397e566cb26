//! Durable destinations for synced datasets plus the bounded retry used
//! around every store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use fois_core::Dataset;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info, warn};

mod memory;
mod postgres;
mod sheets;

pub use memory::{MemorySink, MemoryTable};
pub use postgres::{PostgresSink, IDENTITY_COLUMN};
pub use sheets::{ServiceAccountAuth, SheetsAuth, SheetsSink, StaticToken, SHEETS_SCOPE};

pub const CRATE_NAME: &str = "fois-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("transient sink failure: {0}")]
    Transient(String),
    #[error("sink failure: {0}")]
    Permanent(String),
    #[error("{table} has no column(s) {columns:?}; storage schema is fixed at creation")]
    SchemaMismatch { table: String, columns: Vec<String> },
}

impl SinkError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Transient(_) => RetryDisposition::Retryable,
            Self::Permanent(_) | Self::SchemaMismatch { .. } => RetryDisposition::NonRetryable,
        }
    }

    pub(crate) fn from_disposition(disposition: RetryDisposition, message: String) -> Self {
        match disposition {
            RetryDisposition::Retryable => Self::Transient(message),
            RetryDisposition::NonRetryable => Self::Permanent(message),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store into {dataset} failed after {attempts} attempts: {last}")]
    Exhausted {
        dataset: String,
        attempts: usize,
        last: SinkError,
    },
    #[error("store into {dataset} rejected: {source}")]
    Rejected {
        dataset: String,
        #[source]
        source: SinkError,
    },
    #[error("existence check on {dataset} failed: {source}")]
    Lookup {
        dataset: String,
        #[source]
        source: SinkError,
    },
}

/// A destination that can answer "is this date already stored?" and append a
/// dataset, creating its storage unit on first use.
#[async_trait]
pub trait Sink: Send + Sync {
    fn describe(&self) -> &str;

    /// Missing storage is `Ok(false)`, never an error.
    async fn exists(&self, dataset: &str, date: NaiveDate) -> Result<bool, SinkError>;

    /// Appends every row and returns how many were written.
    async fn store(&self, dataset: &str, data: &Dataset) -> Result<usize, SinkError>;
}

/// Attempt bound and the pause between attempts of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(5))
    }
}

impl BackoffPolicy {
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

/// Stores `data`, retrying transient failures up to `policy.max_attempts` in total.
/// Permanent failures propagate on the first attempt.
pub async fn store_with_retry(
    sink: &dyn Sink,
    policy: &BackoffPolicy,
    dataset: &str,
    data: &Dataset,
) -> Result<usize, StoreError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match sink.store(dataset, data).await {
            Ok(written) => {
                if attempt > 1 {
                    info!(dataset, attempt, "store succeeded after retry");
                }
                return Ok(written);
            }
            Err(err) => err,
        };

        if err.disposition() == RetryDisposition::NonRetryable {
            return Err(StoreError::Rejected {
                dataset: dataset.to_string(),
                source: err,
            });
        }

        if attempt == max_attempts {
            return Err(StoreError::Exhausted {
                dataset: dataset.to_string(),
                attempts: max_attempts,
                last: err,
            });
        }

        let delay = policy.delay;
        warn!(
            dataset,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient store failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Dataset columns that an existing storage unit does not have.
pub(crate) fn unknown_columns<'a>(existing: &[String], data: &'a Dataset) -> Vec<&'a str> {
    data.columns()
        .iter()
        .filter(|c| !existing.iter().any(|e| e == *c))
        .map(String::as_str)
        .collect()
}

/// Re-orders dataset cells into `target` column order; absent columns become `None`.
pub(crate) fn aligned_text_rows(target: &[String], data: &Dataset) -> Vec<Vec<Option<String>>> {
    let positions: Vec<Option<usize>> = target.iter().map(|c| data.column_index(c)).collect();
    data.text_rows()
        .map(|row| {
            positions
                .iter()
                .map(|pos| pos.and_then(|idx| row[idx].clone()))
                .collect()
        })
        .collect()
}
