//! Structured error types crossing the Store ↔ Controller ↔ Worker boundaries.
//!
//! Two kinds of failure cross these boundaries (spec §7):
//!
//! - [`StoreError`] — what a [`crate::store::Store`] adapter reports back to the
//!   Controller. Adapters classify their own failures; unrecognized failures
//!   must be mapped to `StoreError::Retriable` rather than panicking.
//! - [`ControllerError`] — what the Controller reports to producers and the
//!   Worker. A `Concurrency` error is a normal return condition, not a bug:
//!   callers lost an optimistic-locking race and should re-read and retry.
//!
//! `ConfigError` is separate and fatal: it is only ever raised synchronously
//! while constructing a [`crate::controller::Controller`], never while it is
//! running.

use thiserror::Error;

/// Failure reported by a [`crate::store::Store`] adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient failure (network blip, failover, timeout). The caller should
    /// back off and retry; this must never be surfaced to user job code.
    #[error("store operation failed transiently: {0}")]
    Retriable(#[source] anyhow::Error),

    /// The caller's `version` no longer matches the stored record, or no
    /// record exists at that id/version pair.
    #[error("version mismatch or record not found")]
    Concurrency,

    /// `insert_unique` found an existing record with the same id.
    #[error("record already exists")]
    AlreadyExists,
}

impl StoreError {
    /// Wrap an arbitrary adapter error as retriable. Adapters should use this
    /// for any failure they cannot positively classify as a concurrency error,
    /// per spec §4.1: "Unrecognized store errors propagate as retriable."
    pub fn retriable(err: impl Into<anyhow::Error>) -> Self {
        StoreError::Retriable(err.into())
    }
}

/// Failure reported by the [`crate::controller::Controller`] to producers and workers.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Transient store failure; the caller should back off and retry.
    #[error("transient failure, retry: {0}")]
    Retriable(#[source] anyhow::Error),

    /// Optimistic-concurrency loss: the caller's `version` is stale.
    #[error("concurrency conflict: job {job_id} at version {version} was not found")]
    Concurrency {
        /// The job the caller tried to mutate.
        job_id: String,
        /// The version the caller believed was current.
        version: u64,
    },
}

impl ControllerError {
    /// True if this is a concurrency conflict rather than a transient failure.
    pub fn is_concurrency(&self) -> bool {
        matches!(self, ControllerError::Concurrency { .. })
    }

    pub(crate) fn from_store(err: StoreError, job_id: &str, version: u64) -> Self {
        match err {
            StoreError::Retriable(e) => ControllerError::Retriable(e),
            StoreError::Concurrency => ControllerError::Concurrency {
                job_id: job_id.to_string(),
                version,
            },
            StoreError::AlreadyExists => ControllerError::Retriable(anyhow::anyhow!(
                "unexpected AlreadyExists outside create_job for job {job_id}"
            )),
        }
    }
}

/// Fatal configuration error, raised synchronously at startup.
///
/// Matches `_validate_db_uri` raising a plain exception at `Controller.__init__`
/// in the original implementation: a missing database name is a programming
/// error, not something the Controller should retry around.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The connection URI did not name a database/namespace.
    #[error("database/namespace must be specified explicitly in the connection URI")]
    MissingDatabase,

    /// The connection URI could not be parsed at all.
    #[error("invalid connection URI: {0}")]
    InvalidUri(String),

    /// The store could not be reached while validating configuration.
    #[error("store unreachable at startup: {0}")]
    Unreachable(#[source] anyhow::Error),
}
