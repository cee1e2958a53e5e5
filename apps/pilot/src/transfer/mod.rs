//! Screenshot transfers against the object store.
//!
//! Every operation runs in three phases: a typed request over the control
//! session, a grant carrying a presigned URL (or an `S3_ERROR`), then the HTTP
//! call against that URL with fixed-delay retries.

mod coordinator;
mod library;
mod retry;
mod store;

pub use coordinator::{SyncSummary, TransferCoordinator, TransferOutcome};
pub use library::{Capture, ScreenshotLibrary};
pub use retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY};
pub use store::{HttpObjectStore, ObjectStore, StoreError, StoreResponse};

use pilot_proto::MAX_SYNC_KEYS;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Upload,
    Download,
    Delete,
    SyncManifest,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferKind::Upload => "upload",
            TransferKind::Download => "download",
            TransferKind::Delete => "delete",
            TransferKind::SyncManifest => "sync",
        })
    }
}

/// How a remote delete answering 404 is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DeletePolicy {
    /// Only 200 and 204 count; anything else is a failed attempt.
    #[default]
    Strict,
    /// 404 means the object is already gone and counts as deleted.
    MissingOk,
}

impl DeletePolicy {
    pub fn accepts(self, status: u16) -> bool {
        match (self, status) {
            (_, 200 | 204) => true,
            (DeletePolicy::MissingOk, 404) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub retry: RetryPolicy,
    /// Upper bound on keys listed in one sync request, never above 100.
    pub sync_key_cap: usize,
    pub delete_policy: DeletePolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            sync_key_cap: MAX_SYNC_KEYS,
            delete_policy: DeletePolicy::Strict,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("cannot {kind}: not connected")]
    NotConnected { kind: TransferKind },
    #[error("{0} already in progress")]
    AlreadyInProgress(TransferKind),
    #[error("failed to send {kind} request: {reason}")]
    Request { kind: TransferKind, reason: String },
    #[error("server refused the transfer: {0}")]
    Server(String),
    #[error("invalid grant: {0}")]
    InvalidGrant(String),
    #[error("session lost before the transfer finished")]
    SessionLost,
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    #[error("no local capture for {0}")]
    MissingCapture(String),
    #[error("local storage error: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_policy_status_table() {
        for status in [200, 204] {
            assert!(DeletePolicy::Strict.accepts(status));
            assert!(DeletePolicy::MissingOk.accepts(status));
        }
        assert!(!DeletePolicy::Strict.accepts(404));
        assert!(DeletePolicy::MissingOk.accepts(404));
        for status in [201, 403, 500] {
            assert!(!DeletePolicy::Strict.accepts(status));
            assert!(!DeletePolicy::MissingOk.accepts(status));
        }
    }
}
