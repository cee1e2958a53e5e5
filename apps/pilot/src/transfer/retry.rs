use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, warn};

use super::{TransferError, TransferKind};
use crate::session::SessionState;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Fixed-delay retry for the HTTP leg of a transfer. The presigned URL is
/// reused for every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Resolves once the session behind `session` is no longer `Connected`, or
/// its owner went away.
pub(crate) async fn session_lost(session: &mut watch::Receiver<SessionState>) {
    loop {
        let connected = *session.borrow_and_update() == SessionState::Connected;
        if !connected || session.changed().await.is_err() {
            return;
        }
    }
}

pub(crate) fn still_connected(session: &watch::Receiver<SessionState>) -> bool {
    *session.borrow() == SessionState::Connected
}

/// Runs `attempt` until it succeeds or `policy.max_attempts` attempts failed.
/// Losing the session ends the loop with `SessionLost` at once, whether an
/// attempt or the delay between attempts is in progress.
pub(crate) async fn run_with_retry<T, F, Fut>(
    policy: RetryPolicy,
    kind: TransferKind,
    session: &mut watch::Receiver<SessionState>,
    mut attempt: F,
) -> Result<T, TransferError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for n in 1..=max_attempts {
        if !still_connected(session) {
            return Err(TransferError::SessionLost);
        }
        let result = tokio::select! {
            biased;
            _ = session_lost(session) => return Err(TransferError::SessionLost),
            result = attempt(n) => result,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(
                    target: "pilot::transfer",
                    %kind,
                    attempt = n,
                    max_attempts,
                    error = %err,
                    "transfer attempt failed"
                );
                last_error = err;
            }
        }
        if n < max_attempts {
            tokio::select! {
                biased;
                _ = session_lost(session) => return Err(TransferError::SessionLost),
                _ = sleep(policy.delay) => {}
            }
        }
    }

    error!(
        target: "pilot::transfer",
        %kind,
        attempts = max_attempts,
        error = %last_error,
        "transfer retries exhausted"
    );
    Err(TransferError::Exhausted {
        attempts: max_attempts,
        last_error,
    })
}
