pub mod cli;
pub mod collaborators;
pub mod config;
pub mod credentials;
pub mod fusion;
pub mod router;
pub mod runtime;
pub mod session;
pub mod telemetry;
pub mod transfer;

#[cfg(test)]
mod testing;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch; the stamp used for capture keys and
/// envelope timestamps.
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
