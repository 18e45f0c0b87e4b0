//! Replication client seam and its retry loop.

use crate::error::{RelayError, Result};
use crate::ingest::IngestionAdapter;
use crate::shutdown::Shutdown;
use crate::types::Position;
use std::time::Duration;
use tracing::{info, warn};

/// Default pause between reconnect attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// A replication stream client.
///
/// `stream` connects at `from`, feeds every decoded change and position
/// advance into `sink`, and returns when the stream ends or fails. It
/// should return promptly once `shutdown` is cancelled.
pub trait ReplicationSource: Send {
    fn stream(&mut self, from: Position, sink: &IngestionAdapter, shutdown: &Shutdown) -> Result<()>;
}

/// Drive `source` until it finishes cleanly or `shutdown` is cancelled.
///
/// Stream faults are logged and retried after `backoff`, resuming from the
/// latest recorded ingestion position. A fault observed after cancellation
/// is treated as the requested stop, not as a fault.
pub fn run_replication<S>(
    source: &mut S,
    sink: &IngestionAdapter,
    configured_start: Option<&Position>,
    shutdown: &Shutdown,
    backoff: Duration,
) -> Result<()>
where
    S: ReplicationSource + ?Sized,
{
    let mut attempt = 0u64;
    while !shutdown.is_cancelled() {
        attempt += 1;
        let from = sink.resume_position(configured_start);

        match source.stream(from, sink, shutdown) {
            Ok(()) => {
                info!(attempt, "replication stream ended");
                return Ok(());
            }
            Err(_) if shutdown.is_cancelled() => break,
            Err(e) => {
                sink.on_stream_error(&e);
                warn!(attempt, backoff_ms = backoff.as_millis() as u64, "retrying replication stream");
                if shutdown.sleep(backoff) {
                    break;
                }
            }
        }
    }

    info!(attempt, "replication stopped");
    Ok(())
}

/// Convenience for sources that surface their own error types.
pub fn stream_error(err: impl std::fmt::Display) -> RelayError {
    RelayError::Stream(err.to_string())
}
