// ABOUTME: Write barrier letting callers wait until every issued store write has settled.
// ABOUTME: Waits on the tracker's completion signal, bounded by a timeout.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

/// The pending-write count did not reach zero in time.
#[derive(Debug, Error)]
#[error("pending writes did not settle within {timeout:?} ({pending} still in flight)")]
pub struct TimeoutError {
    pub timeout: Duration,
    pub pending: usize,
}

/// Observes a store's pending-write count.
#[derive(Clone)]
pub struct WriteBarrier {
    count: watch::Receiver<usize>,
}

impl WriteBarrier {
    pub fn new(count: watch::Receiver<usize>) -> Self {
        Self { count }
    }

    /// Resolve once no write is outstanding, or fail after `timeout`.
    /// Dropping the returned future abandons the wait; nothing else cancels it.
    pub async fn flush_pending_writes(&self, timeout: Duration) -> Result<(), TimeoutError> {
        let mut count = self.count.clone();
        let waited = tokio::time::timeout(timeout, async {
            // An error means the tracker is gone, and with it every write guard.
            count.wait_for(|pending| *pending == 0).await.map(|_| ())
        })
        .await;

        match waited {
            Ok(_) => Ok(()),
            Err(_) => Err(TimeoutError {
                timeout,
                pending: *count.borrow(),
            }),
        }
    }
}
