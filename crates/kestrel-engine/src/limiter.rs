use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};

pub const DEFAULT_MAX_CONCURRENCY: usize = 3;

/// Bounds how many tool executions run at once. Waiters are served FIFO.
pub struct ToolRunner {
    limit: usize,
    permits: Arc<Semaphore>,
    queued: Mutex<CancellationToken>,
}

impl ToolRunner {
    pub fn new(limit: usize) -> Result<Self> {
        if limit == 0 {
            return Err(EngineError::InvalidArgument("concurrency limit must be positive".into()));
        }
        Ok(Self {
            limit,
            permits: Arc::new(Semaphore::new(limit)),
            queued: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Executions currently holding a slot.
    pub fn active(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    /// Wait for a slot, then run `fut`. Fails with `Cancelled` if [`clear`](Self::clear)
    /// is called while still waiting.
    pub async fn run<T>(&self, fut: impl Future<Output = T>) -> Result<T> {
        let cancelled = self.queued.lock().clone();
        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| EngineError::Cancelled)?
            }
            _ = cancelled.cancelled() => return Err(EngineError::Cancelled),
        };
        let out = fut.await;
        drop(permit);
        Ok(out)
    }

    /// Cancel every queued task that has not started. Running tasks finish.
    pub fn clear(&self) {
        let mut queued = self.queued.lock();
        queued.cancel();
        *queued = CancellationToken::new();
    }
}

/// Render a caught panic payload.
pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
