use crate::error::*;
use log::*;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Bounded pool for blocking units of work (archive parsing, extraction,
/// relocation). Sized independently of how many jobs are downloading.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        WorkerPool {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Queues `unit` and resolves once it has run to completion. A started
    /// unit is never cancelled, even if the returned future is dropped.
    pub async fn run<F, T>(&self, unit: F) -> AddonResult<T>
    where
        F: FnOnce() -> AddonResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| AddonError::WorkerError(format!("worker pool closed: {}", err)))?;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            unit()
        });

        handle.await.map_err(|err| {
            error!("worker unit did not complete: {}", err);
            AddonError::WorkerError(err.to_string())
        })?
    }
}
