//! Concurrency controller
//!
//! One counting permit pool per top-level run. Every suspendable node body,
//! at any nesting depth and in any batch item, takes one permit from the
//! same pool, so nested graphs never multiply the configured limit.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::error::RunError;

/// Shared permit pool. Cloning shares the pool.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyController {
    semaphore: Option<Arc<Semaphore>>,
    limit: Option<usize>,
}

/// Held while a suspendable node body runs; released on drop
#[derive(Debug)]
pub struct Permit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl ConcurrencyController {
    /// Create a controller; `None` means unlimited
    pub fn new(max_concurrency: Option<usize>) -> Self {
        match max_concurrency {
            Some(limit) => {
                let limit = limit.max(1);
                Self {
                    semaphore: Some(Arc::new(Semaphore::new(limit))),
                    limit: Some(limit),
                }
            }
            None => Self::unlimited(),
        }
    }

    /// A controller that never blocks
    pub fn unlimited() -> Self {
        Self {
            semaphore: None,
            limit: None,
        }
    }

    /// Configured limit, if any
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Permits currently free, `None` when unlimited
    pub fn available_permits(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }

    /// Wait for a permit
    pub async fn acquire(&self) -> Result<Permit, RunError> {
        match &self.semaphore {
            Some(semaphore) => {
                let permit = Arc::clone(semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| RunError::internal("concurrency pool closed"))?;
                Ok(Permit {
                    _permit: Some(permit),
                })
            }
            None => Ok(Permit { _permit: None }),
        }
    }
}
