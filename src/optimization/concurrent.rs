//! Bounded fan-out of independent work units.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::config::ConcurrentConfig;
use super::errors::OptimizationError;

pub struct ConcurrentExecutor {
    max_concurrency: usize,
}

impl ConcurrentExecutor {
    pub fn new(config: &ConcurrentConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Run every unit on its own task, at most `max_concurrency` at once.
    ///
    /// Each unit gets a child of `token`; one unit failing does not cancel the
    /// others. Results come back in input order. A unit still waiting for a
    /// permit when the token fires is skipped and reported as
    /// [`OptimizationError::NotStarted`].
    pub async fn run_all<T, F, Fut>(
        &self,
        token: &CancellationToken,
        units: Vec<F>,
    ) -> Vec<Result<T, OptimizationError>>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let handles: Vec<_> = units
            .into_iter()
            .map(|unit| {
                let child = token.child_token();
                let semaphore = Arc::clone(&semaphore);
                tokio::spawn(async move {
                    let permit = tokio::select! {
                        biased;
                        _ = child.cancelled() => None,
                        permit = semaphore.acquire_owned() => permit.ok(),
                    };
                    let _permit = permit?;
                    Some(unit(child).await)
                })
            })
            .collect();

        futures::future::join_all(handles)
            .await
            .into_iter()
            .enumerate()
            .map(|(index, joined)| match joined {
                Ok(Some(output)) => Ok(output),
                Ok(None) => Err(OptimizationError::NotStarted { index }),
                Err(e) => Err(OptimizationError::TaskFailed {
                    index,
                    reason: e.to_string(),
                }),
            })
            .collect()
    }
}
