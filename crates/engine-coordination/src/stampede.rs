//! Cache-stampede recompute guard (spec §4.2): first arrival takes a lock
//! and recomputes; everyone else polls the cache until the value appears or
//! they give up with a transient error.

use crate::lock::LockService;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StampedeError {
    #[error("timed out waiting for another recompute to populate the cache")]
    TimedOut,
    #[error("lock backend unavailable: {0}")]
    LockUnavailable(String),
}

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    pub deadline: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            deadline: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampedeOutcome {
    /// This caller won the race and recomputed the value itself.
    Recomputed,
    /// Another caller recomputed; this caller observed the populated cache.
    ObservedFromCache,
}

pub struct StampedeGuard {
    locks: Arc<dyn LockService>,
    lock_ttl: Duration,
    poll: PollConfig,
}

impl StampedeGuard {
    pub fn new(locks: Arc<dyn LockService>, lock_ttl: Duration, poll: PollConfig) -> Self {
        Self {
            locks,
            lock_ttl,
            poll,
        }
    }

    /// `probe` checks whether the value is already cached; `compute`
    /// recomputes and writes it back to the cache. Only the lock winner
    /// calls `compute`; everyone else polls `probe`.
    pub async fn run<T, ProbeFut, ComputeFut>(
        &self,
        key: &str,
        holder_id: &str,
        probe: impl Fn() -> ProbeFut,
        compute: impl FnOnce() -> ComputeFut,
    ) -> Result<(StampedeOutcome, Option<T>), StampedeError>
    where
        ProbeFut: Future<Output = Option<T>>,
        ComputeFut: Future<Output = T>,
    {
        if let Some(value) = probe().await {
            return Ok((StampedeOutcome::ObservedFromCache, Some(value)));
        }

        let acquired = self
            .locks
            .acquire(key, self.lock_ttl, holder_id)
            .await
            .map_err(|e| StampedeError::LockUnavailable(e.to_string()))?;

        if acquired {
            let value = compute().await;
            let _ = self.locks.release(key, holder_id).await;
            return Ok((StampedeOutcome::Recomputed, Some(value)));
        }

        let deadline = Instant::now() + self.poll.deadline;
        while Instant::now() < deadline {
            if let Some(value) = probe().await {
                return Ok((StampedeOutcome::ObservedFromCache, Some(value)));
            }
            sleep(self.poll.interval).await;
        }

        Err(StampedeError::TimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct AlwaysWinsLock;

    #[async_trait]
    impl LockService for AlwaysWinsLock {
        async fn acquire(
            &self,
            _key: &str,
            _ttl: Duration,
            _holder_id: &str,
        ) -> Result<bool, crate::lock::LockError> {
            Ok(true)
        }

        async fn release(&self, _key: &str, _holder_id: &str) -> Result<bool, crate::lock::LockError> {
            Ok(true)
        }

        async fn extend(
            &self,
            _key: &str,
            _holder_id: &str,
            _ttl: Duration,
        ) -> Result<bool, crate::lock::LockError> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn lock_winner_recomputes_exactly_once() {
        let guard = StampedeGuard::new(Arc::new(AlwaysWinsLock), Duration::from_secs(10), PollConfig::default());
        let computed = AtomicBool::new(false);

        let (outcome, value) = guard
            .run(
                "derived:wf/a",
                "holder-1",
                || async { None::<u32> },
                || async {
                    computed.store(true, Ordering::SeqCst);
                    42
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome, StampedeOutcome::Recomputed);
        assert_eq!(value, Some(42));
        assert!(computed.load(Ordering::SeqCst));
    }
}
