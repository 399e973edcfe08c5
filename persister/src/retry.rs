use async_trait::async_trait;
use shared::{Error, Result};
use std::time::Duration;
use tracing::debug;

/// Handed to a [`RetryPolicy`] every time a save fails
#[derive(Debug)]
pub struct RetryContext<C> {
    /// Snapshot whose save just failed
    pub persisted_client: C,
    pub error: Error,
    /// Consecutive failures within the current save, starting at 1
    pub error_count: u32,
}

/// Decides what to do after a failed save.
///
/// `Ok(Some(snapshot))` saves `snapshot` next (it may be the same one, or a trimmed
/// version of it); `Ok(None)` abandons the save. An `Err` aborts the save as well and is
/// reported to the persister's error hook.
///
/// The persister puts no upper bound on retries: a policy that never returns `None`
/// keeps the save loop running for as long as the backend keeps failing.
#[async_trait]
pub trait RetryPolicy<C>: Send + Sync + 'static
where
    C: Send + 'static,
{
    async fn retry(&self, context: RetryContext<C>) -> Result<Option<C>>;
}

/// Adapter turning a plain closure into a [`RetryPolicy`]
pub struct FnRetry<F>(F);

pub fn retry_fn<F>(f: F) -> FnRetry<F> {
    FnRetry(f)
}

#[async_trait]
impl<C, F> RetryPolicy<C> for FnRetry<F>
where
    C: Send + 'static,
    F: Fn(RetryContext<C>) -> Option<C> + Send + Sync + 'static,
{
    async fn retry(&self, context: RetryContext<C>) -> Result<Option<C>> {
        Ok((self.0)(context))
    }
}

/// Exponential delay between attempts, capped at `max`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay before the attempt following failure number `error_count`
    pub fn delay(&self, error_count: u32) -> Duration {
        let shift = error_count.saturating_sub(1).min(16);
        self.initial
            .saturating_mul(1u32 << shift)
            .min(self.max)
    }
}

/// Resaves the same snapshot until `max_attempts` saves have been tried in total
#[derive(Clone, Copy, Debug)]
pub struct BoundedRetry {
    max_attempts: u32,
    backoff: Option<Backoff>,
}

impl BoundedRetry {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[async_trait]
impl<C> RetryPolicy<C> for BoundedRetry
where
    C: Send + 'static,
{
    async fn retry(&self, context: RetryContext<C>) -> Result<Option<C>> {
        if context.error_count >= self.max_attempts {
            debug!(
                "Giving up after {} failed save attempt(s): {}",
                context.error_count, context.error
            );
            return Ok(None);
        }

        if let Some(backoff) = self.backoff {
            tokio::time::sleep(backoff.delay(context.error_count)).await;
        }

        Ok(Some(context.persisted_client))
    }
}
