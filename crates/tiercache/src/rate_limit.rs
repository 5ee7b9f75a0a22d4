//! Bucketed rate limiting on top of the item API.
//!
//! An item's usage is counted in a series of time buckets; a slot is granted
//! while the sum across the buckets stays below the item's limit.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{CacheError, Result};
use crate::item::RateLimitableItem;
use crate::manager::Manager;
use crate::provider::RateLimitReservation;

impl Manager {
    fn validate_rate_limited<T: RateLimitableItem>(&self, item: &T) -> Result<()> {
        item.validate().map_err(|reason| {
            error!(type_name = std::any::type_name::<T>(), reason = %reason, "rate-limited item failed validation");
            CacheError::Validation(reason)
        })
    }

    /// Checks (and with `take_slot`, takes) a slot for `item`.
    pub async fn reserve_rate_limit_slot<T: RateLimitableItem>(
        &self,
        item: &T,
        take_slot: bool,
    ) -> Result<RateLimitReservation> {
        self.validate_rate_limited(item)?;
        let keys = item.rate_limit_keys(self.names());
        self.provider()
            .reserve_rate_limit_slot(&keys, item.rate_limit(), item.ttl(self.ttls()), take_slot)
            .await
    }

    /// Gives back a slot and returns the remaining total.
    pub async fn release_rate_limit_slot<T: RateLimitableItem>(&self, item: &T) -> Result<i64> {
        self.validate_rate_limited(item)?;
        let keys = item.rate_limit_keys(self.names());
        self.provider().release_rate_limit_slot(&keys).await
    }

    /// Polls until a slot is taken, sleeping `backoff(attempt)` in between.
    ///
    /// Returns the total after the reservation, or [`CacheError::Cancelled`]
    /// once `cancel` fires.
    pub async fn wait_for_rate_limit_slot<T, F>(
        &self,
        item: &T,
        backoff: F,
        cancel: &CancellationToken,
    ) -> Result<i64>
    where
        T: RateLimitableItem,
        F: Fn(u32) -> Duration,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            let reservation = self.reserve_rate_limit_slot(item, true).await?;
            if reservation.reserved {
                return Ok(reservation.total_slots);
            }

            let delay = backoff(attempt);
            debug!(attempt, total = reservation.total_slots, delay_ms = delay.as_millis() as u64, "rate limit reached, waiting");
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = cancel.cancelled() => return Err(CacheError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
