//! Free-tier quota: a sliding-window count of recent generations.
//!
//! Timestamps live in [`UserStatistics::recent_generations`]. Only entries
//! younger than the window count. Taking a slot prunes expired entries,
//! checks the count and appends "now" in a single update.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};

use crate::quiz::{Statistics, UserId, UserStatistics};
use crate::storage::StorageError;
use crate::time::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub limit: usize,
    pub window: Duration,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            limit: 4,
            window: Duration::hours(24),
        }
    }
}

impl QuotaPolicy {
    fn used(&self, stats: &UserStatistics, now: DateTime<Utc>) -> usize {
        stats
            .recent_generations
            .iter()
            .filter(|at| now - **at < self.window)
            .count()
    }
}

/// Outcome of asking for a generation slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Premium user; nothing was counted.
    Unmetered,
    /// A slot stamped with this instant was taken.
    Counted(DateTime<Utc>),
    Denied,
}

impl Admission {
    pub fn is_denied(&self) -> bool {
        matches!(self, Admission::Denied)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    statistics: Statistics,
    policy: QuotaPolicy,
    clock: Clock,
}

impl RateLimiter {
    pub fn new(statistics: Statistics, policy: QuotaPolicy) -> Self {
        Self {
            statistics,
            policy,
            clock: Clock::default(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> QuotaPolicy {
        self.policy
    }

    /// Check the quota and take a slot in one statistics update, so two
    /// overlapping generations of the same user cannot both slip under the
    /// limit.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the user's statistics cannot be updated.
    pub async fn try_acquire(&self, user: UserId) -> Result<Admission, StorageError> {
        let now = self.clock.now();
        let policy = self.policy;
        let admission = self
            .statistics
            .modify(user, move |stats| {
                if stats.is_premium {
                    return Admission::Unmetered;
                }
                stats.recent_generations.retain(|at| now - *at < policy.window);
                if policy.used(stats, now) >= policy.limit {
                    return Admission::Denied;
                }
                stats.recent_generations.push(now);
                Admission::Counted(now)
            })
            .await?;
        match admission {
            Admission::Counted(_) => debug!("User {} took a generation slot", user),
            Admission::Denied => info!("User {} is out of free generations", user),
            Admission::Unmetered => {}
        }
        Ok(admission)
    }

    /// Give back a slot taken by [`RateLimiter::try_acquire`] for a
    /// generation that did not complete.
    pub async fn release(&self, user: UserId, admission: Admission) -> Result<(), StorageError> {
        let Admission::Counted(at) = admission else {
            return Ok(());
        };
        self.statistics
            .modify(user, move |stats| {
                if let Some(i) = stats.recent_generations.iter().position(|t| *t == at) {
                    stats.recent_generations.remove(i);
                }
            })
            .await?;
        debug!("User {} got a generation slot back", user);
        Ok(())
    }

    /// Forget all recent generations of a user.
    pub async fn reset(&self, user: UserId) -> Result<(), StorageError> {
        self.statistics
            .modify(user, |stats| stats.recent_generations.clear())
            .await?;
        info!("User {} generation counter reset", user);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStatisticsStore;
    use crate::time::fixed_now;
    use std::sync::Arc;

    fn limiter_at(statistics: &Statistics, at: DateTime<Utc>) -> RateLimiter {
        RateLimiter::new(statistics.clone(), QuotaPolicy::default()).with_clock(Clock::fixed(at))
    }

    fn statistics() -> Statistics {
        Statistics::new(Arc::new(InMemoryStatisticsStore::new()))
    }

    async fn fill(stats: &Statistics, user: UserId, start: DateTime<Utc>, n: i64) {
        for hour in 0..n {
            let admission = limiter_at(stats, start + Duration::hours(hour))
                .try_acquire(user)
                .await
                .unwrap();
            assert!(matches!(admission, Admission::Counted(_)));
        }
    }

    #[tokio::test]
    async fn fifth_generation_in_window_is_denied() {
        let stats = statistics();
        let user = UserId(1);
        let start = fixed_now();
        fill(&stats, user, start, 4).await;

        let limiter = limiter_at(&stats, start + Duration::hours(5));
        assert_eq!(limiter.try_acquire(user).await.unwrap(), Admission::Denied);
        assert_eq!(stats.get(user).await.unwrap().recent_generations.len(), 4);
    }

    #[tokio::test]
    async fn quota_frees_up_when_oldest_entry_ages_out() {
        let stats = statistics();
        let user = UserId(2);
        let start = fixed_now();
        fill(&stats, user, start, 4).await;

        let before = limiter_at(&stats, start + Duration::hours(24) - Duration::seconds(1));
        assert!(before.try_acquire(user).await.unwrap().is_denied());

        // Exactly 24h after the first entry it is no longer "younger" than the window.
        let edge = limiter_at(&stats, start + Duration::hours(24));
        assert_eq!(
            edge.try_acquire(user).await.unwrap(),
            Admission::Counted(start + Duration::hours(24))
        );
    }

    #[tokio::test]
    async fn acquiring_prunes_expired_timestamps() {
        let stats = statistics();
        let user = UserId(3);
        let start = fixed_now();
        fill(&stats, user, start, 1).await;

        limiter_at(&stats, start + Duration::hours(30))
            .try_acquire(user)
            .await
            .unwrap();

        let record = stats.get(user).await.unwrap();
        assert_eq!(record.recent_generations, vec![start + Duration::hours(30)]);
    }

    #[tokio::test]
    async fn premium_users_bypass_and_are_not_tracked() {
        let stats = statistics();
        let user = UserId(4);
        stats.set_premium(user, true).await.unwrap();
        let limiter = limiter_at(&stats, fixed_now());

        for _ in 0..10 {
            assert_eq!(limiter.try_acquire(user).await.unwrap(), Admission::Unmetered);
        }
        assert!(stats.get(user).await.unwrap().recent_generations.is_empty());
    }

    #[tokio::test]
    async fn released_slot_can_be_taken_again() {
        let stats = statistics();
        let user = UserId(5);
        let start = fixed_now();
        fill(&stats, user, start, 3).await;
        let limiter = limiter_at(&stats, start + Duration::hours(4));

        let last = limiter.try_acquire(user).await.unwrap();
        assert!(limiter.try_acquire(user).await.unwrap().is_denied());
        limiter.release(user, last).await.unwrap();

        assert_eq!(stats.get(user).await.unwrap().recent_generations.len(), 3);
        assert!(!limiter.try_acquire(user).await.unwrap().is_denied());
    }

    #[tokio::test]
    async fn reset_clears_the_window() {
        let stats = statistics();
        let user = UserId(6);
        fill(&stats, user, fixed_now(), 4).await;
        let limiter = limiter_at(&stats, fixed_now() + Duration::hours(5));
        assert!(limiter.try_acquire(user).await.unwrap().is_denied());

        limiter.reset(user).await.unwrap();
        assert!(!limiter.try_acquire(user).await.unwrap().is_denied());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquisitions_never_exceed_the_limit() {
        let stats = statistics();
        let user = UserId(7);
        let start = fixed_now();
        fill(&stats, user, start, 3).await;
        let limiter = limiter_at(&stats, start + Duration::hours(4));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.try_acquire(user).await.unwrap() })
            })
            .collect();
        let mut granted = 0;
        for handle in handles {
            if !handle.await.unwrap().is_denied() {
                granted += 1;
            }
        }

        assert_eq!(granted, 1);
        assert_eq!(stats.get(user).await.unwrap().recent_generations.len(), 4);
    }
}
