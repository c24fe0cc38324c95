use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::quiz::UserId;
use crate::storage::{StatisticsStore, StorageError};

/// Per-user counters shared by every session of that user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserStatistics {
    pub tests_passed: u32,
    pub scores_by_subject: BTreeMap<String, Vec<f64>>,
    pub is_premium: bool,
    pub recent_generations: Vec<DateTime<Utc>>,
}

/// What the user sees on the statistics screen.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSummary {
    pub tests_passed: u32,
    /// Average percentage per subject; `None` when no score is recorded yet.
    pub averages: Vec<(String, Option<f64>)>,
}

impl StatsSummary {
    pub fn is_empty(&self) -> bool {
        self.tests_passed == 0 && self.averages.is_empty()
    }
}

impl From<&UserStatistics> for StatsSummary {
    fn from(stats: &UserStatistics) -> Self {
        let averages = stats
            .scores_by_subject
            .iter()
            .map(|(subject, scores)| {
                let average = if scores.is_empty() {
                    None
                } else {
                    Some(scores.iter().sum::<f64>() / scores.len() as f64)
                };
                (subject.clone(), average)
            })
            .collect();
        Self {
            tests_passed: stats.tests_passed,
            averages,
        }
    }
}

/// Statistics access with serialized read-modify-write.
///
/// Every update goes through [`Statistics::modify`], which holds a single
/// async lock while it reads, edits and writes back a user's record, so
/// concurrent completions never lose an update.
#[derive(Clone)]
pub struct Statistics {
    store: Arc<dyn StatisticsStore>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Statistics {
    pub fn new(store: Arc<dyn StatisticsStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub async fn get(&self, user: UserId) -> Result<UserStatistics, StorageError> {
        Ok(self.store.get(user).await?.unwrap_or_default())
    }

    /// Apply `f` to the user's record and store the result atomically.
    ///
    pub async fn modify<F, R>(&self, user: UserId, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&mut UserStatistics) -> R + Send,
        R: Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut stats = self.store.get(user).await?.unwrap_or_default();
        let result = f(&mut stats);
        self.store.set(user, stats).await?;
        Ok(result)
    }

    pub async fn is_premium(&self, user: UserId) -> Result<bool, StorageError> {
        Ok(self.get(user).await?.is_premium)
    }

    pub async fn set_premium(&self, user: UserId, is_premium: bool) -> Result<(), StorageError> {
        self.modify(user, |stats| stats.is_premium = is_premium).await?;
        info!("Premium status of user {} set to {}", user, is_premium);
        Ok(())
    }

    /// Append one percentage per subject and count one passed test.
    ///
    pub async fn record_completed_test(
        &self,
        user: UserId,
        scores: Vec<(String, f64)>,
    ) -> Result<u32, StorageError> {
        let passed = self
            .modify(user, move |stats| {
                for (subject, percentage) in scores {
                    stats.scores_by_subject.entry(subject).or_default().push(percentage);
                }
                stats.tests_passed += 1;
                stats.tests_passed
            })
            .await?;
        info!("User {} has now passed {} tests", user, passed);
        Ok(passed)
    }

    pub async fn summary(&self, user: UserId) -> Result<StatsSummary, StorageError> {
        Ok(StatsSummary::from(&self.get(user).await?))
    }

    pub async fn clear(&self, user: UserId) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        self.store.remove(user).await?;
        info!("Statistics of user {} cleared", user);
        Ok(())
    }
}
