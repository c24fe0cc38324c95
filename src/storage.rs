//! Key-value stores for sessions and user statistics.
//!
//! The engine only sees the traits; backends are swapped behind `Arc<dyn _>`.
//! Stores make no transactional promises: read-modify-write sequencing is
//! done by the callers (`Statistics::modify`, the engine's per-user locks).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info};
use teloxide::dispatching::dialogue::{serializer::Json, SqliteStorage, SqliteStorageError, Storage};
use teloxide::types::ChatId;
use thiserror::Error;

use crate::quiz::{Session, UserId, UserStatistics};

/// Errors surfaced by storage backends.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, user: UserId) -> Result<Option<Session>, StorageError>;

    async fn set(&self, user: UserId, session: Session) -> Result<(), StorageError>;

    /// Missing sessions are not an error.
    async fn remove(&self, user: UserId) -> Result<(), StorageError>;
}

#[async_trait]
pub trait StatisticsStore: Send + Sync {
    async fn get(&self, user: UserId) -> Result<Option<UserStatistics>, StorageError>;

    async fn set(&self, user: UserId, stats: UserStatistics) -> Result<(), StorageError>;

    async fn remove(&self, user: UserId) -> Result<(), StorageError>;
}

/// Sessions kept in process memory.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<Mutex<HashMap<UserId, Session>>>,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, user: UserId) -> Result<Option<Session>, StorageError> {
        let guard = self
            .sessions
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(guard.get(&user).cloned())
    }

    async fn set(&self, user: UserId, session: Session) -> Result<(), StorageError> {
        let mut guard = self
            .sessions
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        guard.insert(user, session);
        Ok(())
    }

    async fn remove(&self, user: UserId) -> Result<(), StorageError> {
        let mut guard = self
            .sessions
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        guard.remove(&user);
        Ok(())
    }
}

/// Sessions kept in teloxide's SQLite dialogue table, one JSON row per chat.
///
/// Users talk to the bot in private chats, so the user id doubles as the
/// chat id.
pub struct SqliteSessionStore {
    storage: Arc<SqliteStorage<Json>>,
}

impl SqliteSessionStore {
    /// Open or create the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Connection` if the database cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let url = path.to_string_lossy();
        let storage = SqliteStorage::open(&url, Json)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        info!("Sessions are stored in {}", path.display());
        Ok(Self { storage })
    }
}

fn chat_of(user: UserId) -> ChatId {
    ChatId(user.0 as i64)
}

fn sqlite_error<E: std::fmt::Debug + std::fmt::Display>(e: SqliteStorageError<E>) -> StorageError {
    match e {
        SqliteStorageError::SerdeError(e) => StorageError::Serialization(e.to_string()),
        other => StorageError::Connection(other.to_string()),
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, user: UserId) -> Result<Option<Session>, StorageError> {
        Storage::<Session>::get_dialogue(self.storage.clone(), chat_of(user))
            .await
            .map_err(sqlite_error)
    }

    async fn set(&self, user: UserId, session: Session) -> Result<(), StorageError> {
        self.storage
            .clone()
            .update_dialogue(chat_of(user), session)
            .await
            .map_err(sqlite_error)
    }

    async fn remove(&self, user: UserId) -> Result<(), StorageError> {
        match Storage::<Session>::remove_dialogue(self.storage.clone(), chat_of(user)).await {
            Ok(()) | Err(SqliteStorageError::DialogueNotFound) => Ok(()),
            Err(e) => Err(sqlite_error(e)),
        }
    }
}

/// Statistics kept in process memory; lost on restart.
#[derive(Clone, Default)]
pub struct InMemoryStatisticsStore {
    entries: Arc<Mutex<HashMap<UserId, UserStatistics>>>,
}

impl InMemoryStatisticsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatisticsStore for InMemoryStatisticsStore {
    async fn get(&self, user: UserId) -> Result<Option<UserStatistics>, StorageError> {
        let guard = self
            .entries
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(guard.get(&user).cloned())
    }

    async fn set(&self, user: UserId, stats: UserStatistics) -> Result<(), StorageError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        guard.insert(user, stats);
        Ok(())
    }

    async fn remove(&self, user: UserId) -> Result<(), StorageError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        guard.remove(&user);
        Ok(())
    }
}

/// Statistics persisted as one JSON document, rewritten on every change.
pub struct JsonFileStatisticsStore {
    path: PathBuf,
    entries: tokio::sync::Mutex<BTreeMap<UserId, UserStatistics>>,
}

impl JsonFileStatisticsStore {
    /// Load the file at `path`, starting empty if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the file exists but cannot be read or parsed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        info!("Loaded statistics for {} users from {}", entries.len(), path.display());
        Ok(Self {
            path,
            entries: tokio::sync::Mutex::new(entries),
        })
    }

    async fn flush(&self, entries: &BTreeMap<UserId, UserStatistics>) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(entries)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Statistics written to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl StatisticsStore for JsonFileStatisticsStore {
    async fn get(&self, user: UserId) -> Result<Option<UserStatistics>, StorageError> {
        Ok(self.entries.lock().await.get(&user).cloned())
    }

    async fn set(&self, user: UserId, stats: UserStatistics) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        entries.insert(user, stats);
        self.flush(&entries).await
    }

    async fn remove(&self, user: UserId) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        if entries.remove(&user).is_some() {
            self.flush(&entries).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quiz::SelectionStep;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ent-quiz-{}-{}.json", name, std::process::id()))
    }

    #[tokio::test]
    async fn in_memory_sessions_are_isolated_per_user() {
        let store = InMemorySessionStore::new();
        store.set(UserId(1), Session::default()).await.unwrap();

        assert!(store.get(UserId(1)).await.unwrap().is_some());
        assert!(store.get(UserId(2)).await.unwrap().is_none());

        store.remove(UserId(1)).await.unwrap();
        assert!(store.get(UserId(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_sessions_survive_reopen() {
        let path = temp_path("sessions").with_extension("sqlite");
        let _ = std::fs::remove_file(&path);
        let session = Session::selecting(SelectionStep::Profile2 {
            first: "Физика".into(),
        });

        {
            let store = SqliteSessionStore::open(&path).await.unwrap();
            store.set(UserId(5), session.clone()).await.unwrap();
            store.remove(UserId(6)).await.unwrap();
        }

        let reopened = SqliteSessionStore::open(&path).await.unwrap();
        let restored = reopened.get(UserId(5)).await.unwrap().unwrap();
        assert_eq!(restored.stage(), session.stage());
        reopened.remove(UserId(5)).await.unwrap();
        assert!(reopened.get(UserId(5)).await.unwrap().is_none());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn json_store_survives_reopen() {
        let path = temp_path("reopen");
        let _ = std::fs::remove_file(&path);

        let mut stats = UserStatistics::default();
        stats.tests_passed = 3;
        stats.scores_by_subject.insert("Физика".into(), vec![80.0, 60.0]);

        {
            let store = JsonFileStatisticsStore::open(&path).await.unwrap();
            store.set(UserId(42), stats.clone()).await.unwrap();
        }

        let reopened = JsonFileStatisticsStore::open(&path).await.unwrap();
        assert_eq!(reopened.get(UserId(42)).await.unwrap(), Some(stats));
        assert_eq!(reopened.get(UserId(7)).await.unwrap(), None);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn json_store_rejects_corrupt_file() {
        let path = temp_path("corrupt");
        std::fs::write(&path, b"{ not json").unwrap();

        let result = JsonFileStatisticsStore::open(&path).await;
        assert!(matches!(result, Err(StorageError::Serialization(_))));

        let _ = std::fs::remove_file(&path);
    }
}
