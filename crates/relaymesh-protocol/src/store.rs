//! Search-state persistence.
//!
//! A relaying agent records where each search came from and where it was
//! sent, so later frames of the same transaction can be routed back. The
//! record is keyed by request id and must never outlive the transaction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::types::{PeerId, RequestId};

/// What a relaying hop remembers about one search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchState {
    pub id: RequestId,
    pub start: PeerId,
    /// Set once a downstream agent accepted the search.
    pub stop: Option<PeerId>,
    /// Channel the search arrived on.
    pub start_relay: PeerId,
    /// Channel the search was last forwarded on.
    pub stop_relay: Option<PeerId>,
    /// Channels already tried, in order.
    pub tried: Vec<PeerId>,
    /// Hop count of the frame as it arrived here.
    pub hops: u32,
}

impl SearchState {
    pub fn new(id: RequestId, start: PeerId, start_relay: PeerId, hops: u32) -> Self {
        Self {
            id,
            start,
            stop: None,
            start_relay,
            stop_relay: None,
            tried: Vec::new(),
            hops,
        }
    }

    /// The recorded party on the other side of `from`, if any.
    pub fn other_party(&self, from: &PeerId) -> Option<&PeerId> {
        if *from == self.start_relay {
            self.stop_relay.as_ref()
        } else if self.stop_relay.as_ref() == Some(from) {
            Some(&self.start_relay)
        } else {
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another writer already holds state for this id.
    #[error("search {id} already has state")]
    Conflict { id: RequestId },

    #[error("store backend: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Backend(format!("corrupt state: {e}"))
    }
}

/// Async key-value store for [`SearchState`].
#[async_trait::async_trait]
pub trait SearchStore: Send + Sync {
    async fn get(&self, id: &RequestId) -> Result<Option<SearchState>, StoreError>;

    /// Insert if absent; a concurrent holder makes this a `Conflict`.
    async fn create(&self, state: &SearchState) -> Result<(), StoreError>;

    /// Overwrite.
    async fn put(&self, state: &SearchState) -> Result<(), StoreError>;

    /// Remove. Deleting a missing id is not an error.
    async fn del(&self, id: &RequestId) -> Result<(), StoreError>;
}

// ── MemoryStore ───────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    states: HashMap<RequestId, SearchState>,
    fail_reads: bool,
    fail_writes: bool,
    fail_deletes: bool,
    /// Upcoming `create` calls that lose to a concurrent writer.
    lost_races: usize,
}

/// In-process store. Cloning shares the same map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `get` fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    /// The next `n` calls to `create` report a `Conflict`.
    pub fn lose_create_races(&self, n: usize) {
        self.lock().lost_races = n;
    }

    /// Make every `create`/`put` fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Make every `del` fail.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.lock().fail_deletes = fail;
    }

    pub fn len(&self) -> usize {
        self.lock().states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // A poisoned map is still a consistent map.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait::async_trait]
impl SearchStore for MemoryStore {
    async fn get(&self, id: &RequestId) -> Result<Option<SearchState>, StoreError> {
        let inner = self.lock();
        if inner.fail_reads {
            return Err(StoreError::Backend("read refused".into()));
        }
        Ok(inner.states.get(id).cloned())
    }

    async fn create(&self, state: &SearchState) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(StoreError::Backend("write refused".into()));
        }
        if inner.lost_races > 0 || inner.states.contains_key(&state.id) {
            inner.lost_races = inner.lost_races.saturating_sub(1);
            return Err(StoreError::Conflict {
                id: state.id.clone(),
            });
        }
        inner.states.insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn put(&self, state: &SearchState) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(StoreError::Backend("write refused".into()));
        }
        inner.states.insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn del(&self, id: &RequestId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.fail_deletes {
            return Err(StoreError::Backend("delete refused".into()));
        }
        inner.states.remove(id);
        Ok(())
    }
}

// ── SqliteStore ───────────────────────────────────────────────────────

/// SQLite-backed store; in-flight searches survive a restart.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS search_state (
                id      TEXT PRIMARY KEY,
                state   TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait::async_trait]
impl SearchStore for SqliteStore {
    async fn get(&self, id: &RequestId) -> Result<Option<SearchState>, StoreError> {
        let raw: Option<String> = self
            .lock()
            .query_row(
                "SELECT state FROM search_state WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, state: &SearchState) -> Result<(), StoreError> {
        let json = serde_json::to_string(state)?;
        let changed = self.lock().execute(
            "INSERT OR IGNORE INTO search_state (id, state) VALUES (?1, ?2)",
            params![state.id.as_str(), json],
        )?;
        if changed == 0 {
            return Err(StoreError::Conflict {
                id: state.id.clone(),
            });
        }
        Ok(())
    }

    async fn put(&self, state: &SearchState) -> Result<(), StoreError> {
        let json = serde_json::to_string(state)?;
        self.lock().execute(
            "INSERT OR REPLACE INTO search_state (id, state) VALUES (?1, ?2)",
            params![state.id.as_str(), json],
        )?;
        Ok(())
    }

    async fn del(&self, id: &RequestId) -> Result<(), StoreError> {
        self.lock()
            .execute("DELETE FROM search_state WHERE id = ?1", params![id.as_str()])?;
        Ok(())
    }
}
