//! Session store backed by redb embedded database.
//!
//! Provides persistent storage for federation sessions with:
//! - In-memory cache for hot sessions
//! - TTL-based expiry

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};

use super::types::{FederationSession, SessionId};

/// redb table for sessions (key: session_id hex, value: MessagePack bytes).
const SESSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("shib_sessions");

/// Session store with in-memory cache and persistent storage.
pub struct SessionStore {
    /// redb database handle.
    db: Database,

    /// In-memory cache for frequently accessed sessions.
    cache: RwLock<HashMap<SessionId, FederationSession>>,

    /// Default session TTL in seconds.
    default_ttl_secs: u64,

    /// Maximum number of sessions to keep in cache.
    max_cache_size: usize,
}

impl SessionStore {
    /// Open or create a session store at the given path.
    pub fn open(path: PathBuf, default_ttl_secs: u64) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open session database: {:?}", path))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SESSIONS_TABLE)?;
        }
        write_txn.commit()?;

        let cache = Self::load_active_sessions(&db)?;
        debug!(sessions = cache.len(), "Loaded active sessions into cache");

        Ok(Self {
            db,
            cache: RwLock::new(cache),
            default_ttl_secs,
            max_cache_size: 10000,
        })
    }

    /// Get default TTL in seconds.
    pub fn default_ttl_secs(&self) -> u64 {
        self.default_ttl_secs
    }

    /// Start and persist a fresh session with the default TTL.
    pub fn create(&self) -> Result<FederationSession> {
        let session = FederationSession::new(self.default_ttl_secs);
        self.save(&session)?;
        Ok(session)
    }

    /// Get session by ID, updating last_accessed time.
    pub fn get(&self, id: SessionId) -> Result<Option<FederationSession>> {
        // Check cache first
        if let Ok(mut cache) = self.cache.write() {
            if let Some(session) = cache.get_mut(&id) {
                if session.is_expired() {
                    cache.remove(&id);
                    // Left in the database for the cleanup task
                    return Ok(None);
                }
                session.touch();
                return Ok(Some(session.clone()));
            }
        }

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;

        let key = id.to_hex();
        match table.get(key.as_str())? {
            Some(value) => {
                let mut session: FederationSession = rmp_serde::from_slice(value.value())
                    .context("Failed to deserialize session")?;

                if session.is_expired() {
                    return Ok(None);
                }

                session.touch();
                self.cache_session(&session);
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Look up a session, starting a fresh one when it is unknown or expired.
    pub fn get_or_create(&self, id: Option<SessionId>) -> Result<FederationSession> {
        if let Some(id) = id {
            if let Some(session) = self.get(id)? {
                return Ok(session);
            }
            debug!(session_id = %id, "Session unknown or expired, starting a new one");
        }
        self.create()
    }

    /// Persist a session after a request has mutated it.
    pub fn save(&self, session: &FederationSession) -> Result<()> {
        let data = rmp_serde::to_vec_named(session).context("Failed to serialize session")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            table.insert(session.id.to_hex().as_str(), data.as_slice())?;
        }
        write_txn.commit()?;

        self.cache_session(session);
        Ok(())
    }

    /// Delete a session by ID.
    pub fn delete(&self, id: SessionId) -> Result<bool> {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(&id);
        }

        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            let key = id.to_hex();
            let result = table.remove(key.as_str())?;
            result.is_some()
        };
        write_txn.commit()?;

        Ok(removed)
    }

    /// Evict all expired sessions. Returns the number of sessions evicted.
    pub fn evict_expired(&self) -> Result<usize> {
        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|_, session| !session.is_expired());
        }

        let expired: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SESSIONS_TABLE)?;

            let mut ids = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                match rmp_serde::from_slice::<FederationSession>(value.value()) {
                    Ok(session) if session.is_expired() => {
                        ids.push(key.value().to_string());
                    }
                    Err(e) => {
                        warn!(key = key.value(), error = %e, "Failed to deserialize session, marking for deletion");
                        ids.push(key.value().to_string());
                    }
                    _ => {}
                }
            }
            ids
        };

        if expired.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()?;
        let mut evicted = 0;
        {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            for key in &expired {
                if table.remove(key.as_str())?.is_some() {
                    evicted += 1;
                }
            }
        }
        write_txn.commit()?;

        Ok(evicted)
    }

    /// Get session count (for metrics).
    pub fn session_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;
        Ok(table.len()? as usize)
    }

    fn cache_session(&self, session: &FederationSession) {
        if let Ok(mut cache) = self.cache.write() {
            if cache.len() >= self.max_cache_size && !cache.contains_key(&session.id) {
                Self::evict_cache_lru(&mut cache);
            }
            cache.insert(session.id, session.clone());
        }
    }

    /// Load all non-expired sessions into cache.
    fn load_active_sessions(db: &Database) -> Result<HashMap<SessionId, FederationSession>> {
        let mut sessions = HashMap::new();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;

        for entry in table.iter()? {
            let (_, value) = entry?;
            match rmp_serde::from_slice::<FederationSession>(value.value()) {
                Ok(session) if !session.is_expired() => {
                    sessions.insert(session.id, session);
                }
                _ => {}
            }
        }

        Ok(sessions)
    }

    /// Evict least recently accessed session from cache.
    fn evict_cache_lru(cache: &mut HashMap<SessionId, FederationSession>) {
        if let Some(oldest_id) = cache
            .iter()
            .min_by_key(|(_, s)| s.last_accessed)
            .map(|(id, _)| *id)
        {
            cache.remove(&oldest_id);
        }
    }
}
