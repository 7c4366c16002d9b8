//! The embedded KV store half of Dual-Store Persistence (§4.5, §6).
//!
//! One `sled` tree keyed by server name; each value is the upstream
//! record serialized as JSON (spec.md §6 permits "JSON, MessagePack, or
//! framed protobuf" — JSON keeps this consistent with the rest of the
//! crate's serialization). `sled::Tree::flush` is called on every write so
//! a commit is durable before the caller observes success.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::StartupMode;
use crate::error::{PersistError, ProxyResult};
use crate::events::now_millis;

/// The persisted runtime record for one upstream (§3 "Upstream record").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamRecord {
    pub name: String,
    /// Mirrors `startup_mode` but may diverge for DB-only auto-disable
    /// (I3).
    pub server_state: StartupMode,
    pub ever_connected: bool,
    pub last_successful_connection: Option<u64>,
    pub tool_count: usize,
    pub auto_disable_reason: Option<String>,
    /// Opaque refreshed OAuth token bytes from the last `Authenticating`
    /// step (§4.2 "OAuth"). KV-only, never written to the config file.
    #[serde(default)]
    pub oauth_token: Option<Vec<u8>>,
    pub updated_at: u64,
}

impl UpstreamRecord {
    pub fn new(name: impl Into<String>, server_state: StartupMode) -> Self {
        Self {
            name: name.into(),
            server_state,
            ever_connected: false,
            last_successful_connection: None,
            tool_count: 0,
            auto_disable_reason: None,
            oauth_token: None,
            updated_at: now_millis(),
        }
    }
}

pub struct KvStore {
    db: sled::Db,
}

impl KvStore {
    pub fn open(path: &Path) -> ProxyResult<Self> {
        let db = sled::open(path).map_err(PersistError::from)?;
        Ok(Self { db })
    }

    /// In-memory store for tests — no file handle, no fsync.
    #[cfg(test)]
    pub fn temporary() -> ProxyResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(PersistError::from)?;
        Ok(Self { db })
    }

    pub fn get(&self, name: &str) -> ProxyResult<Option<UpstreamRecord>> {
        let Some(bytes) = self.db.get(name.as_bytes()).map_err(PersistError::from)? else {
            return Ok(None);
        };
        let record: UpstreamRecord =
            serde_json::from_slice(&bytes).map_err(PersistError::from)?;
        Ok(Some(record))
    }

    /// Single-key transaction (sled inserts are already atomic per key);
    /// fsync on commit (spec.md §6).
    pub fn put(&self, record: &UpstreamRecord) -> ProxyResult<()> {
        let bytes = serde_json::to_vec(record).map_err(PersistError::from)?;
        self.db
            .insert(record.name.as_bytes(), bytes)
            .map_err(PersistError::from)?;
        self.db.flush().map_err(PersistError::from)?;
        Ok(())
    }

    pub fn delete(&self, name: &str) -> ProxyResult<()> {
        self.db.remove(name.as_bytes()).map_err(PersistError::from)?;
        self.db.flush().map_err(PersistError::from)?;
        Ok(())
    }

    pub fn list(&self) -> ProxyResult<Vec<UpstreamRecord>> {
        let mut records = Vec::new();
        for entry in self.db.iter() {
            let (_, bytes) = entry.map_err(PersistError::from)?;
            records.push(serde_json::from_slice(&bytes).map_err(PersistError::from)?);
        }
        Ok(records)
    }
}
