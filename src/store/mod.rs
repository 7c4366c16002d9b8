//! Dual-Store State Persistence (§4.5) — two-phase commit between the KV
//! store (runtime reality) and the JSON config file (user intent).
//!
//! Ownership: `Persistence` exclusively owns the KV store handle and the
//! in-memory config struct (guarded by an `RwLock`, per §5's "Shared-
//! resource policy"). Clients hold a back-reference to `Persistence` for
//! writes; never the reverse (§3 "Ownership").

pub mod kv;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::{self, diff, ProxyConfig, Server, StartupMode};
use crate::error::{ProxyError, ProxyResult};
use crate::events::{now_millis, Event, EventBus};
use kv::{KvStore, UpstreamRecord};

pub struct Persistence {
    kv: KvStore,
    config: RwLock<ProxyConfig>,
    config_path: PathBuf,
    bus: EventBus,
}

impl Persistence {
    pub fn new(kv: KvStore, config: ProxyConfig, config_path: PathBuf, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            kv,
            config: RwLock::new(config),
            config_path,
            bus,
        })
    }

    pub async fn snapshot_config(&self) -> ProxyConfig {
        self.config.read().await.clone()
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn record(&self, name: &str) -> ProxyResult<UpstreamRecord> {
        self.kv
            .get(name)?
            .ok_or_else(|| ProxyError::UnknownServer(name.to_string()))
    }

    /// Reconciliation on startup / after a config reload (§4.5
    /// "Reconciliation on startup", I2): upsert a KV record for each
    /// config entry (preserving runtime fields already present), delete
    /// KV records whose config entry is gone.
    pub fn reconcile_kv(&self, config: &ProxyConfig) -> ProxyResult<()> {
        let existing = self.kv.list()?;
        let configured: std::collections::HashSet<&str> =
            config.mcp_servers.iter().map(|s| s.name.as_str()).collect();

        for record in &existing {
            if !configured.contains(record.name.as_str()) {
                tracing::info!(server = %record.name, "deleting orphaned KV record");
                self.kv.delete(&record.name)?;
            }
        }

        for server in &config.mcp_servers {
            if self.kv.get(&server.name)?.is_none() {
                let record = UpstreamRecord::new(&server.name, server.startup_mode);
                self.kv.put(&record)?;
            }
        }
        Ok(())
    }

    /// Two-phase commit: write the KV record first (Phase A), then — if
    /// `persist_to_config` is set — mutate the in-memory config and
    /// atomically rewrite the config file (Phase B). If Phase B fails,
    /// the KV record is rolled back to its pre-transaction value and the
    /// original error is returned (spec.md §4.5 "Rollback").
    pub async fn set_startup_mode(
        &self,
        name: &str,
        mode: StartupMode,
        persist_to_config: bool,
    ) -> ProxyResult<()> {
        let previous = self.record(name)?;
        let mut updated = previous.clone();
        updated.server_state = mode;
        updated.updated_at = now_millis();
        self.kv.put(&updated)?;

        if !persist_to_config {
            return Ok(());
        }

        let mut guard = self.config.write().await;
        if !guard.mcp_servers.iter().any(|s| s.name == name) {
            self.kv.put(&previous)?;
            return Err(ProxyError::UnknownServer(name.to_string()));
        }

        let mut candidate = guard.clone();
        let old_servers = guard.mcp_servers.clone();
        {
            let server = candidate
                .mcp_servers
                .iter_mut()
                .find(|s| s.name == name)
                .expect("checked above");
            server.startup_mode = mode;
        }

        match config::write_atomic(&self.config_path, &candidate) {
            Ok(()) => {
                let d = diff::diff(&old_servers, &candidate.mcp_servers);
                *guard = candidate;
                drop(guard);
                self.bus.publish(Event::ConfigChanged {
                    diff: d,
                    timestamp: now_millis(),
                });
                Ok(())
            }
            Err(e) => {
                // Rollback: the in-memory config was never mutated (we
                // mutated a clone), so only the KV record needs reverting.
                self.kv.put(&previous)?;
                Err(e)
            }
        }
    }

    /// Move a server to a different group (S5). Same two-phase shape as
    /// `set_startup_mode`, but mutates `group_id` in config only — the KV
    /// record is untouched since group membership is not runtime state.
    pub async fn set_group(&self, name: &str, group_id: Option<i64>) -> ProxyResult<()> {
        let mut guard = self.config.write().await;
        if !guard.mcp_servers.iter().any(|s| s.name == name) {
            return Err(ProxyError::UnknownServer(name.to_string()));
        }
        if let Some(gid) = group_id {
            if !guard.groups.iter().any(|g| g.id == gid) {
                return Err(ProxyError::Validation(format!("unknown group_id {gid}")));
            }
        }

        let mut candidate = guard.clone();
        let old_servers = guard.mcp_servers.clone();
        {
            let server = candidate
                .mcp_servers
                .iter_mut()
                .find(|s| s.name == name)
                .expect("checked above");
            server.group_id = group_id;
        }

        config::write_atomic(&self.config_path, &candidate)?;
        let d = diff::diff(&old_servers, &candidate.mcp_servers);
        *guard = candidate;
        drop(guard);
        self.bus.publish(Event::ConfigChanged {
            diff: d,
            timestamp: now_millis(),
        });
        Ok(())
    }

    /// Record a successful connect + tool discovery (KV-only — runtime
    /// reality, §3 "Authoritative source rules").
    pub fn record_connection_success(&self, name: &str, tool_count: usize) -> ProxyResult<()> {
        let mut record = self.record(name)?;
        record.ever_connected = true;
        record.last_successful_connection = Some(now_millis());
        record.tool_count = tool_count;
        record.updated_at = now_millis();
        self.kv.put(&record)
    }

    /// Persist the opaque refreshed OAuth token bytes from the last
    /// `Authenticating` step (§4.2 "OAuth": "persist the refreshed token
    /// blob as opaque bytes, then proceed to Discovering"). KV-only —
    /// runtime reality, not user intent — so no config write is involved.
    pub fn set_oauth_token(&self, name: &str, token: Vec<u8>) -> ProxyResult<()> {
        let mut record = self.record(name)?;
        record.oauth_token = Some(token);
        record.updated_at = now_millis();
        self.kv.put(&record)
    }

    /// Record an auto-disable decision. Always writes the KV record;
    /// only writes to config if `persist_to_config` is true (default
    /// false — spec.md §4.2 "Persistence policy").
    pub async fn record_auto_disable(
        &self,
        name: &str,
        reason: &str,
        persist_to_config: bool,
    ) -> ProxyResult<()> {
        let mut record = self.record(name)?;
        record.server_state = StartupMode::AutoDisabled;
        record.auto_disable_reason = Some(reason.to_string());
        record.updated_at = now_millis();
        self.kv.put(&record)?;

        self.bus.publish(Event::ServerAutoDisabled {
            server_name: name.to_string(),
            reason: reason.to_string(),
            consecutive_failures: 0,
            timestamp: now_millis(),
        });

        if persist_to_config {
            self.set_startup_mode(name, StartupMode::AutoDisabled, true)
                .await?;
        }
        Ok(())
    }

    /// Apply a freshly loaded config from the Config Loader/Watcher (§4.6)
    /// or from `UpstreamManager::reconcile`. Updates the in-memory
    /// snapshot and reconciles the KV store; does not touch the config
    /// file — the caller already read it from disk, so this is the read
    /// path for external changes, not a write path.
    pub async fn replace_config(&self, new_config: ProxyConfig) -> ProxyResult<()> {
        let old_servers = self.config.read().await.mcp_servers.clone();
        self.reconcile_kv(&new_config)?;
        let d = diff::diff(&old_servers, &new_config.mcp_servers);
        *self.config.write().await = new_config;
        self.bus.publish(Event::ConfigChanged {
            diff: d,
            timestamp: now_millis(),
        });
        Ok(())
    }

    pub async fn find_server(&self, name: &str) -> Option<Server> {
        self.config
            .read()
            .await
            .mcp_servers
            .iter()
            .find(|s| s.name == name)
            .cloned()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use std::collections::HashMap;

    fn server(name: &str) -> Server {
        Server {
            name: name.to_string(),
            protocol: Protocol::Stdio,
            command: Some("true".to_string()),
            args: vec![],
            env: HashMap::new(),
            working_dir: None,
            url: None,
            headers: HashMap::new(),
            oauth: None,
            startup_mode: StartupMode::Active,
            group_id: None,
            group_name: None,
            repository_url: None,
            isolation: None,
            auto_disable_threshold: None,
            enabled: None,
            stopped: None,
            quarantined: None,
            auto_disabled: None,
        }
    }

    async fn test_persistence() -> (Arc<Persistence>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::temporary().unwrap();
        let mut config = ProxyConfig::default();
        config.mcp_servers.push(server("s1"));
        kv.put(&UpstreamRecord::new("s1", StartupMode::Active)).unwrap();
        let path = dir.path().join("mcpproxy.json");
        let persistence = Persistence::new(kv, config, path, EventBus::new());
        (persistence, dir)
    }

    #[tokio::test]
    async fn set_startup_mode_persists_to_both_stores() {
        let (p, _dir) = test_persistence().await;
        p.set_startup_mode("s1", StartupMode::Disabled, true)
            .await
            .unwrap();

        let record = p.record("s1").unwrap();
        assert_eq!(record.server_state, StartupMode::Disabled);

        let config = p.snapshot_config().await;
        assert_eq!(
            config.find_server("s1").unwrap().startup_mode,
            StartupMode::Disabled
        );
    }

    #[tokio::test]
    async fn set_oauth_token_persists_opaque_bytes() {
        let (p, _dir) = test_persistence().await;
        p.set_oauth_token("s1", vec![1, 2, 3]).unwrap();

        let record = p.record("s1").unwrap();
        assert_eq!(record.oauth_token, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn db_only_auto_disable_leaves_config_untouched() {
        let (p, _dir) = test_persistence().await;
        p.record_auto_disable("s1", "connection refused", false)
            .await
            .unwrap();

        let record = p.record("s1").unwrap();
        assert_eq!(record.server_state, StartupMode::AutoDisabled);

        let config = p.snapshot_config().await;
        assert_eq!(
            config.find_server("s1").unwrap().startup_mode,
            StartupMode::Active
        );
    }

    #[tokio::test]
    async fn rollback_on_config_write_failure_reverts_kv() {
        let dir = tempfile::tempdir().unwrap();
        // Point the config path at a directory instead of a file, so the
        // atomic rename-over-target fails deterministically.
        let bogus_path = dir.path().join("not-a-dir").join("mcpproxy.json");
        std::fs::create_dir_all(&bogus_path).unwrap();
        let kv = KvStore::temporary().unwrap();
        kv.put(&UpstreamRecord::new("s1", StartupMode::Active)).unwrap();
        let mut config = ProxyConfig::default();
        config.mcp_servers.push(server("s1"));
        let persistence = Persistence::new(kv, config, bogus_path, EventBus::new());

        let result = persistence
            .set_startup_mode("s1", StartupMode::Disabled, true)
            .await;
        assert!(result.is_err());

        let record = persistence.record("s1").unwrap();
        assert_eq!(record.server_state, StartupMode::Active);
    }

    #[tokio::test]
    async fn replace_config_reconciles_kv_and_publishes_diff() {
        let (p, _dir) = test_persistence().await;
        let mut new_config = ProxyConfig::default();
        new_config.mcp_servers.push(server("s2"));

        p.replace_config(new_config).await.unwrap();

        assert!(p.kv().get("s1").unwrap().is_none());
        assert!(p.kv().get("s2").unwrap().is_some());
        let snapshot = p.snapshot_config().await;
        assert_eq!(snapshot.mcp_servers.len(), 1);
        assert_eq!(snapshot.mcp_servers[0].name, "s2");
    }

    #[tokio::test]
    async fn reconcile_deletes_orphans_and_upserts_new() {
        let (p, _dir) = test_persistence().await;
        p.kv().put(&UpstreamRecord::new("orphan", StartupMode::Active)).unwrap();

        let mut new_config = ProxyConfig::default();
        new_config.mcp_servers.push(server("s1"));
        new_config.mcp_servers.push(server("s2"));

        p.reconcile_kv(&new_config).unwrap();

        assert!(p.kv().get("orphan").unwrap().is_none());
        assert!(p.kv().get("s1").unwrap().is_some());
        assert!(p.kv().get("s2").unwrap().is_some());
    }
}
