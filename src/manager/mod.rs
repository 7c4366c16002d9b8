//! Upstream Connection Manager (§4.1) — owns `server_name → Client`,
//! reconciles that map with the loaded config, and routes every user
//! operation and tool call to the right client.

use std::collections::HashMap;
use std::sync::Arc;

use rmcp::model::{CallToolResult, Tool};
use tokio::sync::RwLock;

use crate::config::{diff, ProxyConfig, Server, StartupMode};
use crate::error::{ProxyError, ProxyResult};
use crate::scheduler::Scheduler;
use crate::store::Persistence;
use crate::upstream::client::ManagedClient;
use crate::upstream::state_machine::ConnectionState;

/// Servers in these startup modes are brought up eagerly by the scheduler
/// on reconcile. `lazy_loading` connects on first call instead (§4.1 "Key
/// algorithms"); `disabled`/`auto_disabled` stay down until re-enabled.
/// `quarantined` is included because inspection (tool-list refresh) is
/// still allowed even though execution is blocked (SPEC_FULL.md Open
/// Question resolution).
fn eligible_for_bringup(mode: StartupMode) -> bool {
    matches!(mode, StartupMode::Active | StartupMode::Quarantined)
}

/// The UI display bucket a server falls into (I6): a pure function of
/// `startup_mode` and `ConnectionState`, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiBucket {
    Connected,
    Connecting,
    Sleeping,
    Stopped,
    Disabled,
    Quarantined,
    AutoDisabled,
}

pub fn derive_bucket(startup_mode: StartupMode, connection_state: ConnectionState) -> UiBucket {
    match startup_mode {
        StartupMode::Disabled => UiBucket::Disabled,
        StartupMode::Quarantined => UiBucket::Quarantined,
        StartupMode::AutoDisabled => UiBucket::AutoDisabled,
        StartupMode::LazyLoading => UiBucket::Sleeping,
        StartupMode::Active => match connection_state {
            ConnectionState::Ready => UiBucket::Connected,
            ConnectionState::Disconnected | ConnectionState::Error => UiBucket::Stopped,
            ConnectionState::Connecting
            | ConnectionState::Authenticating
            | ConnectionState::Discovering => UiBucket::Connecting,
        },
    }
}

#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub name: String,
    pub startup_mode: StartupMode,
    pub connection_state: ConnectionState,
    pub bucket: UiBucket,
    pub tool_count: usize,
    pub last_error: Option<String>,
}

/// Owns every `ManagedClient` and dispatches §4.1's public operations.
pub struct UpstreamManager {
    clients: RwLock<HashMap<String, Arc<ManagedClient>>>,
    persistence: Arc<Persistence>,
    scheduler: Arc<Scheduler>,
    default_threshold: u32,
    persist_auto_disable_to_config: bool,
}

impl UpstreamManager {
    pub fn new(
        persistence: Arc<Persistence>,
        scheduler: Arc<Scheduler>,
        default_threshold: u32,
        persist_auto_disable_to_config: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            persistence,
            scheduler,
            default_threshold,
            persist_auto_disable_to_config,
        })
    }

    /// Construct a client and reseed its runtime `startup_mode` from the
    /// KV record if it disagrees with config (S4): with
    /// `persist_auto_disable_to_config=false` (the default), an
    /// auto-disable never touches config's `startup_mode`, so after a
    /// restart a freshly constructed client would otherwise start
    /// `Active` and get swept back into the bring-up wave — exactly the
    /// re-attempt the scenario forbids.
    async fn spawn_client(&self, server: Server) -> Arc<ManagedClient> {
        let threshold = server.auto_disable_threshold.unwrap_or(self.default_threshold);
        let name = server.name.clone();
        let client = Arc::new(ManagedClient::new(
            server,
            threshold,
            self.persistence.clone(),
            self.persistence.event_bus().clone(),
            self.persist_auto_disable_to_config,
        ));

        if let Ok(record) = self.persistence.record(&name) {
            if record.server_state == StartupMode::AutoDisabled {
                client
                    .seed_runtime_startup_mode(StartupMode::AutoDisabled)
                    .await;
            }
        }
        client
    }

    /// Reconcile the client map with a newly loaded config (§4.1 "Key
    /// algorithms"): add new entries, remove gone ones, atomically
    /// replace clients whose transport changed. Rejected wholesale on
    /// validation failure — no partial application.
    pub async fn reconcile(&self, new_config: &ProxyConfig) -> ProxyResult<()> {
        new_config.validate()?;
        let old_snapshot = self.persistence.snapshot_config().await;
        let d = diff::diff(&old_snapshot.mcp_servers, &new_config.mcp_servers);

        self.persistence.replace_config(new_config.clone()).await?;

        let mut clients = self.clients.write().await;
        for name in d.removed.iter().chain(d.transport_changed.iter()) {
            if let Some(client) = clients.remove(name) {
                client.disconnect().await;
            }
        }
        let mut to_bring_up = Vec::new();
        for name in d.added.iter().chain(d.transport_changed.iter()) {
            if let Some(server) = new_config.find_server(name).cloned() {
                let client = self.spawn_client(server).await;
                // Read back the client's live startup_mode (possibly
                // reseeded from KV in `spawn_client`) rather than the
                // stale config-derived value, so a DB-only auto-disable
                // is respected (S4).
                let eligible = eligible_for_bringup(client.startup_mode().await);
                clients.insert(name.clone(), client.clone());
                if eligible {
                    to_bring_up.push(client);
                }
            }
        }
        drop(clients);

        tracing::info!(
            added = d.added.len(),
            removed = d.removed.len(),
            transport_changed = d.transport_changed.len(),
            metadata_changed = d.metadata_changed.len(),
            "reconciled upstream manager with new config"
        );

        if !to_bring_up.is_empty() {
            let scheduler = self.scheduler.clone();
            tokio::spawn(async move {
                let _ = scheduler.start(to_bring_up).await;
            });
        }
        Ok(())
    }

    /// Bring up every currently eligible client under the scheduler's
    /// concurrency cap (spec.md §2 dataflow: "Scheduler brings clients up
    /// under a concurrency cap"). Called once at process startup after
    /// the first `reconcile`.
    pub async fn bring_up_all(&self) -> crate::scheduler::SchedulerResult {
        let eligible: Vec<_> = {
            let clients = self.clients.read().await;
            let mut out = Vec::new();
            for client in clients.values() {
                if eligible_for_bringup(client.startup_mode().await) {
                    out.push(client.clone());
                }
            }
            out
        };
        self.scheduler.start(eligible).await
    }

    pub async fn clients_snapshot(&self) -> Vec<Arc<ManagedClient>> {
        self.clients.read().await.values().cloned().collect()
    }

    async fn get_client(&self, name: &str) -> ProxyResult<Arc<ManagedClient>> {
        self.clients
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::UnknownServer(name.to_string()))
    }

    /// `EnableServer(name, enabled)` (§4.1).
    pub async fn enable_server(&self, name: &str, enabled: bool) -> ProxyResult<()> {
        let mode = if enabled { StartupMode::Active } else { StartupMode::Disabled };
        self.persistence.set_startup_mode(name, mode, true).await?;
        let client = self.get_client(name).await?;
        client.set_startup_mode(mode).await?;

        if enabled {
            let client = client.clone();
            tokio::spawn(async move {
                let _ = client.connect_and_discover().await;
            });
        } else {
            client.disconnect().await;
        }
        Ok(())
    }

    /// `Quarantine(name, q)` — same shape as enable, but blocks tool
    /// execution while still allowing inspection (ListTools still works;
    /// see `ManagedClient::call_tool`).
    pub async fn quarantine(&self, name: &str, quarantined: bool) -> ProxyResult<()> {
        let mode = if quarantined { StartupMode::Quarantined } else { StartupMode::Active };
        self.persistence.set_startup_mode(name, mode, true).await?;
        let client = self.get_client(name).await?;
        client.set_startup_mode(mode).await?;
        Ok(())
    }

    /// `StopUpstream(name)` — runtime-only disconnect, config intent
    /// untouched.
    pub async fn stop_upstream(&self, name: &str) -> ProxyResult<()> {
        let client = self.get_client(name).await?;
        client.disconnect().await;
        Ok(())
    }

    /// `Unstop(name)` — runtime-only reconnect.
    pub async fn unstop(&self, name: &str) -> ProxyResult<()> {
        let client = self.get_client(name).await?;
        client.connect_and_discover().await
    }

    pub async fn restart_upstream(&self, name: &str) -> ProxyResult<()> {
        let client = self.get_client(name).await?;
        client.disconnect().await;
        client.connect_and_discover().await
    }

    /// `OauthLogin(name)` — force a fresh connect, driving the client
    /// through `Authenticating` again.
    pub async fn oauth_login(&self, name: &str) -> ProxyResult<()> {
        let client = self.get_client(name).await?;
        client.disconnect().await;
        client.connect_and_discover().await
    }

    /// `SetGroup(name, group_id)` — move a server between groups (S5).
    /// Config-only; no client state is affected.
    pub async fn set_group(&self, name: &str, group_id: Option<i64>) -> ProxyResult<()> {
        self.get_client(name).await?;
        self.persistence.set_group(name, group_id).await
    }

    /// `ListServers()` — snapshot with derived UI bucket (I6).
    pub async fn list_servers(&self) -> Vec<ServerStatus> {
        let clients = self.clients.read().await;
        let mut out = Vec::with_capacity(clients.len());
        for client in clients.values() {
            let startup_mode = client.startup_mode().await;
            let connection_state = client.connection_state().await;
            out.push(ServerStatus {
                name: client.name.clone(),
                startup_mode,
                connection_state,
                bucket: derive_bucket(startup_mode, connection_state),
                tool_count: client.tools().await.len(),
                last_error: client.last_error().await,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// `GetTools(name)` — cached tool list from the last Discovering
    /// phase. Quarantined servers may still be inspected.
    pub async fn get_tools(&self, name: &str) -> ProxyResult<Vec<Tool>> {
        let client = self.get_client(name).await?;
        if !client.is_ready().await {
            return Err(ProxyError::NotReady(name.to_string()));
        }
        Ok(client.tools().await)
    }

    /// `CallTool(name, tool, args, ctx)` — a `lazy_loading` server is
    /// promoted to `active` and connected on first call instead of
    /// failing fast (§4.1 "Key algorithms").
    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        args: serde_json::Value,
    ) -> ProxyResult<CallToolResult> {
        let client = self.get_client(name).await?;

        if client.startup_mode().await == StartupMode::LazyLoading {
            self.persistence
                .set_startup_mode(name, StartupMode::Active, true)
                .await?;
            client.set_startup_mode(StartupMode::Active).await?;
            client.connect_and_discover().await?;
        }

        client.call_tool(tool, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::events::EventBus;
    use crate::store::kv::{KvStore, UpstreamRecord};
    use std::collections::HashMap as StdHashMap;

    fn server(name: &str, mode: StartupMode) -> Server {
        Server {
            name: name.to_string(),
            protocol: Protocol::Stdio,
            command: Some("definitely-not-a-real-binary-xyz".to_string()),
            args: vec![],
            env: StdHashMap::new(),
            working_dir: None,
            url: None,
            headers: StdHashMap::new(),
            oauth: None,
            startup_mode: mode,
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

    async fn test_manager(mode: StartupMode) -> (Arc<UpstreamManager>, Arc<Persistence>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::temporary().unwrap();
        kv.put(&UpstreamRecord::new("s1", mode)).unwrap();
        let mut config = ProxyConfig::default();
        config.mcp_servers.push(server("s1", mode));
        let path = dir.path().join("mcpproxy.json");
        let persistence = Persistence::new(kv, ProxyConfig::default(), path, EventBus::new());
        let scheduler = crate::scheduler::Scheduler::new(crate::scheduler::SchedulerConfig::with_workers(2));
        let manager = UpstreamManager::new(persistence.clone(), scheduler, 5, false);
        manager.reconcile(&config).await.unwrap();
        // reconcile() fires off bring-up in a detached task; give it a
        // moment so tests observing connection_state see a settled value.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        (manager, persistence, dir)
    }

    /// S4: a server that was auto-disabled in KV only (config still says
    /// `active`) must not be re-attempted by the scheduler after the
    /// manager is rebuilt across a restart.
    #[tokio::test]
    async fn kv_auto_disable_survives_restart_without_reconnect_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::temporary().unwrap();
        let mut record = UpstreamRecord::new("s1", StartupMode::AutoDisabled);
        record.auto_disable_reason = Some("connection refused".to_string());
        kv.put(&record).unwrap();

        let mut config = ProxyConfig::default();
        config.mcp_servers.push(server("s1", StartupMode::Active));
        let path = dir.path().join("mcpproxy.json");
        let persistence = Persistence::new(kv, ProxyConfig::default(), path, EventBus::new());
        let scheduler = crate::scheduler::Scheduler::new(crate::scheduler::SchedulerConfig::with_workers(2));
        let manager = UpstreamManager::new(persistence.clone(), scheduler, 5, false);
        manager.reconcile(&config).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let statuses = manager.list_servers().await;
        assert_eq!(statuses[0].startup_mode, StartupMode::AutoDisabled);
        assert_eq!(statuses[0].bucket, UiBucket::AutoDisabled);
        // Config's own record of intent is untouched — only the runtime
        // state machine was reseeded.
        assert_eq!(
            persistence.snapshot_config().await.find_server("s1").unwrap().startup_mode,
            StartupMode::Active
        );
    }

    #[tokio::test]
    async fn reconcile_adds_and_removes_clients() {
        let (manager, _persistence, _dir) = test_manager(StartupMode::Active).await;
        assert_eq!(manager.clients_snapshot().await.len(), 1);

        let empty_config = ProxyConfig::default();
        manager.reconcile(&empty_config).await.unwrap();
        assert!(manager.clients_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn enable_server_persists_and_updates_client() {
        let (manager, persistence, _dir) = test_manager(StartupMode::Active).await;
        manager.enable_server("s1", false).await.unwrap();

        let record = persistence.record("s1").unwrap();
        assert_eq!(record.server_state, StartupMode::Disabled);

        let statuses = manager.list_servers().await;
        assert_eq!(statuses[0].startup_mode, StartupMode::Disabled);
        assert_eq!(statuses[0].bucket, UiBucket::Disabled);
    }

    #[tokio::test]
    async fn quarantined_server_bucket_is_quarantined() {
        let (manager, _persistence, _dir) = test_manager(StartupMode::Active).await;
        manager.quarantine("s1", true).await.unwrap();
        let statuses = manager.list_servers().await;
        assert_eq!(statuses[0].bucket, UiBucket::Quarantined);
    }

    #[tokio::test]
    async fn get_tools_fails_fast_when_not_ready() {
        let (manager, _persistence, _dir) = test_manager(StartupMode::Active).await;
        let result = manager.get_tools("s1").await;
        assert!(matches!(result, Err(ProxyError::NotReady(_))));
    }

    #[tokio::test]
    async fn unknown_server_operations_fail_with_unknown_server() {
        let (manager, _persistence, _dir) = test_manager(StartupMode::Active).await;
        assert!(matches!(
            manager.stop_upstream("ghost").await,
            Err(ProxyError::UnknownServer(_))
        ));
    }

    #[tokio::test]
    async fn set_group_moves_server_and_updates_config() {
        let (manager, persistence, _dir) = test_manager(StartupMode::Active).await;
        let mut config = persistence.snapshot_config().await;
        config.groups.push(crate::config::Group {
            id: 5,
            name: "infra".to_string(),
            icon_emoji: None,
            color: None,
            enabled: true,
            description: None,
        });
        persistence.replace_config(config).await.unwrap();

        manager.set_group("s1", Some(5)).await.unwrap();
        let snapshot = persistence.snapshot_config().await;
        assert_eq!(snapshot.find_server("s1").unwrap().group_id, Some(5));
    }

    #[tokio::test]
    async fn set_group_on_unknown_server_fails() {
        let (manager, _persistence, _dir) = test_manager(StartupMode::Active).await;
        assert!(matches!(
            manager.set_group("ghost", Some(1)).await,
            Err(ProxyError::UnknownServer(_))
        ));
    }

    #[tokio::test]
    async fn lazy_loading_server_promotes_to_active_on_call() {
        let (manager, persistence, _dir) = test_manager(StartupMode::LazyLoading).await;
        let _ = manager.call_tool("s1", "noop", serde_json::json!({})).await;

        let record = persistence.record("s1").unwrap();
        assert_eq!(record.server_state, StartupMode::Active);
    }
}
