//! Managed Client (§4.2) — one upstream's connection lifecycle: owns its
//! transport handle and state machine exclusively (§3 "Ownership"),
//! holds a back-reference to Persistence for writes, and publishes every
//! transition on the Event Bus.

use std::sync::Arc;
use std::time::Instant;

use rmcp::model::{CallToolRequestParams, CallToolResult, Tool};
use tokio::sync::{Mutex, RwLock};

use crate::config::{Server, StartupMode};
use crate::error::{ProxyError, ProxyResult};
use crate::events::{now_millis, Event, EventBus};
use crate::store::Persistence;
use crate::upstream::state_machine::{ConnectionState, StateMachine};
use crate::upstream::transport::{self, Connection};

/// One upstream MCP server's live connection + state machine.
///
/// Transitions are serialized by `state` (spec.md §4.2 "Transitions are
/// serialized by a per-client lock"); `connection` and `tools` are
/// separate locks so a tool-list read never blocks behind a slow
/// reconnect.
pub struct ManagedClient {
    pub name: String,
    server: RwLock<Server>,
    state: Mutex<StateMachine>,
    connection: Mutex<Option<Connection>>,
    tools: RwLock<Vec<Tool>>,
    last_error: RwLock<Option<String>>,
    persistence: Arc<Persistence>,
    bus: EventBus,
    persist_auto_disable_to_config: bool,
}

impl ManagedClient {
    pub fn new(
        server: Server,
        threshold: u32,
        persistence: Arc<Persistence>,
        bus: EventBus,
        persist_auto_disable_to_config: bool,
    ) -> Self {
        let startup_mode = server.startup_mode;
        Self {
            name: server.name.clone(),
            server: RwLock::new(server),
            state: Mutex::new(StateMachine::new(startup_mode, threshold)),
            connection: Mutex::new(None),
            tools: RwLock::new(Vec::new()),
            last_error: RwLock::new(None),
            persistence,
            bus,
            persist_auto_disable_to_config,
        }
    }

    pub async fn startup_mode(&self) -> StartupMode {
        self.state.lock().await.startup_mode
    }

    /// Reseed the runtime state machine's `startup_mode` straight from a
    /// KV record discovered after construction (S4), bypassing the
    /// deny-by-default transition table — this isn't a user- or
    /// auto-disable-driven transition, it's restoring what the previous
    /// process already decided before config and KV could diverge.
    pub async fn seed_runtime_startup_mode(&self, mode: StartupMode) {
        self.state.lock().await.startup_mode = mode;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.state.lock().await.connection_state
    }

    pub async fn set_startup_mode_suspended(&self, suspended: bool) {
        self.state.lock().await.startup_mode_suspended = suspended;
    }

    pub async fn tools(&self) -> Vec<Tool> {
        self.tools.read().await.clone()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    pub async fn is_ready(&self) -> bool {
        self.connection_state().await == ConnectionState::Ready
    }

    pub async fn is_quarantined(&self) -> bool {
        self.startup_mode().await == StartupMode::Quarantined
    }

    /// Clear startup-mode suspension at the end of a scheduler wave
    /// (§4.3 step 5). Auto-disables now if the client qualifies.
    pub async fn finalize_after_wave(&self) {
        let decision = self.state.lock().await.clear_startup_mode();
        if let Some(decision) = decision {
            self.auto_disable(&decision.reason).await;
        }
    }

    /// Connect + discover tools (§4.2, §4.3 step 2). Drives
    /// `Disconnected → Connecting → [Authenticating] → Discovering →
    /// Ready`, or `→ Error` on failure.
    pub async fn connect_and_discover(&self) -> ProxyResult<()> {
        let started = Instant::now();
        let server = self.server.read().await.clone();

        self.transition(ConnectionState::Connecting).await?;

        if let Some(oauth) = &server.oauth {
            self.transition(ConnectionState::Authenticating).await?;
            match transport::run_oauth_flow(&server.name, oauth).await {
                Ok(token) => {
                    if let Err(e) = self.persistence.set_oauth_token(&self.name, token) {
                        tracing::warn!(server = %self.name, error = %e, "failed to persist oauth token");
                    }
                }
                Err(e) => return self.fail(&format!("oauth failed: {e}")).await,
            }
        }

        let connect_result = transport::connect(&server).await;
        let conn = match connect_result {
            Ok(conn) => conn,
            Err(e) => return self.fail(&format!("connect failed: {e}")).await,
        };

        self.transition(ConnectionState::Discovering).await?;

        let discovered = match conn.peer().list_all_tools().await {
            Ok(tools) => tools,
            Err(e) => return self.fail(&format!("tool discovery failed: {e}")).await,
        };

        *self.tools.write().await = discovered.clone();
        *self.connection.lock().await = Some(conn);
        self.transition(ConnectionState::Ready).await?;

        self.state.lock().await.on_success();
        *self.last_error.write().await = None;

        self.persistence
            .record_connection_success(&self.name, discovered.len())?;

        self.bus.publish(Event::ConnectionEstablished {
            server_name: self.name.clone(),
            tool_count: discovered.len(),
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: now_millis(),
        });
        self.bus.publish(Event::ToolsDiscovered {
            server_name: self.name.clone(),
            tool_count: discovered.len(),
            timestamp: now_millis(),
        });

        Ok(())
    }

    /// Record a failure, transitioning to `Error`. `ConnectionLost` fires
    /// only on this transition *into* `Error`, not on every retry
    /// (resolved Open Question, SPEC_FULL.md §9).
    async fn fail(&self, reason: &str) -> ProxyResult<()> {
        *self.last_error.write().await = Some(reason.to_string());
        self.tools.write().await.clear();
        *self.connection.lock().await = None;

        let old = self.state.lock().await.connection_state;
        self.state.lock().await.connection_state = ConnectionState::Error;
        if old != ConnectionState::Error {
            self.bus.publish(Event::ConnectionLost {
                server_name: self.name.clone(),
                reason: reason.to_string(),
                timestamp: now_millis(),
            });
        }

        let decision = self.state.lock().await.on_failure(reason);
        if let Some(decision) = decision {
            self.auto_disable(&decision.reason).await;
        }

        self.state.lock().await.connection_state = ConnectionState::Disconnected;
        Err(ProxyError::UpstreamError(self.name.clone(), reason.to_string()))
    }

    async fn auto_disable(&self, reason: &str) {
        tracing::warn!(server = %self.name, reason, "auto-disabling upstream");
        let mut state = self.state.lock().await;
        let _ = state.transition_startup_mode(StartupMode::AutoDisabled);
        drop(state);

        if let Err(e) = self
            .persistence
            .record_auto_disable(&self.name, reason, self.persist_auto_disable_to_config)
            .await
        {
            tracing::error!(server = %self.name, error = %e, "failed to persist auto-disable");
        }
    }

    async fn transition(&self, to: ConnectionState) -> ProxyResult<()> {
        let mut state = self.state.lock().await;
        let old = state.connection_state;
        state.transition_connection_state(to)?;
        drop(state);

        if old != to {
            self.bus.publish(Event::ServerStateChanged {
                server_name: self.name.clone(),
                old_state: format!("{old:?}"),
                new_state: format!("{to:?}"),
                timestamp: now_millis(),
            });
        }
        Ok(())
    }

    /// Set the configured `startup_mode` (user enable/disable/quarantine,
    /// auto-disable). Deny-by-default per the allowed-transition table.
    /// Publishes `ServerStateChanged` whenever the mode actually moves
    /// (S2) — same-state requests stay silent (testable property 3).
    pub async fn set_startup_mode(&self, mode: StartupMode) -> ProxyResult<bool> {
        let mut state = self.state.lock().await;
        let old = state.startup_mode;
        let changed = state.transition_startup_mode(mode)?;
        drop(state);

        if changed {
            self.bus.publish(Event::ServerStateChanged {
                server_name: self.name.clone(),
                old_state: format!("{old:?}"),
                new_state: format!("{mode:?}"),
                timestamp: now_millis(),
            });
        }
        Ok(changed)
    }

    /// Disconnect without touching configured intent (§4.1
    /// `StopUpstream`/`Unstop`). Routed through `transition()` so the
    /// `ConnectionState` change is visible on the bus like any other.
    pub async fn disconnect(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            let _ = conn.cancel().await;
        }
        self.tools.write().await.clear();
        let _ = self.transition(ConnectionState::Disconnected).await;
    }

    /// Forward a tool call to this upstream (§4.1 `CallTool`).
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> ProxyResult<CallToolResult> {
        if self.is_quarantined().await {
            return Err(ProxyError::Quarantined(self.name.clone()));
        }
        if !self.is_ready().await {
            return Err(ProxyError::NotReady(self.name.clone()));
        }

        let guard = self.connection.lock().await;
        let conn = guard
            .as_ref()
            .ok_or_else(|| ProxyError::NotReady(self.name.clone()))?;

        let params = CallToolRequestParams {
            name: tool_name.to_string().into(),
            arguments: arguments.as_object().cloned(),
            meta: None,
            task: None,
        };

        conn.peer()
            .call_tool(params)
            .await
            .map_err(|e| ProxyError::UpstreamError(self.name.clone(), e.to_string()))
    }

    /// Replace the declared transport config (used after Reconcile
    /// recreates a client whose transport changed).
    pub async fn current_server(&self) -> Server {
        self.server.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::store::kv::KvStore;
    use crate::store::kv::UpstreamRecord;
    use std::collections::HashMap;

    fn server(name: &str) -> Server {
        Server {
            name: name.to_string(),
            protocol: Protocol::Stdio,
            command: Some("definitely-not-a-real-binary-xyz".to_string()),
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

    fn test_persistence(name: &str) -> Arc<Persistence> {
        let kv = KvStore::temporary().unwrap();
        kv.put(&UpstreamRecord::new(name, StartupMode::Active)).unwrap();
        let mut config = crate::config::ProxyConfig::default();
        config.mcp_servers.push(server(name));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcpproxy.json");
        std::mem::forget(dir); // keep tempdir alive for test duration
        Persistence::new(kv, config, path, EventBus::new())
    }

    #[tokio::test]
    async fn quarantined_client_rejects_call_tool() {
        let persistence = test_persistence("s1");
        let client = ManagedClient::new(server("s1"), 3, persistence, EventBus::new(), false);
        client.set_startup_mode(StartupMode::Quarantined).await.unwrap();

        let result = client.call_tool("anything", serde_json::json!({})).await;
        assert!(matches!(result, Err(ProxyError::Quarantined(_))));
    }

    #[tokio::test]
    async fn not_ready_client_fails_fast() {
        let persistence = test_persistence("s1");
        let client = ManagedClient::new(server("s1"), 3, persistence, EventBus::new(), false);
        let result = client.call_tool("anything", serde_json::json!({})).await;
        assert!(matches!(result, Err(ProxyError::NotReady(_))));
    }

    #[tokio::test]
    async fn failed_connect_attempts_drive_auto_disable() {
        let persistence = test_persistence("s1");
        let client = ManagedClient::new(server("s1"), 2, persistence.clone(), EventBus::new(), false);

        let _ = client.connect_and_discover().await;
        let _ = client.connect_and_discover().await;

        let record = persistence.record("s1").unwrap();
        assert_eq!(record.server_state, StartupMode::AutoDisabled);
        assert_eq!(client.startup_mode().await, StartupMode::AutoDisabled);
    }

    /// S2: `EnableServer("s1", false)` must emit `ServerStateChanged` with
    /// `new_state="Disabled"`.
    #[tokio::test]
    async fn set_startup_mode_publishes_server_state_changed() {
        let persistence = test_persistence("s1");
        let bus = EventBus::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = bus.subscribe(
            None,
            Box::new(move |event| {
                if let Event::ServerStateChanged { new_state, .. } = event {
                    seen_clone.lock().unwrap().push(new_state);
                }
            }),
        );
        let client = ManagedClient::new(server("s1"), 3, persistence, bus, false);

        client.set_startup_mode(StartupMode::Disabled).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(seen.lock().unwrap().as_slice(), ["Disabled".to_string()]);
    }

    /// Testable property 3: a same-state `set_startup_mode` call is a
    /// silent no-op — no event, no error.
    #[tokio::test]
    async fn set_startup_mode_same_state_emits_no_event() {
        let persistence = test_persistence("s1");
        let bus = EventBus::new();
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let _sub = bus.subscribe(
            None,
            Box::new(move |_event| {
                seen_clone.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }),
        );
        let client = ManagedClient::new(server("s1"), 3, persistence, bus, false);

        let changed = client.set_startup_mode(StartupMode::Active).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(!changed);
        assert_eq!(seen.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn disconnect_publishes_connection_state_change() {
        let persistence = test_persistence("s1");
        let bus = EventBus::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = bus.subscribe(
            None,
            Box::new(move |event| {
                if let Event::ServerStateChanged { new_state, .. } = event {
                    seen_clone.lock().unwrap().push(new_state);
                }
            }),
        );
        let client = ManagedClient::new(server("s1"), 3, persistence, bus, false);

        // Drive the state away from `Disconnected` first so the
        // `disconnect()` transition back to it is an observable change.
        client.transition(ConnectionState::Connecting).await.unwrap();
        client.disconnect().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            ["Connecting".to_string(), "Disconnected".to_string()]
        );
    }
}
