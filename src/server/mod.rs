//! The MCP-facing `ServerHandler` surface (§6 "process boundary") — the
//! thinnest possible re-export of the aggregated tool surface to MCP
//! clients: no search, no ranking, no OAuth UI, just `list_tools`/
//! `call_tool` forwarding into [`UpstreamManager`].
//!
//! Grounded directly on the teacher's `upstream/server.rs` `ProxyEngine`
//! (a `ServerHandler` impl delegating to a manager), renamed and
//! generalized to delegate to `UpstreamManager` instead of
//! `FederationManager`, and to namespace tool names by upstream server
//! (`server_name:tool_name`) since a single flat MCP surface must
//! disambiguate which upstream each tool belongs to.

use std::sync::Arc;

use rmcp::{
    handler::server::ServerHandler,
    model::*,
    service::{RequestContext, RoleServer},
    ErrorData as McpError,
};

use crate::error::ProxyError;
use crate::manager::UpstreamManager;

const NAMESPACE_SEPARATOR: char = ':';

fn namespaced_name(server_name: &str, tool_name: &str) -> String {
    format!("{server_name}{NAMESPACE_SEPARATOR}{tool_name}")
}

/// Split a namespaced tool name back into `(server_name, tool_name)`.
/// Splits on the *first* separator so tool names may themselves contain
/// colons.
fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    name.split_once(NAMESPACE_SEPARATOR)
}

/// The MCP `ServerHandler` the proxy exposes to clients. Routes every
/// `list_tools`/`call_tool` request into the [`UpstreamManager`] (§4.1
/// `GetTools`/`CallTool`), which is where THE CORE's lifecycle and
/// auto-disable semantics actually live.
#[derive(Clone)]
pub struct ProxyEngine {
    manager: Arc<UpstreamManager>,
}

impl ProxyEngine {
    pub fn new(manager: Arc<UpstreamManager>) -> Self {
        Self { manager }
    }
}

fn to_mcp_error(e: ProxyError) -> McpError {
    let code = match &e {
        ProxyError::UnknownServer(_) => ErrorCode::METHOD_NOT_FOUND,
        ProxyError::NotReady(_) | ProxyError::Quarantined(_) | ProxyError::Timeout(_) => {
            ErrorCode::INTERNAL_ERROR
        }
        _ => ErrorCode::INTERNAL_ERROR,
    };
    McpError {
        code,
        message: e.to_string().into(),
        data: None,
    }
}

#[allow(clippy::manual_async_fn)]
impl ServerHandler for ProxyEngine {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "mcpproxy".to_string(),
                title: Some("mcpproxy aggregating reverse proxy".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: Some(
                    "Aggregates tools from many upstream MCP servers behind one surface".to_string(),
                ),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "mcpproxy — tool names are namespaced as 'server:tool'".to_string(),
            ),
            ..Default::default()
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        async {
            let mut tools = Vec::new();
            for status in self.manager.list_servers().await {
                if status.bucket != crate::manager::UiBucket::Connected
                    && status.bucket != crate::manager::UiBucket::Quarantined
                {
                    continue;
                }
                if let Ok(server_tools) = self.manager.get_tools(&status.name).await {
                    for mut tool in server_tools {
                        tool.name = namespaced_name(&status.name, &tool.name).into();
                        tools.push(tool);
                    }
                }
            }
            Ok(ListToolsResult {
                tools,
                next_cursor: None,
                meta: None,
            })
        }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        async move {
            let namespaced = request.name.as_ref();
            let (server_name, tool_name) = split_namespaced(namespaced).ok_or_else(|| McpError {
                code: ErrorCode::INVALID_PARAMS,
                message: format!(
                    "tool name '{namespaced}' is not namespaced as 'server:tool'"
                )
                .into(),
                data: None,
            })?;

            let arguments = match request.arguments {
                Some(map) => serde_json::Value::Object(map),
                None => serde_json::json!({}),
            };

            tracing::info!(server = server_name, tool = tool_name, "routing tool call");

            self.manager
                .call_tool(server_name, tool_name, arguments)
                .await
                .map_err(to_mcp_error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Protocol, ProxyConfig, Server, StartupMode};
    use crate::events::EventBus;
    use crate::scheduler::{Scheduler, SchedulerConfig};
    use crate::store::kv::{KvStore, UpstreamRecord};
    use crate::store::Persistence;
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

    async fn test_engine() -> ProxyEngine {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::temporary().unwrap();
        kv.put(&UpstreamRecord::new("s1", StartupMode::Active)).unwrap();
        let mut config = ProxyConfig::default();
        config.mcp_servers.push(server("s1"));
        let path = dir.path().join("mcpproxy.json");
        std::mem::forget(dir);
        let persistence = Persistence::new(kv, ProxyConfig::default(), path, EventBus::new());
        let scheduler = Scheduler::new(SchedulerConfig::with_workers(2));
        let manager = UpstreamManager::new(persistence, scheduler, 5, false);
        manager.reconcile(&config).await.unwrap();
        ProxyEngine::new(manager)
    }

    #[test]
    fn split_namespaced_splits_on_first_separator() {
        assert_eq!(split_namespaced("s1:get"), Some(("s1", "get")));
        assert_eq!(split_namespaced("s1:a:b"), Some(("s1", "a:b")));
        assert_eq!(split_namespaced("no-separator"), None);
    }

    #[tokio::test]
    async fn get_info_reports_mcpproxy() {
        let engine = test_engine().await;
        assert_eq!(engine.get_info().server_info.name, "mcpproxy");
    }

    // `list_tools`/`call_tool` take a `RequestContext<RoleServer>` that
    // only the rmcp runtime can construct, so — matching how the
    // teacher's own `ProxyEngine` tests avoid it — these exercise the
    // routing/error-mapping logic directly rather than through the
    // trait methods.

    #[tokio::test]
    async fn manager_list_tools_is_empty_before_any_client_is_ready() {
        let engine = test_engine().await;
        let statuses = engine.manager.list_servers().await;
        assert!(statuses.iter().all(|s| s.bucket != crate::manager::UiBucket::Connected));
    }

    #[tokio::test]
    async fn call_tool_on_unknown_server_maps_to_method_not_found() {
        let engine = test_engine().await;
        let err = engine
            .manager
            .call_tool("ghost", "tool", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(to_mcp_error(err).code, ErrorCode::METHOD_NOT_FOUND));
    }
}
