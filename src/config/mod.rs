//! Config Loader / Watcher (§4.6) and the configured data model (§3).
//!
//! `startup_mode` is the single source of truth for a server's configured
//! state (I1) — no orthogonal `enabled`/`stopped`/`quarantined` booleans may
//! coexist with it. Those booleans still appear in `Server` so that
//! [`migrate::migrate_legacy_fields`] can fold them in on load (§4.5
//! "Legacy-field migration"); they are never serialized back out.

pub mod diff;
pub mod migrate;
pub mod watcher;

use crate::error::{ProxyError, ProxyResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// `MCPPROXY_CONFIG` overrides the config file location (spec.md §6).
pub const CONFIG_ENV_VAR: &str = "MCPPROXY_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Stdio,
    Http,
    Sse,
    #[serde(rename = "streamable-http")]
    StreamableHttp,
}

/// The single source of truth for a server's configured state (I1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupMode {
    Active,
    LazyLoading,
    Disabled,
    Quarantined,
    AutoDisabled,
}

impl StartupMode {
    /// The allowed-transition table from spec.md §4.2. Same-state
    /// transitions are handled separately as no-ops by the caller.
    pub fn can_transition_to(self, to: StartupMode) -> bool {
        use StartupMode::*;
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (Active, Disabled)
                | (Active, Quarantined)
                | (Active, AutoDisabled)
                | (Active, LazyLoading)
                | (Disabled, Active)
                | (Disabled, Quarantined)
                | (Disabled, LazyLoading)
                | (Quarantined, Active)
                | (Quarantined, Disabled)
                | (AutoDisabled, Active)
                | (AutoDisabled, Disabled)
                | (LazyLoading, Active)
                | (LazyLoading, Disabled)
                | (LazyLoading, Quarantined)
                | (LazyLoading, AutoDisabled)
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Isolation {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub mounts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub auth_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// A declared upstream server — the configured intent (§3 "Server").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    pub protocol: Protocol,

    // stdio transport fields
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,

    // network transport fields
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub oauth: Option<OAuthConfig>,

    #[serde(default = "default_startup_mode")]
    pub startup_mode: StartupMode,

    #[serde(default)]
    pub group_id: Option<i64>,
    /// Legacy display-name group reference. Migrated to `group_id` on load
    /// (I4); never written back out.
    #[serde(default, skip_serializing)]
    pub group_name: Option<String>,

    #[serde(default)]
    pub repository_url: Option<String>,
    #[serde(default)]
    pub isolation: Option<Isolation>,
    #[serde(default)]
    pub auto_disable_threshold: Option<u32>,

    // Legacy orthogonal flags. Folded into `startup_mode` by
    // `migrate::migrate_legacy_fields` and dropped from then on (I1).
    #[serde(default, skip_serializing)]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing)]
    pub stopped: Option<bool>,
    #[serde(default, skip_serializing)]
    pub quarantined: Option<bool>,
    #[serde(default, skip_serializing)]
    pub auto_disabled: Option<bool>,
}

fn default_startup_mode() -> StartupMode {
    StartupMode::Active
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub icon_emoji: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Top-level config file (§6): `mcpServers`, `groups`, and proxy-wide knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default, rename = "mcpServers")]
    pub mcp_servers: Vec<Server>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_connections: usize,
    #[serde(default = "default_auto_disable_threshold")]
    pub auto_disable_threshold: u32,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Default false — config reflects user intent, KV reflects runtime
    /// reality (spec.md §4.2 "Persistence policy").
    #[serde(default)]
    pub persist_auto_disable_to_config: bool,
    /// Ambient addition beyond spec.md §6's config schema: the bind
    /// address for the process boundary's control surface and MCP
    /// endpoint (§6 "process boundary"), mirroring the teacher's own
    /// `ServerConfig::bind`/`port` fields.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_listen_addr() -> String {
    "127.0.0.1:8095".to_string()
}

fn default_auto_disable_threshold() -> u32 {
    5
}

fn default_data_dir() -> String {
    data_dir_default().to_string_lossy().into_owned()
}

/// `$HOME/.mcpproxy`, per spec.md §6.
pub fn data_dir_default() -> PathBuf {
    dirs_home().join(".mcpproxy")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

impl ProxyConfig {
    /// Parse, apply defaults, migrate legacy fields, and validate.
    ///
    /// A reload that fails validation is rejected wholesale — the caller
    /// must keep using the previously loaded config (spec.md §4.6 "Failure
    /// semantics").
    pub fn parse(contents: &str) -> ProxyResult<Self> {
        let mut config: ProxyConfig = serde_json::from_str(contents)
            .map_err(|e| ProxyError::Validation(format!("invalid config JSON: {e}")))?;
        migrate::migrate_legacy_fields(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Required transport fields per protocol, unique server names, valid
    /// enum values (spec.md §4.6 "Operations").
    pub fn validate(&self) -> ProxyResult<()> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.mcp_servers {
            if server.name.is_empty() {
                return Err(ProxyError::Validation("server name must not be empty".into()));
            }
            if !seen.insert(server.name.clone()) {
                return Err(ProxyError::Validation(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
            match server.protocol {
                Protocol::Stdio => {
                    if server.command.is_none() {
                        return Err(ProxyError::Validation(format!(
                            "server '{}': stdio protocol requires 'command'",
                            server.name
                        )));
                    }
                }
                Protocol::Http | Protocol::Sse | Protocol::StreamableHttp => {
                    if server.url.is_none() {
                        return Err(ProxyError::Validation(format!(
                            "server '{}': network protocol requires 'url'",
                            server.name
                        )));
                    }
                }
            }
            if let Some(group_id) = server.group_id {
                if !self.groups.iter().any(|g| g.id == group_id) {
                    return Err(ProxyError::Validation(format!(
                        "server '{}': references unknown group_id {}",
                        server.name, group_id
                    )));
                }
            }
        }
        let mut group_ids = std::collections::HashSet::new();
        for group in &self.groups {
            if !group_ids.insert(group.id) {
                return Err(ProxyError::Validation(format!(
                    "duplicate group id {}",
                    group.id
                )));
            }
        }
        Ok(())
    }

    pub fn find_server(&self, name: &str) -> Option<&Server> {
        self.mcp_servers.iter().find(|s| s.name == name)
    }
}

/// Resolve the config file path: env override, else default path.
pub fn resolve_config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
        return PathBuf::from(path);
    }
    data_dir_default().join("mcpproxy.json")
}

/// Load and validate the config at the resolved path.
pub fn load() -> ProxyResult<ProxyConfig> {
    let path = resolve_config_path();
    load_from(&path)
}

pub fn load_from(path: &Path) -> ProxyResult<ProxyConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        ProxyError::Validation(format!("failed to read config at {}: {e}", path.display()))
    })?;
    ProxyConfig::parse(&contents)
}

/// Atomic write: serialize to a temp file in the same directory, then
/// rename over the target (spec.md §6 "Atomic write via temp-file +
/// rename").
pub fn write_atomic(path: &Path, config: &ProxyConfig) -> ProxyResult<()> {
    use crate::error::PersistError;
    use std::io::Write;

    let json: String = serde_json::to_string_pretty(config).map_err(PersistError::from)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(PersistError::from)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(PersistError::from)?;
    tmp.write_all(json.as_bytes()).map_err(PersistError::from)?;
    tmp.write_all(b"\n").map_err(PersistError::from)?;
    tmp.persist(path)
        .map_err(|e| PersistError::from(e.error))?;
    Ok(())
}
