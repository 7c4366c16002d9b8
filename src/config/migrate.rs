//! Legacy-field migration, run once on load (spec.md §4.5, §9).
//!
//! Source config files (and their reflection-based JSON writers) used
//! orthogonal `enabled`/`quarantined`/`stopped`/`auto_disabled` booleans
//! alongside `startup_mode`, and referenced groups by display name. Both
//! patterns are folded into the single-enum, id-referenced shape here
//! instead of at save time, per the REDESIGN FLAGS in spec.md §9.

use super::{ProxyConfig, StartupMode};

/// Fold legacy boolean flags into `startup_mode` and rewrite any
/// `group_name` reference to `group_id`. Idempotent — running this twice
/// on an already-migrated config is a no-op.
pub fn migrate_legacy_fields(config: &mut ProxyConfig) {
    let groups = config.groups.clone();
    for server in &mut config.mcp_servers {
        if let Some(mode) = legacy_mode(server) {
            tracing::info!(
                server = %server.name,
                startup_mode = ?mode,
                "migrated legacy boolean flags to startup_mode"
            );
            server.startup_mode = mode;
        }
        server.enabled = None;
        server.stopped = None;
        server.quarantined = None;
        server.auto_disabled = None;

        if server.group_id.is_none() {
            if let Some(name) = server.group_name.take() {
                if let Some(group) = groups.iter().find(|g| g.name == name) {
                    tracing::info!(
                        server = %server.name,
                        group_id = group.id,
                        "migrated legacy group_name reference to group_id"
                    );
                    server.group_id = Some(group.id);
                } else {
                    tracing::warn!(
                        server = %server.name,
                        group_name = %name,
                        "legacy group_name does not match any known group — dropping reference"
                    );
                }
            }
        } else {
            server.group_name = None;
        }
    }
}

/// Precedence when more than one legacy flag is set, most restrictive
/// first — matches the ordering the state machine itself treats as more
/// severe (quarantine/disable outrank auto-disable, which outranks plain
/// enabled/disabled).
fn legacy_mode(server: &super::Server) -> Option<StartupMode> {
    if server.quarantined == Some(true) {
        return Some(StartupMode::Quarantined);
    }
    if server.stopped == Some(true) || server.enabled == Some(false) {
        return Some(StartupMode::Disabled);
    }
    if server.auto_disabled == Some(true) {
        return Some(StartupMode::AutoDisabled);
    }
    if server.enabled == Some(true) {
        return Some(StartupMode::Active);
    }
    None
}
