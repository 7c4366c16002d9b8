//! Per-server config diffing (spec.md §4.6 "Diff").
//!
//! Reconciliation (§4.1) uses this to decide whether a changed server
//! needs its client destroyed and recreated (`transport_changed`) or can
//! be patched in place (`metadata_changed`).

use super::{Protocol, Server};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub transport_changed: Vec<String>,
    pub metadata_changed: Vec<String>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.transport_changed.is_empty()
            && self.metadata_changed.is_empty()
    }
}

/// Fields that require client recreation if changed.
fn transport_fields(server: &Server) -> (
    Protocol,
    &Option<String>,
    &Vec<String>,
    &HashMap<String, String>,
    &Option<String>,
    &Option<String>,
    &HashMap<String, String>,
) {
    (
        server.protocol,
        &server.command,
        &server.args,
        &server.env,
        &server.working_dir,
        &server.url,
        &server.headers,
    )
}

pub fn diff(old: &[Server], new: &[Server]) -> ConfigDiff {
    let old_by_name: HashMap<&str, &Server> =
        old.iter().map(|s| (s.name.as_str(), s)).collect();
    let new_by_name: HashMap<&str, &Server> =
        new.iter().map(|s| (s.name.as_str(), s)).collect();

    let mut added = Vec::new();
    let mut transport_changed = Vec::new();
    let mut metadata_changed = Vec::new();

    for server in new {
        match old_by_name.get(server.name.as_str()) {
            None => added.push(server.name.clone()),
            Some(prev) => {
                if transport_fields(prev) != transport_fields(server) {
                    transport_changed.push(server.name.clone());
                } else if !metadata_equal(prev, server) {
                    metadata_changed.push(server.name.clone());
                }
            }
        }
    }

    let mut removed: Vec<String> = old
        .iter()
        .filter(|s| !new_by_name.contains_key(s.name.as_str()))
        .map(|s| s.name.clone())
        .collect();
    removed.sort();
    added.sort();
    transport_changed.sort();
    metadata_changed.sort();

    ConfigDiff {
        added,
        removed,
        transport_changed,
        metadata_changed,
    }
}

fn metadata_equal(a: &Server, b: &Server) -> bool {
    a.startup_mode == b.startup_mode
        && a.group_id == b.group_id
        && a.repository_url == b.repository_url
        && a.auto_disable_threshold == b.auto_disable_threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StartupMode;
    use std::collections::HashMap;

    fn server(name: &str, command: &str) -> Server {
        Server {
            name: name.to_string(),
            protocol: Protocol::Stdio,
            command: Some(command.to_string()),
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

    #[test]
    fn detects_added_and_removed() {
        let old = vec![server("s1", "true")];
        let new = vec![server("s2", "true")];
        let d = diff(&old, &new);
        assert_eq!(d.added, vec!["s2".to_string()]);
        assert_eq!(d.removed, vec!["s1".to_string()]);
    }

    #[test]
    fn detects_transport_change() {
        let old = vec![server("s1", "true")];
        let new = vec![server("s1", "false")];
        let d = diff(&old, &new);
        assert_eq!(d.transport_changed, vec!["s1".to_string()]);
        assert!(d.metadata_changed.is_empty());
    }

    #[test]
    fn detects_metadata_change() {
        let old = vec![server("s1", "true")];
        let mut changed = server("s1", "true");
        changed.group_id = Some(1);
        let d = diff(&old, std::slice::from_ref(&changed));
        assert_eq!(d.metadata_changed, vec!["s1".to_string()]);
        assert!(d.transport_changed.is_empty());
    }

    #[test]
    fn no_change_is_empty_diff() {
        let s = vec![server("s1", "true")];
        let d = diff(&s, &s);
        assert!(d.is_empty());
    }
}
