//! Load stdio capability-server definitions from JSON config files.
//!
//! Accepts the common host formats: a top-level `servers` table (VS Code)
//! or `mcpServers` (Claude/Cursor), each entry `{ command, args?, env? }`.
//! HTTP or URL-only entries are skipped. Later files win per server name.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value as JsonValue;

use super::{CapabilityServer, McpTransport};

/// Default lookup order: workspace `.mcp.json`, then `<fleet_home>/mcp.json`.
pub fn default_server_files(workspace_dir: &Path, fleet_home: &Path) -> Vec<PathBuf> {
    vec![workspace_dir.join(".mcp.json"), fleet_home.join("mcp.json")]
}

pub fn load_servers(paths: &[PathBuf]) -> BTreeMap<String, CapabilityServer> {
    let mut out = BTreeMap::new();
    for path in paths {
        merge_server_file(path, &mut out);
    }
    tracing::debug!("loaded {} capability server definition(s)", out.len());
    out
}

fn merge_server_file(path: &Path, out: &mut BTreeMap<String, CapabilityServer>) {
    let Ok(content) = fs::read_to_string(path) else {
        return;
    };
    let v = match serde_json::from_str::<JsonValue>(&content) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("ignoring malformed server file {}: {}", path.display(), e);
            return;
        }
    };
    // Prefer `servers`; fall back to `mcpServers`.
    let map = v
        .get("servers")
        .and_then(|m| m.as_object())
        .or_else(|| v.get("mcpServers").and_then(|m| m.as_object()));
    let Some(map) = map else {
        return;
    };
    for (name, def) in map {
        if let Some(mut server) = parse_server(name, def) {
            server.origin = Some(path.to_path_buf());
            out.insert(server.name.clone(), server);
        }
    }
}

fn parse_server(name: &str, def: &JsonValue) -> Option<CapabilityServer> {
    let is_http = def
        .get("type")
        .and_then(|v| v.as_str())
        .is_some_and(|t| t.eq_ignore_ascii_case("http") || t.eq_ignore_ascii_case("sse"));
    if is_http || def.get("url").is_some() {
        tracing::debug!("skipping non-stdio capability server '{}'", name);
        return None;
    }
    if def.get("disabled").and_then(|v| v.as_bool()) == Some(true) {
        return None;
    }
    let command = def.get("command").and_then(|v| v.as_str())?.to_string();
    let args: Vec<String> = def
        .get("args")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|x| x.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    let env: HashMap<String, String> = def
        .get("env")
        .and_then(|v| v.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    Some(CapabilityServer {
        name: name.to_string(),
        transport: McpTransport::Stdio { command, args, env },
        origin: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let p = dir.join(name);
        fs::write(&p, body).unwrap();
        p
    }

    #[test]
    fn servers_and_mcpservers_keys_are_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(
            dir.path(),
            "a.json",
            r#"{ "servers": { "files": { "command": "files-mcp", "args": ["--root", "/srv"], "env": {"RUST_LOG":"info"} } } }"#,
        );
        let b = write(
            dir.path(),
            "b.json",
            r#"{ "mcpServers": {
                "search": { "command": "search-mcp" },
                "remote": { "type": "http", "url": "https://example.invalid/mcp" },
                "off": { "command": "off-mcp", "disabled": true }
            } }"#,
        );
        let servers = load_servers(&[a.clone(), b, dir.path().join("missing.json")]);
        assert_eq!(
            servers.keys().cloned().collect::<Vec<_>>(),
            vec!["files".to_string(), "search".to_string()]
        );
        let files = &servers["files"];
        assert_eq!(files.origin.as_deref(), Some(a.as_path()));
        match &files.transport {
            McpTransport::Stdio { command, args, env } => {
                assert_eq!(command, "files-mcp");
                assert_eq!(args.len(), 2);
                assert_eq!(env.get("RUST_LOG").map(String::as_str), Some("info"));
            }
        }
    }

    #[test]
    fn later_file_wins_and_malformed_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.json", r#"{ "servers": { "x": { "command": "old" } } }"#);
        let bad = write(dir.path(), "bad.json", "{ not json");
        let b = write(dir.path(), "b.json", r#"{ "servers": { "x": { "command": "new" } } }"#);
        let servers = load_servers(&[a, bad, b]);
        match &servers["x"].transport {
            McpTransport::Stdio { command, .. } => assert_eq!(command, "new"),
        }
    }
}
