//! Naming helpers for agents, containers and qualified tool names.

/// Separator between server and tool in an LLM-facing function name.
pub const QUALIFIED_SEPARATOR: char = '_';

/// Convert a display name into a filesystem/container-safe identifier.
pub fn safe_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// Compose the flattened `server_tool` name exposed to the LLM.
pub fn qualified_tool_name(server: &str, tool: &str) -> String {
    format!("{}{}{}", server, QUALIFIED_SEPARATOR, tool)
}

/// Split a qualified name on the first separator only; tool names may
/// themselves contain the separator.
pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    let (server, tool) = name.split_once(QUALIFIED_SEPARATOR)?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

/// Process identifiers are recorded as `process_<pid>`.
pub fn process_identifier(pid: u32) -> String {
    format!("process_{}", pid)
}

/// Parse a `process_<pid>` identifier back into a pid.
pub fn parse_process_identifier(identifier: &str) -> Option<u32> {
    identifier
        .strip_prefix("process_")
        .and_then(|p| p.parse::<u32>().ok())
        .filter(|pid| *pid > 0)
}
