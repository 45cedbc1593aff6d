use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize)]
pub struct UserConfig {
    pub logging: Option<LoggingCfg>,
    pub fleet: Option<FleetCfg>,
    pub tools: Option<ToolsCfg>,
    pub llm: Option<LlmCfg>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingCfg {
    pub to_file: Option<bool>,
    pub dir: Option<String>,
    pub json: Option<bool>,
    pub compact: Option<bool>,
    pub pretty: Option<bool>,
    pub level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FleetCfg {
    pub template_files: Option<Vec<String>>, // layered, later wins
    pub teams_file: Option<String>,
    pub grace_ms: Option<u64>,
    pub settle_ms: Option<u64>,
    pub restart_pause_ms: Option<u64>,
    pub container_prefix: Option<String>,
    pub stop_timeout_secs: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ToolsCfg {
    pub server_files: Option<Vec<String>>,
    pub cache_ttl_secs: Option<u64>,
    pub session_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LlmCfg {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key_env: Option<String>,
    pub max_iterations: Option<usize>,
    pub system_prompt: Option<String>,
}

pub fn load_user_config(fleet_home: &Path) -> anyhow::Result<Option<UserConfig>> {
    let path = fleet_home.join("config.toml");
    if !path.exists() {
        return Ok(None);
    }
    let s = std::fs::read_to_string(&path)?;
    let cfg: UserConfig = toml::from_str(&s)?;
    Ok(Some(cfg))
}

pub fn expand_home(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/")
        && let Ok(home) = std::env::var("HOME")
    {
        return PathBuf::from(home).join(stripped);
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_home_only_rewrites_tilde_prefix() {
        let expected = match std::env::var("HOME") {
            Ok(home) => PathBuf::from(home).join("logs"),
            Err(_) => PathBuf::from("~/logs"),
        };
        assert_eq!(expand_home("~/logs"), expected);
        assert_eq!(expand_home("/var/~/logs"), PathBuf::from("/var/~/logs"));
        assert_eq!(expand_home("~logs"), PathBuf::from("~logs"));
    }

    #[test]
    fn missing_config_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_user_config(dir.path()).unwrap().is_none());
    }

    #[test]
    fn parses_all_tables() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
[logging]
level = "debug"
[fleet]
template_files = ["~/agents.toml", "/etc/fleet/agents.toml"]
grace_ms = 500
[tools]
cache_ttl_secs = 60
[llm]
model = "grok-4"
max_iterations = 5
"#,
        )
        .unwrap();
        let cfg = load_user_config(dir.path()).unwrap().expect("config");
        assert_eq!(cfg.logging.unwrap().level.as_deref(), Some("debug"));
        let fleet = cfg.fleet.unwrap();
        assert_eq!(fleet.grace_ms, Some(500));
        assert_eq!(fleet.template_files.unwrap().len(), 2);
        assert_eq!(cfg.tools.unwrap().cache_ttl_secs, Some(60));
        assert_eq!(cfg.llm.unwrap().max_iterations, Some(5));
    }
}
