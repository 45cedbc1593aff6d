//! Agent-type template catalog loaded from layered TOML files.
//!
//! Each file contributes `[agents.<type>]` tables. Files are deep-merged key by
//! key in order, so a later file can override a single field of a template
//! declared earlier without restating the rest. The catalog is immutable
//! between explicit `reload()` calls.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Context as _;
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::{FleetError, Result};
use crate::model::AgentTypeTemplate;

#[derive(Debug, Default, Deserialize)]
struct TemplateFile {
    #[serde(default)]
    agents: BTreeMap<String, AgentTypeTemplate>,
}

pub struct TemplateCatalog {
    sources: Vec<PathBuf>,
    templates: RwLock<BTreeMap<String, AgentTypeTemplate>>,
}

impl TemplateCatalog {
    /// Load templates from `sources` in order; later files override earlier ones.
    pub fn from_files(sources: Vec<PathBuf>) -> anyhow::Result<Self> {
        let templates = load_layered(&sources)?;
        tracing::info!(
            "loaded {} agent type template(s) from {} source(s)",
            templates.len(),
            sources.len()
        );
        Ok(Self {
            sources,
            templates: RwLock::new(templates),
        })
    }

    /// In-memory catalog with no backing files; `reload` keeps it unchanged.
    pub fn from_templates(templates: BTreeMap<String, AgentTypeTemplate>) -> Self {
        Self {
            sources: Vec::new(),
            templates: RwLock::new(templates),
        }
    }

    /// Re-read every source. On error the previous table is kept.
    pub fn reload(&self) -> anyhow::Result<usize> {
        if self.sources.is_empty() {
            return Ok(self.names().len());
        }
        let fresh = load_layered(&self.sources)?;
        let count = fresh.len();
        *self.templates.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        tracing::info!("reloaded {} agent type template(s)", count);
        Ok(count)
    }

    pub fn get(&self, agent_type: &str) -> Option<AgentTypeTemplate> {
        self.templates
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_type)
            .cloned()
    }

    pub fn contains(&self, agent_type: &str) -> bool {
        self.templates
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(agent_type)
    }

    pub fn names(&self) -> Vec<String> {
        self.templates
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

/// Deep-merge the given TOML files; missing files are skipped.
pub fn load_layered(paths: &[PathBuf]) -> anyhow::Result<BTreeMap<String, AgentTypeTemplate>> {
    let mut merged = toml::Table::new();
    for path in paths {
        if !path.exists() {
            tracing::debug!("template source {} not found; skipping", path.display());
            continue;
        }
        let table = read_table(path)?;
        merge_tables(&mut merged, table);
    }
    let file: TemplateFile = toml::Value::Table(merged)
        .try_into()
        .context("invalid agent template definition")?;
    Ok(file.agents)
}

fn read_table(path: &Path) -> anyhow::Result<toml::Table> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read template file {}", path.display()))?;
    let table: toml::Table = toml::from_str(&content)
        .with_context(|| format!("parse template file {}", path.display()))?;
    tracing::debug!("read template source {}", path.display());
    Ok(table)
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(incoming) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge_tables(existing, incoming);
                continue;
            }
            base.insert(key, toml::Value::Table(incoming));
        } else {
            base.insert(key, value);
        }
    }
}

/// Merge request-level overrides over a template; the request wins.
pub fn apply_overrides(
    template: &AgentTypeTemplate,
    overrides: &JsonMap<String, JsonValue>,
) -> Result<AgentTypeTemplate> {
    let mut base = serde_json::to_value(template)?;
    if let JsonValue::Object(map) = &mut base {
        merge_json(map, overrides);
    }
    serde_json::from_value(base)
        .map_err(|e| FleetError::validation(format!("invalid config overrides: {}", e)))
}

fn merge_json(base: &mut JsonMap<String, JsonValue>, overlay: &JsonMap<String, JsonValue>) {
    for (key, value) in overlay {
        if let (Some(JsonValue::Object(existing)), JsonValue::Object(incoming)) =
            (base.get_mut(key), value)
        {
            merge_json(existing, incoming);
            continue;
        }
        base.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeploymentMechanism;
    use serde_json::json;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, body).unwrap();
        p
    }

    #[test]
    fn later_files_override_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let base = write(
            dir.path(),
            "base.toml",
            r#"
[agents.grok4]
mechanism = "process"
credentials = ["DISCORD_TOKEN_GROK4", "XAI_API_KEY"]
[agents.grok4.launch]
command = "python"
args = ["bots/grok4.py"]

[agents.claude]
mechanism = "container"
"#,
        );
        let local = write(
            dir.path(),
            "local.toml",
            r#"
[agents.grok4.launch]
args = ["bots/grok4_dev.py"]
"#,
        );
        let missing = dir.path().join("missing.toml");
        let catalog = TemplateCatalog::from_files(vec![base, missing, local]).unwrap();
        let grok = catalog.get("grok4").expect("grok4");
        assert_eq!(grok.launch.command.as_deref(), Some("python"));
        assert_eq!(grok.launch.args, vec!["bots/grok4_dev.py".to_string()]);
        assert_eq!(grok.credentials.len(), 2);
        assert_eq!(
            catalog.get("claude").unwrap().mechanism,
            DeploymentMechanism::Container
        );
        assert_eq!(catalog.names(), vec!["claude".to_string(), "grok4".to_string()]);
    }

    #[test]
    fn reload_picks_up_changes_and_keeps_old_table_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "agents.toml", "[agents.a]\n");
        let catalog = TemplateCatalog::from_files(vec![path.clone()]).unwrap();
        assert_eq!(catalog.names(), vec!["a".to_string()]);

        std::fs::write(&path, "[agents.a]\n[agents.b]\n").unwrap();
        assert_eq!(catalog.reload().unwrap(), 2);
        assert!(catalog.contains("b"));

        std::fs::write(&path, "[agents.a\n").unwrap();
        assert!(catalog.reload().is_err());
        assert!(catalog.contains("b"));
    }

    #[test]
    fn request_overrides_win_over_template() {
        let mut t = AgentTypeTemplate::default();
        t.launch.command = Some("python".into());
        t.launch.args = vec!["bot.py".into()];
        let overrides = json!({ "launch": { "args": ["bot.py", "--debug"] }, "bot_name": "Dev" });
        let merged = apply_overrides(&t, overrides.as_object().unwrap()).unwrap();
        assert_eq!(merged.launch.command.as_deref(), Some("python"));
        assert_eq!(merged.launch.args.len(), 2);
        assert_eq!(merged.bot_name.as_deref(), Some("Dev"));
    }

    #[test]
    fn invalid_override_is_validation_error() {
        let t = AgentTypeTemplate::default();
        let overrides = json!({ "mechanism": "teleport" });
        let err = apply_overrides(&t, overrides.as_object().unwrap()).unwrap_err();
        assert!(err.is_validation());
    }
}
