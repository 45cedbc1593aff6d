//! Team definitions persisted to `teams.toml`.
//!
//! Every mutation is applied to a copy, written to disk, then committed, so a
//! failed write leaves both the file and the in-memory map unchanged. When
//! the last team is deleted the file is removed, restoring the pre-team state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{FleetError, Result};
use crate::model::Team;

#[derive(Debug, Default, Serialize, Deserialize)]
struct TeamsFile {
    #[serde(default)]
    teams: Vec<Team>,
}

pub struct TeamStore {
    path: Option<PathBuf>,
    teams: Mutex<BTreeMap<String, Team>>,
}

impl TeamStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            teams: Mutex::new(BTreeMap::new()),
        }
    }

    /// Load `path` if it exists; later mutations are written back to it.
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut teams = BTreeMap::new();
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("read teams file {}", path.display()))?;
            let file: TeamsFile = toml::from_str(&content)
                .with_context(|| format!("parse teams file {}", path.display()))?;
            for team in file.teams {
                teams.insert(team.team_name.clone(), team);
            }
            tracing::info!("loaded {} team(s) from {}", teams.len(), path.display());
        }
        Ok(Self {
            path: Some(path),
            teams: Mutex::new(teams),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn get(&self, team_name: &str) -> Option<Team> {
        self.teams.lock().await.get(team_name).cloned()
    }

    pub async fn list(&self) -> Vec<Team> {
        self.teams.lock().await.values().cloned().collect()
    }

    pub async fn insert(&self, team: Team) -> Result<Team> {
        let mut teams = self.teams.lock().await;
        if teams.contains_key(&team.team_name) {
            return Err(FleetError::TeamExists(team.team_name));
        }
        let mut next = teams.clone();
        next.insert(team.team_name.clone(), team.clone());
        self.persist(&next)?;
        *teams = next;
        Ok(team)
    }

    pub async fn remove(&self, team_name: &str) -> Result<Team> {
        let mut teams = self.teams.lock().await;
        let mut next = teams.clone();
        let removed = next
            .remove(team_name)
            .ok_or_else(|| FleetError::UnknownTeam(team_name.to_string()))?;
        self.persist(&next)?;
        *teams = next;
        Ok(removed)
    }

    /// Apply `f` to one team and persist the result.
    pub async fn update<F>(&self, team_name: &str, f: F) -> Result<Team>
    where
        F: FnOnce(&mut Team) -> Result<()>,
    {
        let mut teams = self.teams.lock().await;
        let mut next = teams.clone();
        let team = next
            .get_mut(team_name)
            .ok_or_else(|| FleetError::UnknownTeam(team_name.to_string()))?;
        f(team)?;
        let updated = team.clone();
        self.persist(&next)?;
        *teams = next;
        Ok(updated)
    }

    fn persist(&self, teams: &BTreeMap<String, Team>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if teams.is_empty() {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            return Ok(());
        }
        let file = TeamsFile {
            teams: teams.values().cloned().collect(),
        };
        let body = toml::to_string_pretty(&file)
            .map_err(|e| FleetError::Config(format!("serialize teams: {}", e)))?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)?;
        tracing::debug!("wrote {} team(s) to {}", teams.len(), path.display());
        Ok(())
    }
}
