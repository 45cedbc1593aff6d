//! Lifecycle operations applied to named groups of agents.
//!
//! Team results are never all-or-nothing. Start reports success when at
//! least one member started; stop reports success when the operation ran,
//! and callers compare `stopped_count` with `total_count` for compliance.

pub mod store;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::deploy::DeploymentManager;
use crate::error::{FleetError, Result};
use crate::model::{
    CoordinationMode, DeploymentRequest, HealthState, MemberAction, MemberHealth, MemberOutcome,
    Team, TeamHealth, TeamMember, TeamOpResult, TeamOperation, health_percentage,
};

pub use store::TeamStore;

pub const DEFAULT_SETTLE: Duration = Duration::from_millis(2000);
pub const DEFAULT_RESTART_PAUSE: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy)]
pub struct TeamTimings {
    /// Pause after a successful member in sequential mode.
    pub settle: Duration,
    /// Pause between the stop and start phases of a restart.
    pub restart_pause: Duration,
}

impl Default for TeamTimings {
    fn default() -> Self {
        Self {
            settle: DEFAULT_SETTLE,
            restart_pause: DEFAULT_RESTART_PAUSE,
        }
    }
}

pub struct TeamCoordinator {
    deployments: Arc<DeploymentManager>,
    store: TeamStore,
    timings: TeamTimings,
}

impl TeamCoordinator {
    pub fn new(deployments: Arc<DeploymentManager>, store: TeamStore) -> Self {
        Self {
            deployments,
            store,
            timings: TeamTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: TeamTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn deployments(&self) -> &Arc<DeploymentManager> {
        &self.deployments
    }

    pub async fn create_team(&self, mut team: Team) -> Result<Team> {
        if team.team_name.trim().is_empty() {
            return Err(FleetError::validation("team name must not be empty"));
        }
        if team.display_name.trim().is_empty() {
            team.display_name = team.team_name.clone();
        }
        let mut seen = HashSet::new();
        for member in &team.members {
            if !seen.insert(member.name.as_str()) {
                return Err(FleetError::validation(format!(
                    "duplicate member '{}' in team '{}'",
                    member.name, team.team_name
                )));
            }
            self.require_agent_type(&member.agent_type)?;
        }
        let team = self.store.insert(team).await?;
        tracing::info!(team = %team.team_name, members = team.members.len(), "team created");
        Ok(team)
    }

    /// Delete a team. Refused while any member is active unless `force`, in
    /// which case members are stopped first and stop failures are ignored.
    pub async fn delete_team(&self, team_name: &str, force: bool) -> Result<Team> {
        let team = self.require_team(team_name).await?;
        let mut active = Vec::new();
        for member in &team.members {
            if self.deployments.is_active(&member.name).await {
                active.push(member.name.clone());
            }
        }
        if !active.is_empty() {
            if !force {
                return Err(FleetError::validation(format!(
                    "team '{}' has active member(s): {}; stop them or use force",
                    team_name,
                    active.join(", ")
                )));
            }
            for name in &active {
                if !self.deployments.stop(name).await {
                    tracing::warn!(team = %team_name, agent = %name, "forced delete: stop failed");
                }
            }
        }
        let removed = self.store.remove(team_name).await?;
        tracing::info!(team = %team_name, force, "team deleted");
        Ok(removed)
    }

    pub async fn add_member(&self, team_name: &str, member: TeamMember) -> Result<Team> {
        self.require_agent_type(&member.agent_type)?;
        let team = self
            .store
            .update(team_name, |team| {
                if team.has_member(&member.name) {
                    return Err(FleetError::validation(format!(
                        "'{}' is already a member of team '{}'",
                        member.name, team.team_name
                    )));
                }
                team.members.push(member.clone());
                Ok(())
            })
            .await?;
        tracing::info!(team = %team_name, agent = %member.name, "member added");
        Ok(team)
    }

    /// Remove a member. No lifecycle action is taken unless `stop` is set.
    pub async fn remove_member(&self, team_name: &str, agent_name: &str, stop: bool) -> Result<Team> {
        let team = self
            .store
            .update(team_name, |team| {
                let before = team.members.len();
                team.members.retain(|m| m.name != agent_name);
                if team.members.len() == before {
                    return Err(FleetError::UnknownAgent(agent_name.to_string()));
                }
                Ok(())
            })
            .await?;
        if stop && self.deployments.is_active(agent_name).await {
            let stopped = self.deployments.stop(agent_name).await;
            tracing::info!(team = %team_name, agent = %agent_name, stopped, "removed member stop");
        }
        tracing::info!(team = %team_name, agent = %agent_name, "member removed");
        Ok(team)
    }

    pub async fn get_team(&self, team_name: &str) -> Option<Team> {
        self.store.get(team_name).await
    }

    pub async fn list_teams(&self) -> Vec<Team> {
        self.store.list().await
    }

    /// Deploy every member. `mode` falls back to the team's own mode.
    pub async fn start_team(&self, team_name: &str, mode: Option<CoordinationMode>) -> TeamOpResult {
        let Some(team) = self.store.get(team_name).await else {
            return TeamOpResult::rejected(
                team_name,
                TeamOperation::Start,
                FleetError::UnknownTeam(team_name.to_string()).to_string(),
            );
        };
        let mode = mode.unwrap_or(team.coordination_mode);
        tracing::info!(team = %team_name, ?mode, members = team.members.len(), "starting team");

        let members = match mode {
            CoordinationMode::Sequential => self.start_sequential(&team).await,
            CoordinationMode::Parallel | CoordinationMode::Collaborative => {
                self.start_parallel(&team).await
            }
        };

        let started = members.iter().filter(|m| m.success).count();
        let total = team.members.len();
        if started < total {
            tracing::warn!(team = %team_name, started, total, "team partially started");
        }
        TeamOpResult {
            team_name: team_name.to_string(),
            operation: TeamOperation::Start,
            success: started > 0,
            started_count: started,
            stopped_count: 0,
            total_count: total,
            members,
            message: format!("Started {}/{} member(s) of team '{}'", started, total, team_name),
        }
    }

    async fn start_sequential(&self, team: &Team) -> Vec<MemberOutcome> {
        let mut outcomes = Vec::with_capacity(team.members.len());
        for (idx, member) in team.members.iter().enumerate() {
            let outcome = deploy_member(&self.deployments, &team.team_name, member).await;
            let succeeded = outcome.success;
            outcomes.push(outcome);
            if succeeded && idx + 1 < team.members.len() {
                tokio::time::sleep(self.timings.settle).await;
            }
        }
        outcomes
    }

    /// Outcomes are in completion order, not member order.
    async fn start_parallel(&self, team: &Team) -> Vec<MemberOutcome> {
        let mut set = JoinSet::new();
        for member in team.members.clone() {
            let deployments = self.deployments.clone();
            let team_name = team.team_name.clone();
            set.spawn(async move { deploy_member(&deployments, &team_name, &member).await });
        }
        collect_outcomes(set).await
    }

    /// Stop the team's members concurrently. Without `force`, members with no
    /// deployment record are reported as not running; failed or stopped
    /// records still go through stop so they are cleared.
    pub async fn stop_team(&self, team_name: &str, force: bool) -> TeamOpResult {
        let Some(team) = self.store.get(team_name).await else {
            return TeamOpResult::rejected(
                team_name,
                TeamOperation::Stop,
                FleetError::UnknownTeam(team_name.to_string()).to_string(),
            );
        };
        tracing::info!(team = %team_name, force, members = team.members.len(), "stopping team");

        let mut set = JoinSet::new();
        let mut skipped = Vec::new();
        for member in team.members.clone() {
            if !force && self.deployments.status_of(&member.name).await.is_none() {
                skipped.push(MemberOutcome {
                    agent_name: member.name,
                    action: MemberAction::Stop,
                    success: false,
                    message: "not running".to_string(),
                    identifier: None,
                });
                continue;
            }
            let deployments = self.deployments.clone();
            set.spawn(async move {
                let result = deployments.try_stop(&member.name).await;
                MemberOutcome {
                    agent_name: member.name,
                    action: MemberAction::Stop,
                    success: result.is_ok(),
                    message: match result {
                        Ok(()) => "stopped".to_string(),
                        Err(e) => e.to_string(),
                    },
                    identifier: None,
                }
            });
        }
        let mut members = collect_outcomes(set).await;
        members.extend(skipped);

        let stopped = members.iter().filter(|m| m.success).count();
        let total = team.members.len();
        TeamOpResult {
            team_name: team_name.to_string(),
            operation: TeamOperation::Stop,
            success: true,
            started_count: 0,
            stopped_count: stopped,
            total_count: total,
            members,
            message: format!("Stopped {}/{} member(s) of team '{}'", stopped, total, team_name),
        }
    }

    /// Stop, pause, then start in parallel. A failed stop phase aborts.
    pub async fn restart_team(&self, team_name: &str) -> TeamOpResult {
        let stop = self.stop_team(team_name, false).await;
        if !stop.success {
            return TeamOpResult {
                operation: TeamOperation::Restart,
                message: format!("Restart aborted: {}", stop.message),
                ..stop
            };
        }
        tokio::time::sleep(self.timings.restart_pause).await;
        let start = self
            .start_team(team_name, Some(CoordinationMode::Parallel))
            .await;

        let mut members = stop.members;
        members.extend(start.members);
        TeamOpResult {
            team_name: team_name.to_string(),
            operation: TeamOperation::Restart,
            success: start.success,
            started_count: start.started_count,
            stopped_count: stop.stopped_count,
            total_count: start.total_count,
            members,
            message: format!(
                "Restarted team '{}': stopped {}, started {}/{}",
                team_name, stop.stopped_count, start.started_count, start.total_count
            ),
        }
    }

    /// Recompute health from a fresh liveness probe of every member.
    pub async fn status(&self, team_name: &str) -> Result<TeamHealth> {
        let team = self.require_team(team_name).await?;
        let mut members = Vec::with_capacity(team.members.len());
        for member in &team.members {
            let running = self.deployments.is_running(&member.name).await;
            let status = self.deployments.status_of(&member.name).await;
            members.push(MemberHealth {
                agent_name: member.name.clone(),
                status,
                running,
            });
        }
        let running = members.iter().filter(|m| m.running).count();
        let total = members.len();
        Ok(TeamHealth {
            team_name: team_name.to_string(),
            running_members: running,
            total_members: total,
            percentage: health_percentage(running, total),
            state: HealthState::classify(running, total),
            members,
        })
    }

    /// Start every team flagged `auto_deploy` in its own coordination mode.
    pub async fn auto_deploy(&self) -> Vec<TeamOpResult> {
        let mut results = Vec::new();
        for team in self.store.list().await {
            if !team.auto_deploy {
                continue;
            }
            let result = self.start_team(&team.team_name, None).await;
            tracing::info!(team = %team.team_name, "auto-deploy: {}", result.message);
            results.push(result);
        }
        results
    }

    async fn require_team(&self, team_name: &str) -> Result<Team> {
        self.store
            .get(team_name)
            .await
            .ok_or_else(|| FleetError::UnknownTeam(team_name.to_string()))
    }

    fn require_agent_type(&self, agent_type: &str) -> Result<()> {
        if self.deployments.catalog().contains(agent_type) {
            Ok(())
        } else {
            Err(FleetError::UnknownAgentType(agent_type.to_string()))
        }
    }
}

async fn deploy_member(
    deployments: &DeploymentManager,
    team_name: &str,
    member: &TeamMember,
) -> MemberOutcome {
    let request = DeploymentRequest::new(&member.name, &member.agent_type).with_team(team_name);
    let result = deployments.deploy(request).await;
    MemberOutcome {
        agent_name: member.name.clone(),
        action: MemberAction::Start,
        success: result.success,
        message: result.message,
        identifier: (!result.identifier.is_empty()).then_some(result.identifier),
    }
}

async fn collect_outcomes(mut set: JoinSet<MemberOutcome>) -> Vec<MemberOutcome> {
    let mut outcomes = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => tracing::error!("team member task failed: {}", e),
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::testing::{FakeLauncher, catalog, template};
    use crate::model::{AgentStatus, DeploymentMechanism};
    use std::collections::BTreeMap;

    fn coordinator(launcher: Arc<FakeLauncher>, store: TeamStore) -> TeamCoordinator {
        let catalog = catalog(vec![
            ("grok4", template(DeploymentMechanism::Process, &["XAI_API_KEY"])),
            ("claude", template(DeploymentMechanism::Process, &[])),
        ]);
        let env = BTreeMap::from([("XAI_API_KEY".to_string(), "k".to_string())]);
        let deployments = DeploymentManager::new(catalog, launcher)
            .with_base_env(env)
            .with_grace(Duration::from_millis(1));
        TeamCoordinator::new(Arc::new(deployments), store).with_timings(TeamTimings {
            settle: Duration::from_millis(1),
            restart_pause: Duration::from_millis(1),
        })
    }

    fn team(name: &str, members: &[(&str, &str)]) -> Team {
        let mut t = Team::new(name);
        t.members = members.iter().map(|(n, ty)| TeamMember::new(*n, *ty)).collect();
        t
    }

    #[tokio::test]
    async fn sequential_start_continues_past_failed_member() {
        let launcher = Arc::new(FakeLauncher::default());
        launcher.crash_agent("a2", "boom");
        let coord = coordinator(launcher, TeamStore::in_memory());
        coord
            .create_team(team("t1", &[("a1", "grok4"), ("a2", "claude")]))
            .await
            .unwrap();

        let res = coord
            .start_team("t1", Some(CoordinationMode::Sequential))
            .await;
        assert_eq!(res.started_count, 1);
        assert_eq!(res.total_count, 2);
        assert!(res.success);
        assert_eq!(res.members[0].agent_name, "a1");
        assert!(!res.members[1].success);
    }

    #[tokio::test]
    async fn parallel_start_with_no_successes_fails() {
        let launcher = Arc::new(FakeLauncher::default());
        launcher.crash_agent("a1", "x");
        launcher.crash_agent("a2", "y");
        let coord = coordinator(launcher, TeamStore::in_memory());
        coord
            .create_team(team("t1", &[("a1", "grok4"), ("a2", "claude")]))
            .await
            .unwrap();
        let res = coord.start_team("t1", None).await;
        assert!(!res.success);
        assert_eq!(res.started_count, 0);
        assert_eq!(res.members.len(), 2);
    }

    #[tokio::test]
    async fn stop_then_start_counts_never_exceed_total() {
        let launcher = Arc::new(FakeLauncher::default());
        let coord = coordinator(launcher.clone(), TeamStore::in_memory());
        coord
            .create_team(team("t1", &[("a1", "grok4"), ("a2", "claude"), ("a3", "claude")]))
            .await
            .unwrap();
        coord.start_team("t1", None).await;
        *launcher.fail_kill.lock().unwrap() = true;
        let stop = coord.stop_team("t1", false).await;
        assert!(stop.success);
        assert_eq!(stop.stopped_count, 0);
        *launcher.fail_kill.lock().unwrap() = false;

        let stop = coord.stop_team("t1", true).await;
        assert!(stop.stopped_count <= stop.total_count);
        assert_eq!(stop.stopped_count, 3);
        let start = coord.start_team("t1", None).await;
        assert!(start.started_count <= start.total_count);
        assert_eq!(start.started_count, 3);
    }

    #[tokio::test]
    async fn stop_without_force_skips_inactive_members() {
        let coord = coordinator(Arc::new(FakeLauncher::default()), TeamStore::in_memory());
        coord
            .create_team(team("t1", &[("a1", "grok4"), ("a2", "claude")]))
            .await
            .unwrap();
        let res = coord.stop_team("t1", false).await;
        assert!(res.success);
        assert_eq!(res.stopped_count, 0);
        assert!(res.members.iter().all(|m| m.message == "not running"));

        let unknown = coord.stop_team("nope", false).await;
        assert!(!unknown.success);
    }

    #[tokio::test]
    async fn stop_clears_records_of_members_that_died() {
        let launcher = Arc::new(FakeLauncher::default());
        let coord = coordinator(launcher.clone(), TeamStore::in_memory());
        coord
            .create_team(team("t1", &[("a1", "grok4"), ("a2", "claude")]))
            .await
            .unwrap();
        let start = coord.start_team("t1", None).await;
        let a1 = start.members.iter().find(|m| m.agent_name == "a1").unwrap();
        let pid = a1
            .identifier
            .as_deref()
            .and_then(|id| id.strip_prefix("process_"))
            .and_then(|pid| pid.parse().ok())
            .unwrap();
        launcher.reap(pid);
        assert_eq!(coord.deployments().list_active().await.len(), 1);
        assert_eq!(coord.deployments().status_of("a1").await, Some(AgentStatus::Failed));

        let res = coord.stop_team("t1", false).await;
        assert_eq!(res.stopped_count, 2);
        assert!(res.members.iter().all(|m| m.success));
        assert_eq!(coord.deployments().status_of("a1").await, None);
        assert!(coord.deployments().list_all().await.is_empty());
    }

    #[tokio::test]
    async fn restart_aborts_for_unknown_team_and_restarts_known() {
        let coord = coordinator(Arc::new(FakeLauncher::default()), TeamStore::in_memory());
        let res = coord.restart_team("ghost").await;
        assert!(!res.success);
        assert_eq!(res.operation, TeamOperation::Restart);
        assert!(res.message.starts_with("Restart aborted"));

        coord
            .create_team(team("t1", &[("a1", "grok4"), ("a2", "claude")]))
            .await
            .unwrap();
        coord.start_team("t1", None).await;
        let res = coord.restart_team("t1").await;
        assert!(res.success);
        assert_eq!(res.stopped_count, 2);
        assert_eq!(res.started_count, 2);
    }

    #[tokio::test]
    async fn status_tracks_fresh_liveness() {
        let launcher = Arc::new(FakeLauncher::default());
        let coord = coordinator(launcher.clone(), TeamStore::in_memory());
        coord
            .create_team(team(
                "t1",
                &[("a1", "grok4"), ("a2", "claude"), ("a3", "claude"), ("a4", "claude")],
            ))
            .await
            .unwrap();
        let start = coord.start_team("t1", None).await;
        let health = coord.status("t1").await.unwrap();
        assert_eq!(health.running_members, 4);
        assert_eq!(health.state, HealthState::Healthy);

        let a1 = start
            .members
            .iter()
            .find(|m| m.agent_name == "a1")
            .and_then(|m| m.identifier.clone())
            .unwrap();
        launcher.reap(crate::model::parse_process_identifier(&a1).unwrap());
        let health = coord.status("t1").await.unwrap();
        assert_eq!(health.running_members, 3);
        assert_eq!(health.percentage, 75.0);
        assert_eq!(health.state, HealthState::Degraded);
    }

    #[tokio::test]
    async fn delete_refuses_active_members_unless_forced() {
        let coord = coordinator(Arc::new(FakeLauncher::default()), TeamStore::in_memory());
        coord
            .create_team(team("t1", &[("a1", "grok4")]))
            .await
            .unwrap();
        coord.start_team("t1", None).await;
        let err = coord.delete_team("t1", false).await.unwrap_err();
        assert!(err.to_string().contains("a1"));
        coord.delete_team("t1", true).await.unwrap();
        assert!(!coord.deployments().is_active("a1").await);
        assert!(coord.get_team("t1").await.is_none());
    }

    #[tokio::test]
    async fn membership_requires_known_team_and_type() {
        let coord = coordinator(Arc::new(FakeLauncher::default()), TeamStore::in_memory());
        coord.create_team(Team::new("t1")).await.unwrap();
        assert!(matches!(
            coord.add_member("t1", TeamMember::new("x", "gpt9")).await,
            Err(FleetError::UnknownAgentType(_))
        ));
        assert!(matches!(
            coord.add_member("t9", TeamMember::new("x", "grok4")).await,
            Err(FleetError::UnknownTeam(_))
        ));
        coord
            .add_member("t1", TeamMember::new("x", "grok4"))
            .await
            .unwrap();
        assert!(coord
            .add_member("t1", TeamMember::new("x", "claude"))
            .await
            .is_err());
        let t = coord.remove_member("t1", "x", false).await.unwrap();
        assert!(t.members.is_empty());
        assert!(matches!(
            coord.remove_member("t1", "x", false).await,
            Err(FleetError::UnknownAgent(_))
        ));
    }

    #[tokio::test]
    async fn create_rejects_duplicate_members() {
        let coord = coordinator(Arc::new(FakeLauncher::default()), TeamStore::in_memory());
        let err = coord
            .create_team(team("t1", &[("a1", "grok4"), ("a1", "claude")]))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn net_membership_sequence_restores_teams_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("teams.toml");
        let coord = coordinator(
            Arc::new(FakeLauncher::default()),
            TeamStore::load(&path).unwrap(),
        );
        coord
            .create_team(team("base", &[("a1", "grok4")]))
            .await
            .unwrap();
        let before = std::fs::read(&path).unwrap();

        coord.create_team(Team::new("t2")).await.unwrap();
        coord
            .add_member("t2", TeamMember::new("a9", "claude"))
            .await
            .unwrap();
        coord.remove_member("t2", "a9", false).await.unwrap();
        coord.delete_team("t2", false).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn auto_deploy_starts_flagged_teams_only() {
        let coord = coordinator(Arc::new(FakeLauncher::default()), TeamStore::in_memory());
        let mut auto = team("auto", &[("a1", "grok4")]);
        auto.auto_deploy = true;
        coord.create_team(auto).await.unwrap();
        coord
            .create_team(team("manual", &[("a2", "claude")]))
            .await
            .unwrap();
        let results = coord.auto_deploy().await;
        assert_eq!(results.len(), 1);
        assert!(coord.deployments().is_active("a1").await);
        assert!(!coord.deployments().is_active("a2").await);
    }
}
