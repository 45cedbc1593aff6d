//! Host-process launching for the `process` mechanism.
//!
//! Each agent's stdout/stderr go to `<log_dir>/<agent>.log` so an early
//! exit can be explained with the process's own output.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::error::{FleetError, Result};
use crate::model::safe_name;

/// Bytes of captured output reported when a process exits during startup.
const OUTPUT_TAIL_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub agent_name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Added on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessProbe {
    Alive,
    Exited { code: Option<i32>, output: String },
    Missing,
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Spawn the process and return its pid without waiting for it.
    async fn spawn(&self, spec: &ProcessSpec) -> Result<u32>;

    async fn probe(&self, pid: u32) -> ProcessProbe;

    /// Hard-kill the process.
    async fn kill(&self, pid: u32) -> Result<()>;
}

struct Tracked {
    child: Child,
    log_path: PathBuf,
}

pub struct LocalProcessLauncher {
    log_dir: PathBuf,
    children: Mutex<HashMap<u32, Tracked>>,
}

impl LocalProcessLauncher {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn log_path(&self, agent_name: &str) -> PathBuf {
        self.log_dir.join(format!("{}.log", safe_name(agent_name)))
    }
}

#[async_trait]
impl ProcessLauncher for LocalProcessLauncher {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<u32> {
        std::fs::create_dir_all(&self.log_dir)?;
        let log_path = self.log_path(&spec.agent_name);
        let stdout = std::fs::File::create(&log_path)?;
        let stderr = stdout.try_clone()?;

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        let child = cmd.spawn().map_err(|e| {
            FleetError::execution(format!("failed to spawn '{}': {}", spec.command, e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| FleetError::execution("spawned process has no pid"))?;
        tracing::debug!(
            agent = %spec.agent_name,
            pid,
            log = %log_path.display(),
            "spawned agent process"
        );
        self.children
            .lock()
            .await
            .insert(pid, Tracked { child, log_path });
        Ok(pid)
    }

    async fn probe(&self, pid: u32) -> ProcessProbe {
        let mut children = self.children.lock().await;
        if let Some(tracked) = children.get_mut(&pid) {
            return match tracked.child.try_wait() {
                Ok(None) => ProcessProbe::Alive,
                Ok(Some(status)) => {
                    let output = read_tail(&tracked.log_path, OUTPUT_TAIL_BYTES);
                    children.remove(&pid);
                    ProcessProbe::Exited {
                        code: status.code(),
                        output,
                    }
                }
                Err(e) => {
                    tracing::warn!(pid, "try_wait failed: {}", e);
                    children.remove(&pid);
                    ProcessProbe::Missing
                }
            };
        }
        drop(children);
        // Not spawned by this launcher; fall back to a signal-0 existence check.
        match Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) if status.success() => ProcessProbe::Alive,
            _ => ProcessProbe::Missing,
        }
    }

    async fn kill(&self, pid: u32) -> Result<()> {
        let tracked = self.children.lock().await.remove(&pid);
        if let Some(mut tracked) = tracked {
            return tracked
                .child
                .kill()
                .await
                .map_err(|e| FleetError::execution(format!("failed to kill pid {}: {}", pid, e)));
        }
        let status = Command::new("kill")
            .arg("-9")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| FleetError::execution(format!("failed to run kill: {}", e)))?;
        if status.success() {
            Ok(())
        } else {
            Err(FleetError::execution(format!(
                "kill -9 {} exited with {}",
                pid, status
            )))
        }
    }
}

fn read_tail(path: &Path, max: usize) -> String {
    let Ok(bytes) = std::fs::read(path) else {
        return String::new();
    };
    let start = bytes.len().saturating_sub(max);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}
