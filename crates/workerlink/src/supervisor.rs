//! Worker process spawning and reaping.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

/// How long to wait for a worker to exit after its output closed or after kill.
pub const REAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub executable: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub current_dir: Option<PathBuf>,
}

impl SpawnConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Extension point for different worker spawn strategies.
///
/// The returned child must have piped stdin and stdout.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &SpawnConfig) -> Result<Child, SpawnError>;
}

/// Spawns the executable directly with piped stdio and inherited stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSpawner;

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, config: &SpawnConfig) -> Result<Child, SpawnError> {
        let mut cmd = Command::new(&config.executable);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &config.current_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn()?;
        tracing::info!(
            executable = %config.executable.display(),
            pid = ?child.id(),
            "Spawned worker"
        );
        Ok(child)
    }
}

/// Waits for the worker to exit, killing it if it lingers. Returns its exit
/// code when one is available.
pub async fn reap(child: &mut Child, timeout: Duration) -> Option<i32> {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Failed to wait for worker");
            None
        }
        Err(_) => {
            tracing::warn!("Worker did not exit in time, killing it");
            kill(child).await;
            None
        }
    }
}

/// Kills the worker if it is still running. Safe after it already exited.
pub async fn kill(child: &mut Child) {
    if let Ok(Some(status)) = child.try_wait() {
        tracing::debug!(?status, "Worker already exited");
        return;
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Failed to kill worker");
        return;
    }
    if let Err(e) = tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        tracing::warn!(error = %e, "Timed out waiting for killed worker");
    }
}
