//! Launcher seam — how instances actually start and stop.
//!
//! The reconciler drives lifecycle through this trait so that the
//! process-spawning mechanics stay out of the control loop. Production
//! uses `CommandLauncher` (spawns a configured command per instance);
//! tests and standalone demos use `NullLauncher`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Starts and stops the actual service instances.
#[async_trait]
pub trait InstanceLauncher: Send + Sync {
    /// Launch an instance listening on `host:port`.
    async fn launch(&self, id: &str, host: &str, port: u16) -> anyhow::Result<()>;

    /// Tear an instance down. Must be idempotent: terminating an
    /// already-dead instance is not an error.
    async fn terminate(&self, id: &str, host: &str, port: u16) -> anyhow::Result<()>;
}

/// A launcher that does nothing. For tests and in-process demos where
/// no real service processes exist.
#[derive(Debug, Default)]
pub struct NullLauncher;

#[async_trait]
impl InstanceLauncher for NullLauncher {
    async fn launch(&self, id: &str, host: &str, port: u16) -> anyhow::Result<()> {
        debug!(%id, %host, port, "null launcher: launch");
        Ok(())
    }

    async fn terminate(&self, id: &str, host: &str, port: u16) -> anyhow::Result<()> {
        debug!(%id, %host, port, "null launcher: terminate");
        Ok(())
    }
}

/// Launches instances by spawning a configured command with
/// `--port <port>` appended, and kills the child on terminate.
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    children: Arc<Mutex<HashMap<String, tokio::process::Child>>>,
}

impl CommandLauncher {
    /// `program` plus fixed `args`; the instance port is appended as
    /// `--port <port>` at launch time.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of currently tracked child processes.
    pub async fn child_count(&self) -> usize {
        self.children.lock().await.len()
    }
}

#[async_trait]
impl InstanceLauncher for CommandLauncher {
    async fn launch(&self, id: &str, host: &str, port: u16) -> anyhow::Result<()> {
        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg("--host")
            .arg(host)
            .arg("--port")
            .arg(port.to_string())
            .env("INSTANCE_ID", id)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        info!(%id, %host, port, pid = child.id(), "instance process spawned");
        self.children.lock().await.insert(id.to_string(), child);
        Ok(())
    }

    async fn terminate(&self, id: &str, _host: &str, _port: u16) -> anyhow::Result<()> {
        let child = self.children.lock().await.remove(id);
        match child {
            Some(mut child) => {
                if let Err(e) = child.kill().await {
                    warn!(%id, error = %e, "kill failed (process may have already exited)");
                }
                let _ = child.wait().await;
                info!(%id, "instance process terminated");
            }
            None => debug!(%id, "terminate for unknown child (already gone)"),
        }
        Ok(())
    }
}
