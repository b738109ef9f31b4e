//! Child-process kernel bus.
//!
//! Spawns the kernel executable inside the workspace and speaks
//! newline-delimited JSON envelopes on its standard streams. The
//! kernel's stderr is inherited so interpreter noise stays visible in
//! the coordinator's logs.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::bus::{Envelope, KernelBus};
use crate::config::KernelSpec;
use crate::errors::{ExecutorError, ExecutorResult};

pub struct ProcessBus {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    lines: Mutex<Lines<BufReader<ChildStdout>>>,
}

impl ProcessBus {
    pub async fn spawn(spec: &KernelSpec, workspace: &Path) -> ExecutorResult<Self> {
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .envs(spec.env.iter())
            .current_dir(workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecutorError::Kernel(format!("spawn kernel '{}': {e}", spec.command))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecutorError::Kernel("kernel stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::Kernel("kernel stdout unavailable".to_string()))?;

        info!(command = %spec.command, "Kernel process started");
        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            lines: Mutex::new(BufReader::new(stdout).lines()),
        })
    }
}

#[async_trait]
impl KernelBus for ProcessBus {
    async fn send(&self, envelope: Envelope) -> ExecutorResult<()> {
        let mut line = serde_json::to_string(&envelope)
            .map_err(|e| ExecutorError::Kernel(format!("encode envelope: {e}")))?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|_| ExecutorError::KernelLost)?;
        stdin.flush().await.map_err(|_| ExecutorError::KernelLost)
    }

    async fn recv(&self) -> Option<Envelope> {
        let mut lines = self.lines.lock().await;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str(line) {
                        Ok(envelope) => return Some(envelope),
                        Err(e) => {
                            warn!("Skipping unparseable kernel line: {}", e);
                        }
                    }
                }
                Ok(None) => return None,
                Err(e) => {
                    warn!("Kernel stdout read failed: {}", e);
                    return None;
                }
            }
        }
    }

    async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            warn!("Failed to kill kernel process: {}", e);
        }
    }
}
