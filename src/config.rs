//! Executor configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Filesystem workspace shared with the kernel process. Generated
    /// tool modules live under `<workspace>/tools`.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,

    /// How to launch the kernel process.
    #[serde(default)]
    pub kernel: KernelSpec,

    /// Milliseconds to wait for a host approval decision.
    /// `None` waits indefinitely.
    #[serde(default)]
    pub approval_timeout_ms: Option<u64>,

    /// Provider connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Kernel heartbeat interval in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Consecutive missed heartbeats before the kernel counts as lost.
    #[serde(default = "default_heartbeat_misses")]
    pub heartbeat_misses: u32,

    /// Seconds to wait for the kernel to wind down after an interrupt.
    #[serde(default = "default_interrupt_grace")]
    pub interrupt_grace_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            kernel: KernelSpec::default(),
            approval_timeout_ms: None,
            connect_timeout_secs: default_connect_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_misses: default_heartbeat_misses(),
            interrupt_grace_secs: default_interrupt_grace(),
        }
    }
}

impl ExecutorConfig {
    pub fn approval_timeout(&self) -> Option<Duration> {
        self.approval_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_secs(self.interrupt_grace_secs)
    }
}

/// Launch description for the kernel child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelSpec {
    #[serde(default = "default_kernel_command")]
    pub command: String,

    #[serde(default = "default_kernel_args")]
    pub args: Vec<String>,

    /// Extra environment for the kernel process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for KernelSpec {
    fn default() -> Self {
        Self {
            command: default_kernel_command(),
            args: default_kernel_args(),
            env: HashMap::new(),
        }
    }
}

fn default_workspace() -> PathBuf {
    PathBuf::from("workspace")
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_heartbeat_misses() -> u32 {
    3
}

fn default_interrupt_grace() -> u64 {
    5
}

fn default_kernel_command() -> String {
    "python3".to_string()
}

fn default_kernel_args() -> Vec<String> {
    vec!["-u".to_string(), "-m".to_string(), "sandcell_kernel".to_string()]
}
