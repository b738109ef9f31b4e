//! The kernel message bus.
//!
//! The coordinator treats the kernel as a black box behind this bus: it
//! submits code, receives typed envelopes back, and can signal an
//! interrupt out of band. The production bus is a child process
//! speaking newline-delimited JSON ([`super::process::ProcessBus`]);
//! [`in_process`] provides a loopback pair for embedded kernels and
//! tests.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::errors::{ExecutorError, ExecutorResult};

/// One framed message on the kernel bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Coordinator → kernel: run `code` under submission `id`, after
    /// applying `env` to the kernel's environment.
    Execute {
        id: String,
        code: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    /// Coordinator → kernel: abort the submission `id`.
    Interrupt { id: String },
    /// Coordinator → kernel: liveness probe.
    Ping { seq: u64 },
    /// Kernel → coordinator: liveness reply.
    Pong { seq: u64 },
    /// Kernel → coordinator: a chunk of stream output.
    Stream {
        id: String,
        channel: StreamChannel,
        text: String,
    },
    /// Kernel → coordinator: inline display data, base64-encoded.
    Display {
        id: String,
        media_type: String,
        data: String,
    },
    /// Kernel → coordinator: the submission raised.
    Error {
        id: String,
        name: String,
        message: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
    /// Kernel → coordinator: the submission finished.
    Done { id: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamChannel {
    Stdout,
    Stderr,
}

#[async_trait]
pub trait KernelBus: Send + Sync {
    async fn send(&self, envelope: Envelope) -> ExecutorResult<()>;
    /// Next envelope from the kernel, or `None` once the bus is closed.
    async fn recv(&self) -> Option<Envelope>;
    async fn shutdown(&self);
}

/// Create a loopback bus: the coordinator half and the kernel half.
pub fn in_process(buffer: usize) -> (InProcessBus, KernelHandle) {
    let (to_kernel_tx, to_kernel_rx) = mpsc::channel(buffer);
    let (to_coordinator_tx, to_coordinator_rx) = mpsc::channel(buffer);

    (
        InProcessBus {
            tx: Mutex::new(Some(to_kernel_tx)),
            rx: Mutex::new(to_coordinator_rx),
        },
        KernelHandle {
            rx: to_kernel_rx,
            tx: to_coordinator_tx,
        },
    )
}

/// Coordinator half of a loopback bus.
pub struct InProcessBus {
    tx: Mutex<Option<mpsc::Sender<Envelope>>>,
    rx: Mutex<mpsc::Receiver<Envelope>>,
}

#[async_trait]
impl KernelBus for InProcessBus {
    async fn send(&self, envelope: Envelope) -> ExecutorResult<()> {
        let tx = self
            .tx
            .lock()
            .await
            .clone()
            .ok_or(ExecutorError::KernelLost)?;
        tx.send(envelope)
            .await
            .map_err(|_| ExecutorError::KernelLost)
    }

    async fn recv(&self) -> Option<Envelope> {
        self.rx.lock().await.recv().await
    }

    async fn shutdown(&self) {
        self.tx.lock().await.take();
    }
}

/// Kernel half of a loopback bus.
pub struct KernelHandle {
    rx: mpsc::Receiver<Envelope>,
    tx: mpsc::Sender<Envelope>,
}

impl KernelHandle {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub async fn send(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).await.is_ok()
    }

    pub fn sender(&self) -> mpsc::Sender<Envelope> {
        self.tx.clone()
    }
}
