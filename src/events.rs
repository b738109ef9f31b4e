//! Events emitted by a streamed execution.

use std::path::PathBuf;
use std::sync::Weak;

use serde_json::Value;
use uuid::Uuid;

use crate::approval::ApprovalBroker;

/// One event on the stream returned by `Executor::stream`.
///
/// Ordering: zero or more chunks and approval requests, then exactly one
/// terminal [`StreamEvent::Result`]. An approval request is never
/// emitted after the terminal event of its stream.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(ExecutionChunk),
    ApprovalRequest(ApprovalRequestEvent),
    Result(ExecutionResult),
}

/// One output fragment, in kernel emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionChunk {
    Stdout(String),
    Stderr(String),
    Image { media_type: String, data: Vec<u8> },
}

/// A pending tool call awaiting the host's decision.
///
/// The event holds only a weak reference to the broker: resolving after
/// the coordinator has moved on (cancelled, expired, reset) is a no-op,
/// not an error.
#[derive(Debug)]
pub struct ApprovalRequestEvent {
    pub id: Uuid,
    pub provider: String,
    pub tool: String,
    pub args: Value,
    pub(crate) broker: Weak<ApprovalBroker>,
}

impl ApprovalRequestEvent {
    pub fn accept(&self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.decide(self.id, true);
        }
    }

    pub fn reject(&self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.decide(self.id, false);
        }
    }
}

/// Terminal outcome of one code submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Accumulated stdout/stderr text, in emission order. `None` when
    /// the submission produced no text at all.
    pub text: Option<String>,
    /// Inline images produced by the kernel.
    pub images: Vec<ImageOutput>,
    /// Error status when the kernel raised.
    pub error: Option<ExecutionError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOutput {
    pub media_type: String,
    pub data: Vec<u8>,
    /// Path under the images directory, when one was configured.
    pub path: Option<PathBuf>,
}

/// Kernel-side error carried in the terminal result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionError {
    pub name: String,
    pub message: String,
    pub traceback: Vec<String>,
}

impl ExecutionError {
    /// True when the kernel aborted because of an interrupt.
    pub fn is_interrupt(&self) -> bool {
        self.name == "KeyboardInterrupt" || self.name == "interrupted"
    }
}
