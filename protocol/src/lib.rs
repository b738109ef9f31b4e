//! Wire types shared between the tool service, the generated kernel-side
//! client code, and the host approval channel.
//!
//! Two protocols live here:
//!
//! - **Tool service** (`POST /run`): [`RunRequest`] in, [`RunResponse`]
//!   out. Responses are always HTTP 200; failures are carried in the
//!   body so the kernel side can map them onto a single exception type.
//! - **Approval channel** (duplex text messages): [`ApprovalRequestMsg`]
//!   outbound to the host, [`ApprovalDecisionMsg`] inbound.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Body of `POST /run`, issued by generated kernel code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    /// Logical provider name the tool lives on.
    pub provider: String,
    /// Tool name as declared by the provider.
    pub tool: String,
    /// Argument tree, matching the tool's input schema.
    #[serde(default)]
    pub args: Value,
}

/// Body of the `POST /run` response. Always paired with HTTP 200.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl RunResponse {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(RunError {
                kind,
                message: message.into(),
            }),
        }
    }
}

/// Structured error carried in a failed [`RunResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Error taxonomy exposed to kernel code.
///
/// The generated Python preamble raises `ToolCallError(kind, message)`
/// for every variant; user code in the kernel may catch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Arguments did not match the tool's input schema. Not retried.
    Validation,
    /// The host rejected the call.
    ApprovalRejected,
    /// No decision arrived within the approval timeout.
    ApprovalTimeout,
    /// The surrounding execution was cancelled while awaiting approval.
    ApprovalCancelled,
    /// Provider connection or protocol failure, after the one rebuild retry.
    Transport,
    /// The provider reported a tool-level error, relayed verbatim.
    Tool,
    /// Coordinator-side failure that fits no other kind.
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::ApprovalRejected => "approval_rejected",
            ErrorKind::ApprovalTimeout => "approval_timeout",
            ErrorKind::ApprovalCancelled => "approval_cancelled",
            ErrorKind::Transport => "transport",
            ErrorKind::Tool => "tool",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Outbound approval-channel message: one pending tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequestMsg {
    /// Server-chosen ID, never reused within a session.
    pub id: Uuid,
    pub provider: String,
    pub tool: String,
    pub args: Value,
    /// Creation timestamp.
    pub ts: DateTime<Utc>,
}

/// Inbound approval-channel message: the host's decision for one ID.
///
/// Decisions for unknown IDs are silently dropped by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecisionMsg {
    pub id: Uuid,
    pub decision: Decision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Reject,
}

impl Decision {
    pub fn is_accept(self) -> bool {
        matches!(self, Decision::Accept)
    }
}
