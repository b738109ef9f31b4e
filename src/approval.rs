//! Approval broker: correlates pending tool-call approvals with the
//! decisions delivered by the host.
//!
//! Every request gets a fresh ID and a single-shot decision slot.
//! Exactly one terminal transition happens per request: accepted,
//! rejected, expired (timeout), or cancelled. Late or unknown decisions
//! are silently dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use sandcell_protocol::ApprovalRequestMsg;

const PEER_QUEUE_DEPTH: usize = 16;
const RESOLUTION_FANOUT: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    /// No decision arrived within the approval timeout.
    #[error("approval timed out")]
    Timeout,

    /// The surrounding execution was cancelled while the request was pending.
    #[error("approval cancelled")]
    Cancelled,

    /// No peer is attached to receive approval requests.
    #[error("approval channel closed")]
    ChannelClosed,

    /// A peer is already attached to the approval channel.
    #[error("approval peer already attached")]
    PeerAttached,
}

pub struct ApprovalBroker {
    pending: DashMap<Uuid, oneshot::Sender<bool>>,
    peer: Mutex<Option<(u64, mpsc::Sender<ApprovalRequestMsg>)>>,
    next_peer_id: Mutex<u64>,
    resolved_tx: broadcast::Sender<Uuid>,
    timeout: Option<Duration>,
}

impl ApprovalBroker {
    pub fn new(timeout: Option<Duration>) -> Self {
        let (resolved_tx, _) = broadcast::channel(RESOLUTION_FANOUT);
        Self {
            pending: DashMap::new(),
            peer: Mutex::new(None),
            next_peer_id: Mutex::new(0),
            resolved_tx,
            timeout,
        }
    }

    /// Attach the single peer that receives outbound approval requests.
    ///
    /// The slot frees itself when the returned peer is dropped.
    pub fn attach(self: &Arc<Self>) -> Result<ApprovalPeer, ApprovalError> {
        let mut slot = self.peer.lock();
        if slot.is_some() {
            return Err(ApprovalError::PeerAttached);
        }

        let peer_id = {
            let mut next = self.next_peer_id.lock();
            *next += 1;
            *next
        };
        let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        *slot = Some((peer_id, tx));

        Ok(ApprovalPeer {
            peer_id,
            rx,
            broker: Arc::clone(self),
        })
    }

    fn detach(&self, peer_id: u64) {
        let mut slot = self.peer.lock();
        if slot.as_ref().is_some_and(|(id, _)| *id == peer_id) {
            *slot = None;
        }
    }

    pub fn has_peer(&self) -> bool {
        self.peer.lock().is_some()
    }

    /// Block until the host decides the call. Returns `true` on accept.
    pub async fn request(
        &self,
        provider: &str,
        tool: &str,
        args: Value,
    ) -> Result<bool, ApprovalError> {
        let outbound = self
            .peer
            .lock()
            .as_ref()
            .map(|(_, tx)| tx.clone())
            .ok_or(ApprovalError::ChannelClosed)?;

        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let msg = ApprovalRequestMsg {
            id,
            provider: provider.to_string(),
            tool: tool.to_string(),
            args,
            ts: Utc::now(),
        };
        if outbound.send(msg).await.is_err() {
            self.pending.remove(&id);
            return Err(ApprovalError::ChannelClosed);
        }
        debug!(%id, provider, tool, "Approval requested");

        let decision = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(decision) => decision,
                Err(_) => {
                    // Expired: drop the slot so a late decision is a no-op.
                    self.pending.remove(&id);
                    let _ = self.resolved_tx.send(id);
                    debug!(%id, "Approval expired");
                    return Err(ApprovalError::Timeout);
                }
            },
            None => rx.await,
        };

        match decision {
            Ok(accept) => Ok(accept),
            Err(_) => Err(ApprovalError::Cancelled),
        }
    }

    /// Resolve a pending request. Unknown or already-resolved IDs are
    /// ignored, so double decisions and late decisions are no-ops.
    pub fn decide(&self, id: Uuid, accept: bool) {
        if let Some((_, slot)) = self.pending.remove(&id) {
            let _ = slot.send(accept);
            let _ = self.resolved_tx.send(id);
            debug!(%id, accept, "Approval decided");
        } else {
            debug!(%id, "Decision for unknown approval ignored");
        }
    }

    /// Cancel every pending request. Waiters observe
    /// [`ApprovalError::Cancelled`].
    pub fn cancel_all(&self) {
        let ids: Vec<Uuid> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if self.pending.remove(&id).is_some() {
                let _ = self.resolved_tx.send(id);
                debug!(%id, "Approval cancelled");
            }
        }
    }

    /// Subscribe to terminal transitions (decided, expired, cancelled).
    pub fn subscribe_resolutions(&self) -> broadcast::Receiver<Uuid> {
        self.resolved_tx.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Receiving half of the approval channel, held by exactly one peer.
pub struct ApprovalPeer {
    peer_id: u64,
    rx: mpsc::Receiver<ApprovalRequestMsg>,
    broker: Arc<ApprovalBroker>,
}

impl ApprovalPeer {
    pub async fn recv(&mut self) -> Option<ApprovalRequestMsg> {
        self.rx.recv().await
    }

    pub fn decide(&self, id: Uuid, accept: bool) {
        self.broker.decide(id, accept);
    }
}

impl Drop for ApprovalPeer {
    fn drop(&mut self) {
        self.broker.detach(self.peer_id);
    }
}
