//! WebSocket endpoint for the host approval channel.
//!
//! At most one peer may be attached at a time; a second upgrade attempt
//! is refused with 409 rather than displacing the first. Outbound
//! frames are [`sandcell_protocol::ApprovalRequestMsg`]; inbound frames
//! are [`sandcell_protocol::ApprovalDecisionMsg`]. Undecodable inbound
//! frames and decisions for unknown IDs are dropped.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use super::ServiceState;
use crate::approval::ApprovalPeer;
use sandcell_protocol::ApprovalDecisionMsg;

pub(crate) async fn handle_approvals(
    State(state): State<ServiceState>,
    ws: WebSocketUpgrade,
) -> Response {
    let peer = match state.approvals.attach() {
        Ok(peer) => peer,
        Err(e) => {
            warn!("Refusing approval channel attach: {}", e);
            return StatusCode::CONFLICT.into_response();
        }
    };
    ws.on_upgrade(move |socket| pump(socket, peer))
}

/// Shuttle messages between the socket and the broker until either side
/// closes. Dropping the peer on exit frees the single attachment slot.
async fn pump(mut socket: WebSocket, mut peer: ApprovalPeer) {
    loop {
        tokio::select! {
            outbound = peer.recv() => {
                let Some(msg) = outbound else { break };
                let Ok(text) = serde_json::to_string(&msg) else {
                    continue;
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ApprovalDecisionMsg>(text.as_str()) {
                            Ok(decision) => {
                                peer.decide(decision.id, decision.decision.is_accept());
                            }
                            Err(e) => {
                                debug!("Dropping undecodable approval frame: {}", e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Approval channel socket error: {}", e);
                        break;
                    }
                }
            }
        }
    }
    debug!("Approval channel peer detached");
}
