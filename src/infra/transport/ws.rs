//! WebSocket peers.
//!
//! Each socket becomes a [`WsPeer`] bound to the registry. Inbound text
//! frames are parsed as relay frames and routed to dispatchers; hub relays
//! and direct emits are written back out as JSON text frames.

use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use subsocket_wire::RelayFrame;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::hub::Hub;
use crate::application::transport::{InboundListener, ListenerSet, PeerConnection, PeerId};
use crate::infra::http::HttpState;

pub struct WsPeer {
    id: PeerId,
    hub: Hub,
    out: mpsc::UnboundedSender<RelayFrame>,
    listeners: ListenerSet,
}

impl PeerConnection for WsPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn emit(&self, frame: RelayFrame) {
        if self.out.send(frame).is_err() {
            debug!(peer = %self.id, "Emit after socket closed");
        }
    }

    fn broadcast(&self, frame: RelayFrame) {
        self.hub.publish(Some(self.id), frame);
    }

    fn on_any(&self, listener: InboundListener) {
        self.listeners.push(listener);
    }
}

/// `GET /socket`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HttpState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: HttpState) {
    let (out, mut outbox) = mpsc::unbounded_channel();
    let peer = Arc::new(WsPeer {
        id: Uuid::new_v4(),
        hub: state.hub.clone(),
        out,
        listeners: ListenerSet::new(),
    });
    let mut relays = state.hub.subscribe();
    let connection: Arc<dyn PeerConnection> = peer.clone();
    state.registry.bind_transport(&connection);

    info!(peer = %peer.id, "WebSocket connected");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            relay = relays.recv() => match relay {
                Ok(relay) => {
                    if relay.is_for(peer.id) && send_frame(&mut sender, &relay.frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(peer = %peer.id, skipped, "Peer lagged, relays dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!(peer = %peer.id, "Relay hub closed");
                    break;
                }
            },
            Some(frame) = outbox.recv() => {
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<RelayFrame>(text.as_str()) {
                        Ok(frame) => peer.listeners.dispatch(frame).await,
                        Err(err) => {
                            warn!(peer = %peer.id, error = %err, "Malformed frame dropped");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(peer = %peer.id, "Client closed socket");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(peer = %peer.id, error = %err, "WebSocket receive error");
                    break;
                }
            },
        }
    }

    info!(peer = %peer.id, "WebSocket disconnected");
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &RelayFrame,
) -> Result<(), axum::Error> {
    sender.send(Message::Text(frame.to_json().into())).await
}
